//! `Browser` domain: version, permissions and shutdown.

use serde::{Deserialize, Serialize};

use crate::{Command, EmptyResponse};

#[derive(Clone, Debug, Default, Serialize)]
pub struct GetVersion {}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVersionResponse {
    pub protocol_version: String,
    pub product: String,
    pub revision: String,
    pub user_agent: String,
    pub js_version: String,
}

impl Command for GetVersion {
    const METHOD: &'static str = "Browser.getVersion";
    type Response = GetVersionResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Close {}

impl Command for Close {
    const METHOD: &'static str = "Browser.close";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantPermissions {
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Command for GrantPermissions {
    const METHOD: &'static str = "Browser.grantPermissions";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPermissions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Command for ResetPermissions {
    const METHOD: &'static str = "Browser.resetPermissions";
    type Response = EmptyResponse;
}
