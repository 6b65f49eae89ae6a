//! `Storage` domain: browser-wide cookie access.

use serde::{Deserialize, Serialize};

use crate::network::{Cookie, CookieParam};
use crate::{Command, EmptyResponse};

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCookies {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_context_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GetCookiesResponse {
    pub cookies: Vec<Cookie>,
}

impl Command for GetCookies {
    const METHOD: &'static str = "Storage.getCookies";
    type Response = GetCookiesResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCookies {
    pub cookies: Vec<CookieParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_context_id: Option<String>,
}

impl Command for SetCookies {
    const METHOD: &'static str = "Storage.setCookies";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCookies {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_context_id: Option<String>,
}

impl Command for ClearCookies {
    const METHOD: &'static str = "Storage.clearCookies";
    type Response = EmptyResponse;
}
