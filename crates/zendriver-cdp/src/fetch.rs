//! `Fetch` domain: pausing, rewriting and fabricating network requests.

use serde::{Deserialize, Serialize};

use crate::network::Request;
use crate::{Command, EmptyResponse};

/// Fetch-scoped request identifier (distinct from `network::RequestId`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RequestStage {
    Request,
    Response,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPattern {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_stage: Option<RequestStage>,
}

impl RequestPattern {
    pub fn url(pattern: impl Into<String>) -> Self {
        Self {
            url_pattern: Some(pattern.into()),
            resource_type: None,
            request_stage: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

/// Network-level failure reasons accepted by `Fetch.failRequest`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorReason {
    Failed,
    Aborted,
    TimedOut,
    AccessDenied,
    ConnectionClosed,
    ConnectionReset,
    ConnectionRefused,
    ConnectionAborted,
    ConnectionFailed,
    NameNotResolved,
    InternetDisconnected,
    AddressUnreachable,
    BlockedByClient,
    BlockedByResponse,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enable {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<RequestPattern>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_auth_requests: Option<bool>,
}

impl Command for Enable {
    const METHOD: &'static str = "Fetch.enable";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Disable {}

impl Command for Disable {
    const METHOD: &'static str = "Fetch.disable";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueRequest {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Base64-encoded body override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HeaderEntry>>,
}

impl ContinueRequest {
    pub fn unchanged(request_id: RequestId) -> Self {
        Self {
            request_id,
            url: None,
            method: None,
            post_data: None,
            headers: None,
        }
    }
}

impl Command for ContinueRequest {
    const METHOD: &'static str = "Fetch.continueRequest";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillRequest {
    pub request_id: RequestId,
    pub response_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<HeaderEntry>>,
    /// Base64-encoded response body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Command for FulfillRequest {
    const METHOD: &'static str = "Fetch.fulfillRequest";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRequest {
    pub request_id: RequestId,
    pub error_reason: ErrorReason,
}

impl Command for FailRequest {
    const METHOD: &'static str = "Fetch.failRequest";
    type Response = EmptyResponse;
}

// Events.

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPausedEvent {
    pub request_id: RequestId,
    pub request: Request,
    #[serde(default)]
    pub frame_id: Option<String>,
    pub resource_type: String,
    #[serde(default)]
    pub response_error_reason: Option<String>,
    #[serde(default)]
    pub response_status_code: Option<i64>,
    #[serde(default)]
    pub response_status_text: Option<String>,
    #[serde(default)]
    pub network_id: Option<crate::network::RequestId>,
}

impl RequestPausedEvent {
    /// Response-stage pauses carry either a status code or an error reason.
    pub fn stage(&self) -> RequestStage {
        if self.response_status_code.is_some() || self.response_error_reason.is_some() {
            RequestStage::Response
        } else {
            RequestStage::Request
        }
    }
}
