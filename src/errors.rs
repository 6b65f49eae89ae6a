//! Error taxonomy for the driver.
//!
//! Every failure carries a kind plus whatever structured context was known
//! at the failure site: the CDP method, the session and target involved,
//! the raw protocol code/message. Errors surface on the awaitable that
//! caused them and never travel through the event bus.

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use zendriver_cdp::target::{SessionId, TargetId};
use zendriver_cdp::CodecError;

/// High-level failure categories.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ErrorKind {
    #[error("could not establish devtools connection")]
    Connect,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol error")]
    Protocol,
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("target is gone")]
    TargetGone,
    #[error("stale element handle")]
    StaleElement,
    #[error("element is not interactable")]
    ElementNotInteractable,
    #[error("navigation superseded")]
    NavigationSuperseded,
    #[error("invalid configuration")]
    Config,
}

/// Driver error with structured context.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    method: Option<String>,
    session_id: Option<SessionId>,
    target_id: Option<TargetId>,
    code: Option<i64>,
    hint: Option<String>,
    data: Option<Value>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            method: None,
            session_id: None,
            target_id: None,
            code: None,
            hint: None,
            data: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session_id = Some(session);
        self
    }

    pub fn with_target(mut self, target: TargetId) -> Self {
        self.target_id = Some(target);
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn target_id(&self) -> Option<&TargetId> {
        self.target_id.as_ref()
    }

    /// Raw CDP error code, when the failure came off the wire.
    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.kind == ErrorKind::ConnectionClosed
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {hint}")?;
        }
        if let Some(method) = &self.method {
            write!(f, " (method {method})")?;
        }
        if let Some(code) = self.code {
            write!(f, " [code {code}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        let raw = match &err {
            CodecError::Decode { raw, .. } | CodecError::Shape { raw } => {
                Some(Value::String(raw.clone()))
            }
            CodecError::Encode { .. } => None,
        };
        let mut out = Error::new(ErrorKind::Protocol).with_hint(err.to_string());
        if let Some(raw) = raw {
            out = out.with_data(raw);
        }
        out
    }
}
