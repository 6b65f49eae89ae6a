//! Typed Chrome DevTools Protocol surface for zendriver.
//!
//! This crate is the only place that touches the CDP wire format. It holds
//! the frame codec (`encode_call` / `decode_frame`), one parameter record per
//! command with its typed result, and the [`CdpEvent`] sum type with a
//! fieldless [`EventKind`] discriminant used for subscription matching.
//!
//! The codec is pure and stateless. Unknown fields are ignored on decode and
//! absent optional fields decode to `None`; decode failures carry the raw
//! payload so callers can log or surface it.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod browser;
pub mod dom;
pub mod event;
pub mod fetch;
pub mod input;
pub mod network;
pub mod page;
pub mod runtime;
pub mod storage;
pub mod target;

pub use event::{CdpEvent, EventKind};

/// Raised when a wire payload cannot be encoded or decoded.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {method}: {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed frame: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        raw: String,
    },
    #[error("frame is neither a reply nor an event")]
    Shape { raw: String },
}

/// A CDP command: a serializable parameter record tied to its method name
/// and typed result.
pub trait Command: Serialize {
    const METHOD: &'static str;
    type Response: DeserializeOwned;
}

/// Commands whose result object carries no fields of interest.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EmptyResponse {}

/// The `error` object of a failed reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CdpError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A reply frame: correlates to a call by `id`.
#[derive(Clone, Debug, Deserialize)]
pub struct Reply {
    pub id: i64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<CdpError>,
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

/// An event frame, not yet parsed into a typed [`CdpEvent`].
#[derive(Clone, Debug, Deserialize)]
pub struct EventFrame {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Everything the browser can send us.
#[derive(Clone, Debug)]
pub enum Frame {
    Reply(Reply),
    Event(EventFrame),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallFrame<'a, P: Serialize> {
    id: i64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a P>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Marshal a typed command into an outbound frame.
pub fn encode_call<C: Command>(
    id: i64,
    command: &C,
    session_id: Option<&str>,
) -> Result<String, CodecError> {
    serde_json::to_string(&CallFrame {
        id,
        method: C::METHOD,
        params: Some(command),
        session_id,
    })
    .map_err(|source| CodecError::Encode {
        method: C::METHOD.to_string(),
        source,
    })
}

/// Marshal an untyped command. `Value::Null` params are omitted.
pub fn encode_raw(
    id: i64,
    method: &str,
    params: &Value,
    session_id: Option<&str>,
) -> Result<String, CodecError> {
    let params = if params.is_null() { None } else { Some(params) };
    serde_json::to_string(&CallFrame {
        id,
        method,
        params,
        session_id,
    })
    .map_err(|source| CodecError::Encode {
        method: method.to_string(),
        source,
    })
}

/// Classify and parse one inbound frame.
pub fn decode_frame(raw: &str) -> Result<Frame, CodecError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| CodecError::Decode {
        source,
        raw: raw.to_string(),
    })?;

    if value.get("id").is_some() {
        let reply: Reply =
            serde_json::from_value(value).map_err(|source| CodecError::Decode {
                source,
                raw: raw.to_string(),
            })?;
        return Ok(Frame::Reply(reply));
    }

    if value.get("method").is_some() {
        let event: EventFrame =
            serde_json::from_value(value).map_err(|source| CodecError::Decode {
                source,
                raw: raw.to_string(),
            })?;
        return Ok(Frame::Event(event));
    }

    Err(CodecError::Shape {
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_typed_call_with_session() {
        let cmd = page::Navigate {
            url: "https://example.com".into(),
            referrer: None,
            transition_type: None,
        };
        let text = encode_call(7, &cmd, Some("SID")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "Page.navigate");
        assert_eq!(value["params"]["url"], "https://example.com");
        assert_eq!(value["sessionId"], "SID");
        assert!(value["params"].get("referrer").is_none());
    }

    #[test]
    fn encodes_raw_call_without_params() {
        let text = encode_raw(1, "Browser.getVersion", &Value::Null, None).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("params").is_none());
        assert!(value.get("sessionId").is_none());
    }

    #[test]
    fn decodes_reply_with_error() {
        let raw = r#"{"id":3,"error":{"code":-32000,"message":"nope"}}"#;
        match decode_frame(raw).unwrap() {
            Frame::Reply(reply) => {
                assert_eq!(reply.id, 3);
                let err = reply.error.unwrap();
                assert_eq!(err.code, -32000);
                assert_eq!(err.message, "nope");
                assert!(err.data.is_none());
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn decodes_event_with_session() {
        let raw = r#"{"method":"Page.frameStoppedLoading","params":{"frameId":"F"},"sessionId":"S"}"#;
        match decode_frame(raw).unwrap() {
            Frame::Event(ev) => {
                assert_eq!(ev.method, "Page.frameStoppedLoading");
                assert_eq!(ev.session_id.as_deref(), Some("S"));
                assert_eq!(ev.params["frameId"], "F");
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn rejects_shapeless_frame() {
        assert!(matches!(
            decode_frame(r#"{"result":{}}"#),
            Err(CodecError::Shape { .. })
        ));
        assert!(matches!(
            decode_frame("not json"),
            Err(CodecError::Decode { .. })
        ));
    }

    #[test]
    fn roundtrips_call_frame() {
        // encode(decode(frame)) == frame modulo optional-field defaults.
        let original = json!({
            "id": 42,
            "method": "DOM.querySelector",
            "params": {"nodeId": 1, "selector": "#main"},
            "sessionId": "S9"
        });
        let text = encode_raw(
            42,
            "DOM.querySelector",
            &original["params"],
            Some("S9"),
        )
        .unwrap();
        let reparsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed, original);
    }
}
