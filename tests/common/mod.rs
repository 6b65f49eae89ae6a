//! In-process WebSocket server speaking scripted CDP, standing in for a
//! real browser endpoint.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Async responder: `(id, method, params, session_id)` to the frames the
/// server should send back (reply first, then any events).
pub type Responder = Arc<
    dyn Fn(i64, String, Value, Option<String>) -> BoxFuture<'static, Vec<Value>> + Send + Sync,
>;

pub struct LoopbackBrowser {
    pub url: String,
    /// Every frame the client sent: `(method, params, session_id)`.
    pub received: Arc<Mutex<Vec<(String, Value, Option<String>)>>>,
    /// Push a server-initiated frame (an event) to the client.
    pub push: mpsc::UnboundedSender<Value>,
}

impl LoopbackBrowser {
    pub fn sent(&self, method: &str) -> Vec<(Value, Option<String>)> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _, _)| m == method)
            .map(|(_, params, session)| (params.clone(), session.clone()))
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.sent(method).len()
    }

    pub fn push_event(&self, method: &str, params: Value, session: Option<&str>) {
        let _ = self.push.send(event(method, params, session));
    }
}

pub fn reply(id: i64, result: Value) -> Value {
    json!({"id": id, "result": result})
}

pub fn reply_err(id: i64, code: i64, message: &str) -> Value {
    json!({"id": id, "error": {"code": code, "message": message}})
}

pub fn event(method: &str, params: Value, session: Option<&str>) -> Value {
    match session {
        Some(session) => json!({"method": method, "params": params, "sessionId": session}),
        None => json!({"method": method, "params": params}),
    }
}

pub fn page_target(id: &str, url: &str) -> Value {
    json!({
        "targetId": id,
        "type": "page",
        "title": "",
        "url": url,
        "attached": false
    })
}

/// Handles the bootstrap traffic every `Browser::connect` produces, plus
/// sane defaults for session setup. Methods the `custom` closure answers
/// (by returning `Some`) take precedence.
pub fn browser_responder<F>(custom: F) -> Responder
where
    F: Fn(i64, &str, &Value, Option<&str>) -> Option<Vec<Value>> + Send + Sync + 'static,
{
    Arc::new(move |id, method, params, session| {
        let frames = custom(id, &method, &params, session.as_deref());
        async move {
            if let Some(frames) = frames {
                return frames;
            }
            match method.as_str() {
                "Target.setDiscoverTargets" => vec![reply(id, json!({}))],
                "Target.getTargets" => vec![reply(
                    id,
                    json!({"targetInfos": [page_target("T1", "about:blank")]}),
                )],
                "Target.attachToTarget" => {
                    let target_id = params["targetId"].as_str().unwrap_or("T1").to_string();
                    vec![
                        reply(id, json!({"sessionId": "S1"})),
                        event(
                            "Target.attachedToTarget",
                            json!({
                                "sessionId": "S1",
                                "targetInfo": page_target(&target_id, "about:blank"),
                                "waitingForDebugger": false
                            }),
                            None,
                        ),
                    ]
                }
                // Never respond; used to leave a call pending on purpose.
                "Test.hang" => Vec::new(),
                _ => vec![reply(id, json!({}))],
            }
        }
        .boxed()
    })
}

/// Bind a loopback server for a single connection and run it with the
/// given responder.
pub async fn spawn_loopback(responder: Responder) -> LoopbackBrowser {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");
    let received: Arc<Mutex<Vec<(String, Value, Option<String>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let (push, mut push_rx) = mpsc::unbounded_channel::<Value>();

    let log = Arc::clone(&received);
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        let (mut sink, mut source) = socket.split();
        loop {
            tokio::select! {
                pushed = push_rx.recv() => match pushed {
                    Some(frame) => {
                        if sink.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let value: Value = match serde_json::from_str(&text) {
                            Ok(value) => value,
                            Err(_) => continue,
                        };
                        let id = value["id"].as_i64().unwrap_or(-1);
                        let method = value["method"].as_str().unwrap_or("").to_string();
                        let params = value.get("params").cloned().unwrap_or(Value::Null);
                        let session = value
                            .get("sessionId")
                            .and_then(|s| s.as_str())
                            .map(String::from);
                        log.lock().unwrap().push((
                            method.clone(),
                            params.clone(),
                            session.clone(),
                        ));
                        for frame in responder(id, method, params, session).await {
                            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                },
            }
        }
    });

    LoopbackBrowser {
        url,
        received,
        push,
    }
}
