//! The connection engine: one WebSocket to the browser's debugger
//! endpoint, multiplexing request/response pairs and the event stream.
//!
//! Task topology per connection: a dedicated reader owns the socket read
//! half and is the sole completer of in-flight waiters; a dedicated writer
//! drains a bounded queue into the write half. Senders only insert into
//! the in-flight table. On socket failure every pending waiter resolves
//! with a connection-closed error and the bus terminates; nothing is lost
//! silently.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zendriver_cdp::target::{SessionId, TargetId};
use zendriver_cdp::{self as cdp, CdpEvent, Command, Frame};

use crate::bus::{
    AsyncEventHandler, EventBus, EventFilter, EventHandler, HandlerId, Subscription,
};
use crate::errors::{Error, ErrorKind, Result};
use crate::session::SessionRouter;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const WRITE_QUEUE_CAPACITY: usize = 64;

const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// A live, cheaply clonable handle to one debugger connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: String,
    /// Target this connection is pinned to; `None` for the browser root.
    pinned: Option<TargetId>,
    state: AtomicU8,
    next_id: AtomicI64,
    inflight: DashMap<i64, oneshot::Sender<Result<Value>>>,
    /// Ids whose waiter was cancelled; late replies for these are expected.
    cancelled: DashSet<i64>,
    write_tx: mpsc::Sender<Message>,
    bus: EventBus,
    router: SessionRouter,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to the browser root endpoint and start the reader loop.
    pub async fn open(endpoint: impl Into<String>) -> Result<Connection> {
        Self::open_pinned(endpoint, None).await
    }

    /// Connect to an endpoint pinned to a specific target.
    pub async fn open_pinned(
        endpoint: impl Into<String>,
        pinned: Option<TargetId>,
    ) -> Result<Connection> {
        let endpoint = endpoint.into();
        let (socket, _) = connect_async(&endpoint).await.map_err(|err| {
            Error::new(ErrorKind::Connect).with_hint(format!("{endpoint}: {err}"))
        })?;
        let (sink, stream) = socket.split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);

        let inner = Arc::new(ConnectionInner {
            endpoint,
            pinned,
            state: AtomicU8::new(STATE_OPEN),
            next_id: AtomicI64::new(0),
            inflight: DashMap::new(),
            cancelled: DashSet::new(),
            write_tx,
            bus: EventBus::new(),
            router: SessionRouter::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(Arc::clone(&inner), sink, write_rx));
        let reader = tokio::spawn(read_loop(Arc::clone(&inner), stream));
        inner.tasks.lock().extend([writer, reader]);

        debug!(target: "zendriver::connection", endpoint = %inner.endpoint, "connection open");
        Ok(Connection { inner })
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn pinned_target(&self) -> Option<&TargetId> {
        self.inner.pinned.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_OPEN
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn router(&self) -> &SessionRouter {
        &self.inner.router
    }

    /// Send a typed command, optionally scoped to a session, and suspend
    /// until the matching reply arrives.
    pub async fn send<C: Command>(
        &self,
        command: C,
        session: Option<&SessionId>,
    ) -> Result<C::Response> {
        let id = self.next_call_id();
        let text = cdp::encode_call(id, &command, session.map(|s| s.0.as_str()))?;
        let value = self.roundtrip(id, C::METHOD, session, text).await?;
        serde_json::from_value(value.clone()).map_err(|err| {
            Error::new(ErrorKind::Protocol)
                .with_method(C::METHOD)
                .with_hint(format!("undecodable result: {err}"))
                .with_data(value)
        })
    }

    /// Send an untyped command. Used where the payload is assembled
    /// dynamically.
    pub async fn send_raw(
        &self,
        method: &str,
        params: Value,
        session: Option<&SessionId>,
    ) -> Result<Value> {
        let id = self.next_call_id();
        let text = cdp::encode_raw(id, method, &params, session.map(|s| s.0.as_str()))?;
        self.roundtrip(id, method, session, text).await
    }

    /// `send` with a deadline. On expiry the waiter is removed from the
    /// in-flight table and a timeout error is returned.
    pub async fn send_with_timeout<C: Command>(
        &self,
        command: C,
        session: Option<&SessionId>,
        timeout: Duration,
    ) -> Result<C::Response> {
        match tokio::time::timeout(timeout, self.send(command, session)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::Timeout).with_method(C::METHOD)),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.inner.bus.subscribe(filter)
    }

    pub fn add_handler(&self, filter: EventFilter, handler: EventHandler) -> HandlerId {
        self.inner.bus.add_handler(filter, handler)
    }

    pub fn add_async_handler(
        &self,
        filter: EventFilter,
        handler: AsyncEventHandler,
    ) -> HandlerId {
        self.inner.bus.add_async_handler(filter, handler)
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.inner.bus.remove_handler(id);
    }

    /// Graceful shutdown: refuse new sends, fail in-flight waiters, close
    /// the socket and wait for both socket tasks to finish.
    pub async fn close(&self) {
        let prev = self.inner.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if prev.is_err() {
            // Already closing or closed.
            return;
        }

        let _ = self.inner.write_tx.try_send(Message::Close(None));
        self.inner.fail("connection closed");

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
        debug!(target: "zendriver::connection", endpoint = %self.inner.endpoint, "connection closed");
    }

    fn next_call_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn roundtrip(
        &self,
        id: i64,
        method: &str,
        session: Option<&SessionId>,
        text: String,
    ) -> Result<Value> {
        let context = |mut err: Error| {
            err = err.with_method(method);
            if let Some(session) = session {
                err = err.with_session(session.clone());
            }
            err
        };

        if self.inner.state.load(Ordering::Acquire) != STATE_OPEN {
            return Err(context(Error::new(ErrorKind::ConnectionClosed)));
        }

        let (tx, rx) = oneshot::channel();
        self.inner.inflight.insert(id, tx);
        let mut guard = InflightGuard {
            id,
            inner: Arc::downgrade(&self.inner),
            armed: true,
        };

        // A failure may have drained the table between the state check and
        // the insert; never leave a waiter behind on a dead connection.
        if self.inner.state.load(Ordering::Acquire) == STATE_CLOSED {
            self.inner.inflight.remove(&id);
            guard.armed = false;
            return Err(context(Error::new(ErrorKind::ConnectionClosed)));
        }

        if self
            .inner
            .write_tx
            .send(Message::Text(text))
            .await
            .is_err()
        {
            return Err(context(
                Error::new(ErrorKind::ConnectionClosed).with_hint("writer task gone"),
            ));
        }

        let outcome = match rx.await {
            Ok(result) => result,
            // Sender dropped without a value: the connection failed while
            // we were suspended and the drain already consumed the entry.
            Err(_) => Err(Error::new(ErrorKind::ConnectionClosed)),
        };
        guard.armed = false;
        outcome.map_err(context)
    }
}

/// Removes an abandoned waiter when the `roundtrip` future is dropped
/// before completion (caller-side cancellation or timeout).
struct InflightGuard {
    id: i64,
    inner: Weak<ConnectionInner>,
    armed: bool,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            if inner.inflight.remove(&self.id).is_some() {
                inner.cancelled.insert(self.id);
                debug!(target: "zendriver::connection", id = self.id, "pending call cancelled");
            }
        }
    }
}

impl ConnectionInner {
    /// Terminal transition: fail every in-flight waiter and shut the bus.
    /// Idempotent.
    fn fail(&self, hint: &str) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            return;
        }
        self.shutdown.cancel();

        let ids: Vec<i64> = self.inflight.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.inflight.remove(&id) {
                let _ = tx.send(Err(
                    Error::new(ErrorKind::ConnectionClosed).with_hint(hint.to_string())
                ));
            }
        }
        self.cancelled.clear();
        self.bus.terminate();
    }

    /// Route one inbound frame. Runs on the reader task, which is the only
    /// place the in-flight table is completed from.
    fn handle_frame(&self, text: &str) {
        match cdp::decode_frame(text) {
            Ok(Frame::Reply(reply)) => match self.inflight.remove(&reply.id) {
                Some((_, tx)) => {
                    let outcome = match (reply.result, reply.error) {
                        (_, Some(err)) => Err(Error::new(ErrorKind::Protocol)
                            .with_code(err.code)
                            .with_hint(err.message)
                            .with_data(err.data.unwrap_or(Value::Null))),
                        (Some(result), None) => Ok(result),
                        // Replies always carry a result object; tolerate
                        // its absence with an empty one so typed empty
                        // responses still decode.
                        (None, None) => Ok(Value::Object(serde_json::Map::new())),
                    };
                    if tx.send(outcome).is_err() {
                        debug!(
                            target: "zendriver::connection",
                            id = reply.id,
                            "reply arrived for a dropped waiter"
                        );
                    }
                }
                None => {
                    if self.cancelled.remove(&reply.id).is_some() {
                        debug!(
                            target: "zendriver::connection",
                            id = reply.id,
                            "late reply for cancelled call dropped"
                        );
                    } else {
                        warn!(
                            target: "zendriver::connection",
                            id = reply.id,
                            "orphan reply dropped"
                        );
                    }
                }
            },
            Ok(Frame::Event(frame)) => match CdpEvent::parse(&frame.method, frame.params) {
                Ok(event) => {
                    let event = Arc::new(event);
                    // Session bookkeeping happens before publication so
                    // that routing for a detached session has already
                    // ceased when its notification reaches subscribers.
                    match &*event {
                        CdpEvent::AttachedToTarget(ev) => self
                            .router
                            .note_attached(ev.session_id.clone(), ev.target_info.target_id.clone()),
                        CdpEvent::DetachedFromTarget(ev) => {
                            self.router.note_detached(&ev.session_id)
                        }
                        CdpEvent::TargetDestroyed(ev) => self.router.forget_target(&ev.target_id),
                        CdpEvent::TargetCrashed(ev) => self.router.forget_target(&ev.target_id),
                        _ => {}
                    }
                    if let Some(tagged) = self.router.tag(event, frame.session_id) {
                        self.bus.publish(tagged);
                    }
                }
                Err(err) => {
                    warn!(
                        target: "zendriver::connection",
                        method = %frame.method,
                        %err,
                        "undecodable event dropped"
                    );
                }
            },
            Err(err) => {
                warn!(target: "zendriver::connection", %err, "unparseable frame dropped");
            }
        }
    }
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Message>,
) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                // Flush whatever is still queued, the close frame included.
                while let Ok(message) = rx.try_recv() {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                break;
            }
            message = rx.recv() => match message {
                Some(message) => {
                    let is_close = matches!(message, Message::Close(_));
                    if let Err(err) = sink.send(message).await {
                        warn!(target: "zendriver::connection", %err, "socket write failed");
                        inner.fail("socket write failed");
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<ConnectionInner>, mut stream: WsStream) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => inner.handle_frame(&text),
                Some(Ok(Message::Close(_))) | None => {
                    inner.fail("connection closed by peer");
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/pong/binary frames carry nothing for CDP.
                }
                Some(Err(err)) => {
                    warn!(target: "zendriver::connection", %err, "socket read failed");
                    inner.fail("socket read failed");
                    break;
                }
            },
        }
    }
}
