//! Request interception through the Fetch domain.
//!
//! Every paused request must terminate with exactly one of continue,
//! fulfill or fail. Handlers run in registration order and the first
//! resolution wins; records nobody resolved are continued unchanged by a
//! watchdog after the configured deadline, with a warning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zendriver_cdp::fetch::{
    self, ContinueRequest, ErrorReason, FailRequest, FulfillRequest, HeaderEntry, RequestId,
    RequestPattern, RequestStage,
};
use zendriver_cdp::target::SessionId;
use zendriver_cdp::{CdpEvent, EventKind};

use crate::bus::{BusMessage, EventFilter};
use crate::connection::Connection;
use crate::errors::{Error, ErrorKind, Result};
use crate::tab::Tab;

/// Handler invoked for each paused request. Resolution happens through
/// the record passed in; returning without resolving passes the record to
/// the next handler in line.
pub type InterceptHandler =
    Arc<dyn Fn(RequestPausedRecord) -> BoxFuture<'static, ()> + Send + Sync>;

/// Overrides for continuing a paused request.
#[derive(Clone, Debug, Default)]
pub struct ContinueOverrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub post_data: Option<Vec<u8>>,
    pub headers: Option<Vec<(String, String)>>,
}

/// One paused network request. Clones share resolution state: exactly one
/// of [`continue_request`](Self::continue_request), [`fulfill`](Self::fulfill)
/// or [`fail`](Self::fail) may ever succeed.
#[derive(Clone)]
pub struct RequestPausedRecord {
    inner: Arc<RecordInner>,
}

struct RecordInner {
    request_id: RequestId,
    url: String,
    method: String,
    headers: HashMap<String, String>,
    post_data: Option<String>,
    resource_type: String,
    stage: RequestStage,
    response_status_code: Option<i64>,
    resolved: AtomicBool,
    conn: Connection,
    session: SessionId,
}

impl RequestPausedRecord {
    fn new(event: &fetch::RequestPausedEvent, conn: Connection, session: SessionId) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                request_id: event.request_id.clone(),
                url: event.request.url.clone(),
                method: event.request.method.clone(),
                headers: event.request.headers.clone(),
                post_data: event.request.post_data.clone(),
                resource_type: event.resource_type.clone(),
                stage: event.stage(),
                response_status_code: event.response_status_code,
                resolved: AtomicBool::new(false),
                conn,
                session,
            }),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.inner.request_id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.inner.headers
    }

    pub fn post_data(&self) -> Option<&str> {
        self.inner.post_data.as_deref()
    }

    pub fn resource_type(&self) -> &str {
        &self.inner.resource_type
    }

    pub fn stage(&self) -> RequestStage {
        self.inner.stage
    }

    pub fn response_status_code(&self) -> Option<i64> {
        self.inner.response_status_code
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }

    /// Claim the single resolution slot; a second claim is a local
    /// protocol error and nothing is sent.
    fn claim(&self) -> Result<()> {
        if self.inner.resolved.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::Protocol)
                .with_hint(format!(
                    "request {} already resolved",
                    self.inner.request_id
                )));
        }
        Ok(())
    }

    /// Let the request proceed, optionally rewritten.
    pub async fn continue_request(&self, overrides: Option<ContinueOverrides>) -> Result<()> {
        self.claim()?;
        let overrides = overrides.unwrap_or_default();
        let command = ContinueRequest {
            request_id: self.inner.request_id.clone(),
            url: overrides.url,
            method: overrides.method,
            post_data: overrides.post_data.map(|data| STANDARD.encode(data)),
            headers: overrides.headers.map(|pairs| {
                pairs
                    .into_iter()
                    .map(|(name, value)| HeaderEntry { name, value })
                    .collect()
            }),
        };
        self.inner
            .conn
            .send(command, Some(&self.inner.session))
            .await?;
        Ok(())
    }

    /// Answer the request from local data; it never reaches the network.
    pub async fn fulfill(
        &self,
        status: u16,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<()> {
        self.claim()?;
        let command = FulfillRequest {
            request_id: self.inner.request_id.clone(),
            response_code: status,
            response_phrase: None,
            response_headers: Some(
                headers
                    .iter()
                    .map(|(name, value)| HeaderEntry {
                        name: (*name).to_string(),
                        value: (*value).to_string(),
                    })
                    .collect(),
            ),
            body: Some(STANDARD.encode(body)),
        };
        self.inner
            .conn
            .send(command, Some(&self.inner.session))
            .await?;
        Ok(())
    }

    /// Abort the request with a network error.
    pub async fn fail(&self, reason: ErrorReason) -> Result<()> {
        self.claim()?;
        self.inner
            .conn
            .send(
                FailRequest {
                    request_id: self.inner.request_id.clone(),
                    error_reason: reason,
                },
                Some(&self.inner.session),
            )
            .await?;
        Ok(())
    }
}

/// Live interception for one tab. Dropping it (or calling
/// [`disable`](Self::disable)) stops dispatch; `Fetch.disable` is issued
/// on explicit disable.
pub struct Interceptor {
    inner: Arc<InterceptorInner>,
}

struct InterceptorInner {
    conn: Connection,
    session: SessionId,
    handlers: Mutex<Vec<InterceptHandler>>,
    auto_continue_after: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Interceptor {
    pub(crate) async fn install(tab: Tab, patterns: Vec<RequestPattern>) -> Result<Interceptor> {
        let session = tab.session().await?;
        let conn = tab.connection().clone();

        // Subscribe before enabling so no pause can slip past dispatch.
        let mut sub = conn.subscribe(EventFilter::session(
            EventKind::RequestPaused,
            session.clone(),
        ));
        conn.send(
            fetch::Enable {
                patterns,
                handle_auth_requests: None,
            },
            Some(&session),
        )
        .await?;

        let inner = Arc::new(InterceptorInner {
            conn: conn.clone(),
            session: session.clone(),
            handlers: Mutex::new(Vec::new()),
            auto_continue_after: tab.config().auto_continue_timeout(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let dispatch_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_inner.shutdown.cancelled() => break,
                    message = sub.next() => match message {
                        None => break,
                        Some(BusMessage::DroppedEvents(n)) => {
                            warn!(
                                target: "zendriver::fetch",
                                count = n,
                                "interception fell behind; paused requests were dropped"
                            );
                        }
                        Some(BusMessage::Event(event)) => {
                            if let CdpEvent::RequestPaused(paused) = event.event.as_ref() {
                                let record = RequestPausedRecord::new(
                                    paused,
                                    dispatch_inner.conn.clone(),
                                    dispatch_inner.session.clone(),
                                );
                                dispatch_inner.deliver(record).await;
                            }
                        }
                    }
                }
            }
        });
        *inner.task.lock() = Some(task);

        Ok(Interceptor { inner })
    }

    /// Register a handler. Handlers run in registration order; the first
    /// one to resolve the record wins and later handlers never see it.
    pub fn on(&self, handler: InterceptHandler) {
        self.inner.handlers.lock().push(handler);
    }

    /// Stop interception: `Fetch.disable` plus dispatch teardown.
    pub async fn disable(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner
            .conn
            .send(fetch::Disable::default(), Some(&self.inner.session))
            .await?;
        Ok(())
    }
}

impl InterceptorInner {
    async fn deliver(&self, record: RequestPausedRecord) {
        // Watchdog: whatever the handlers do, the record terminates.
        let watchdog_record = record.clone();
        let deadline = self.auto_continue_after;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if watchdog_record.is_resolved() {
                return;
            }
            warn!(
                target: "zendriver::fetch",
                url = watchdog_record.url(),
                "paused request unresolved past deadline; auto-continuing"
            );
            if let Err(err) = watchdog_record.continue_request(None).await {
                // A handler may have raced the claim; that is fine.
                debug!(target: "zendriver::fetch", %err, "auto-continue skipped");
            }
        });

        let handlers: Vec<InterceptHandler> = self.handlers.lock().clone();
        if handlers.is_empty() {
            debug!(
                target: "zendriver::fetch",
                url = record.url(),
                "paused request has no handlers"
            );
            return;
        }
        for handler in handlers {
            handler(record.clone()).await;
            if record.is_resolved() {
                break;
            }
        }
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_overrides_default_to_unchanged() {
        let overrides = ContinueOverrides::default();
        assert!(overrides.url.is_none());
        assert!(overrides.method.is_none());
        assert!(overrides.post_data.is_none());
        assert!(overrides.headers.is_none());
    }
}
