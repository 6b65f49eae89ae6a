//! The user-facing handle for a page target.
//!
//! A `Tab` is cheap to clone and survives same-target reattach; once the
//! underlying target is destroyed every operation fails with a
//! target-gone error. Commands go out scoped to the tab's session, which
//! is attached lazily on first use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use zendriver_cdp::page::FrameId;
use zendriver_cdp::target::{SessionId, TargetId, TargetInfo};
use zendriver_cdp::{dom, input, network, page, runtime, target, CdpEvent, Command, EventKind};

use crate::bus::{BusMessage, EventFilter};
use crate::config::{Config, TypingMode};
use crate::connection::Connection;
use crate::element::Element;
use crate::errors::{Error, ErrorKind, Result};
use crate::fetch::Interceptor;
use crate::keys;
use crate::targets::TargetRegistry;
use crate::values::{self, RemoteValue};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const MAIN_FRAME_GRACE: Duration = Duration::from_secs(1);

/// Script installed in expert mode so closed shadow roots stay reachable.
const OPEN_SHADOW_ROOTS: &str = r#"
Element.prototype._attachShadow = Element.prototype.attachShadow;
Element.prototype.attachShadow = function () {
    return this._attachShadow({ mode: "open" });
};
"#;

#[derive(Clone)]
pub struct Tab {
    inner: Arc<TabInner>,
}

struct TabInner {
    target_id: TargetId,
    conn: Connection,
    registry: TargetRegistry,
    config: Arc<Config>,
    prepared: OnceCell<()>,
    nav: Mutex<Option<NavSlot>>,
    nav_epoch: AtomicU64,
}

struct NavSlot {
    epoch: u64,
    token: CancellationToken,
}

impl Tab {
    pub(crate) fn new(
        target_id: TargetId,
        conn: Connection,
        registry: TargetRegistry,
        config: Arc<Config>,
    ) -> Self {
        Self {
            inner: Arc::new(TabInner {
                target_id,
                conn,
                registry,
                config,
                prepared: OnceCell::new(),
                nav: Mutex::new(None),
                nav_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn target_id(&self) -> &TargetId {
        &self.inner.target_id
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Current target info snapshot, if the target is still alive.
    pub fn info(&self) -> Option<TargetInfo> {
        self.inner.registry.get(&self.inner.target_id)
    }

    pub fn url(&self) -> Option<String> {
        self.info().map(|info| info.url)
    }

    pub fn title(&self) -> Option<String> {
        self.info().map(|info| info.title)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.inner.registry.is_destroyed(&self.inner.target_id) {
            return Err(
                Error::new(ErrorKind::TargetGone).with_target(self.inner.target_id.clone())
            );
        }
        if !self.inner.conn.is_open() {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }
        Ok(())
    }

    fn annotate(&self, err: Error) -> Error {
        if self.inner.registry.is_destroyed(&self.inner.target_id) && !err.is_closed() {
            return Error::new(ErrorKind::TargetGone).with_target(self.inner.target_id.clone());
        }
        err.with_target(self.inner.target_id.clone())
    }

    /// The tab's session id, attaching on first use. Attachment is
    /// idempotent; concurrent callers share one in-flight attach.
    pub async fn session(&self) -> Result<SessionId> {
        self.ensure_alive()?;
        let session = self
            .inner
            .conn
            .router()
            .attach(&self.inner.conn, &self.inner.target_id)
            .await
            .map_err(|err| self.annotate(err))?;
        self.prepare(&session).await?;
        Ok(session)
    }

    /// One-shot per tab: enable page events and apply headless/expert
    /// camouflage from the configuration.
    async fn prepare(&self, session: &SessionId) -> Result<()> {
        let inner = &self.inner;
        inner
            .prepared
            .get_or_try_init(|| async {
                inner.conn.send(page::Enable::default(), Some(session)).await?;

                if inner.config.headless.is_headless() {
                    let response = inner
                        .conn
                        .send(
                            runtime::Evaluate::by_value("navigator.userAgent"),
                            Some(session),
                        )
                        .await?;
                    if let Some(agent) = response
                        .result
                        .value
                        .as_ref()
                        .and_then(|value| value.as_str())
                    {
                        if agent.contains("Headless") {
                            inner
                                .conn
                                .send(
                                    network::SetUserAgentOverride {
                                        user_agent: agent.replace("Headless", ""),
                                        accept_language: inner.config.lang.clone(),
                                        platform: None,
                                    },
                                    Some(session),
                                )
                                .await?;
                        }
                    }
                }

                if inner.config.expert {
                    inner
                        .conn
                        .send(
                            page::AddScriptToEvaluateOnNewDocument {
                                source: OPEN_SHADOW_ROOTS.trim().to_string(),
                            },
                            Some(session),
                        )
                        .await?;
                }

                Ok(())
            })
            .await
            .map(|_| ())
            .map_err(|err: Error| self.annotate(err))
    }

    /// Send a command scoped to this tab's session.
    pub(crate) async fn send<C: Command>(&self, command: C) -> Result<C::Response> {
        let session = self.session().await?;
        self.inner
            .conn
            .send(command, Some(&session))
            .await
            .map_err(|err| self.annotate(err))
    }

    /// Navigate and wait for the main frame to stop loading, with the
    /// configured default timeout.
    pub async fn get(&self, url: &str) -> Result<()> {
        self.get_with_timeout(url, self.inner.config.navigation_timeout())
            .await
    }

    /// Navigate with an explicit deadline. A navigation started while a
    /// previous one is still awaited supersedes it: the prior waiter
    /// resolves with `NavigationSuperseded`.
    pub async fn get_with_timeout(&self, url: &str, timeout: Duration) -> Result<()> {
        let session = self.session().await?;
        let (epoch, token) = self.begin_navigation().await;

        let mut sub = self.inner.conn.subscribe(EventFilter::session(
            EventKind::FrameStoppedLoading,
            session.clone(),
        ));

        let navigate = self
            .inner
            .conn
            .send(page::Navigate::new(url), Some(&session))
            .await
            .map_err(|err| self.annotate(err));
        let response = match navigate {
            Ok(response) => response,
            Err(err) => {
                self.end_navigation(epoch).await;
                return Err(err);
            }
        };
        if let Some(reason) = response.error_text.filter(|text| !text.is_empty()) {
            self.end_navigation(epoch).await;
            return Err(self.annotate(
                Error::new(ErrorKind::Protocol)
                    .with_method(page::Navigate::METHOD)
                    .with_hint(format!("navigation to {url} failed: {reason}")),
            ));
        }

        let outcome = self
            .await_frame_stop(&mut sub, &response.frame_id, &token, timeout, url)
            .await;
        self.end_navigation(epoch).await;
        outcome
    }

    async fn await_frame_stop(
        &self,
        sub: &mut crate::bus::Subscription,
        frame_id: &FrameId,
        token: &CancellationToken,
        timeout: Duration,
        url: &str,
    ) -> Result<()> {
        let wait = async {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(self.annotate(Error::new(ErrorKind::NavigationSuperseded)));
                    }
                    message = sub.next() => match message {
                        None => return Err(Error::new(ErrorKind::ConnectionClosed)),
                        Some(BusMessage::DroppedEvents(_)) => continue,
                        Some(BusMessage::Event(event)) => {
                            if let CdpEvent::FrameStoppedLoading(stop) = event.event.as_ref() {
                                if &stop.frame_id == frame_id {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.annotate(
                Error::new(ErrorKind::Timeout).with_hint(format!("navigation to {url}")),
            )),
        }
    }

    async fn begin_navigation(&self) -> (u64, CancellationToken) {
        let epoch = self.inner.nav_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let mut slot = self.inner.nav.lock().await;
        if let Some(previous) = slot.take() {
            debug!(
                target: "zendriver::tab",
                target_id = %self.inner.target_id,
                "navigation superseded"
            );
            previous.token.cancel();
        }
        *slot = Some(NavSlot {
            epoch,
            token: token.clone(),
        });
        (epoch, token)
    }

    async fn end_navigation(&self, epoch: u64) {
        let mut slot = self.inner.nav.lock().await;
        if slot.as_ref().map(|nav| nav.epoch) == Some(epoch) {
            *slot = None;
        }
    }

    /// The parentless frame of this page. Retries within a short grace
    /// window before giving up.
    pub async fn main_frame(&self) -> Result<FrameId> {
        let deadline = Instant::now() + MAIN_FRAME_GRACE;
        loop {
            match self.send(page::GetFrameTree::default()).await {
                Ok(response) => {
                    let frame = response.frame_tree.frame;
                    if frame.parent_id.is_none() {
                        return Ok(frame.id);
                    }
                }
                Err(err) if err.kind() == ErrorKind::Protocol => {}
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(self.annotate(
                    Error::new(ErrorKind::Protocol).with_hint("main frame not reported"),
                ));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn reload(&self) -> Result<()> {
        let frame = self.main_frame().await?;
        let session = self.session().await?;
        let mut sub = self.inner.conn.subscribe(EventFilter::session(
            EventKind::FrameStoppedLoading,
            session.clone(),
        ));
        self.send(page::Reload::default()).await?;
        let (epoch, token) = self.begin_navigation().await;
        let outcome = self
            .await_frame_stop(
                &mut sub,
                &frame,
                &token,
                self.inner.config.navigation_timeout(),
                "reload",
            )
            .await;
        self.end_navigation(epoch).await;
        outcome
    }

    pub async fn back(&self) -> Result<()> {
        self.history_step(-1).await
    }

    pub async fn forward(&self) -> Result<()> {
        self.history_step(1).await
    }

    async fn history_step(&self, delta: i64) -> Result<()> {
        let history = self.send(page::GetNavigationHistory::default()).await?;
        let index = history.current_index + delta;
        if index < 0 || index >= history.entries.len() as i64 {
            debug!(
                target: "zendriver::tab",
                target_id = %self.inner.target_id,
                "history step out of range; ignored"
            );
            return Ok(());
        }
        let entry_id = history.entries[index as usize].id;
        let frame = self.main_frame().await?;
        let session = self.session().await?;
        let mut sub = self.inner.conn.subscribe(EventFilter::session(
            EventKind::FrameStoppedLoading,
            session.clone(),
        ));
        self.send(page::NavigateToHistoryEntry { entry_id }).await?;
        let (epoch, token) = self.begin_navigation().await;
        let outcome = self
            .await_frame_stop(
                &mut sub,
                &frame,
                &token,
                self.inner.config.navigation_timeout(),
                "history",
            )
            .await;
        self.end_navigation(epoch).await;
        outcome
    }

    /// Close the target and wait for its destroyed notification.
    pub async fn close(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut sub = self
            .inner
            .conn
            .subscribe(EventFilter::browser(EventKind::TargetDestroyed));

        let response = self
            .inner
            .conn
            .send(
                target::CloseTarget {
                    target_id: self.inner.target_id.clone(),
                },
                None,
            )
            .await
            .map_err(|err| self.annotate(err))?;
        if !response.success {
            return Err(self.annotate(
                Error::new(ErrorKind::Protocol).with_hint("browser refused to close target"),
            ));
        }

        let wait = async {
            loop {
                match sub.next().await {
                    None => return Err(Error::new(ErrorKind::ConnectionClosed)),
                    Some(BusMessage::DroppedEvents(_)) => continue,
                    Some(BusMessage::Event(event)) => {
                        if let CdpEvent::TargetDestroyed(destroyed) = event.event.as_ref() {
                            if destroyed.target_id == self.inner.target_id {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.annotate(
                Error::new(ErrorKind::Timeout).with_hint("waiting for target teardown"),
            )),
        }
    }

    /// Bring the tab to the foreground.
    pub async fn activate(&self) -> Result<()> {
        self.ensure_alive()?;
        self.inner
            .conn
            .send(
                target::ActivateTarget {
                    target_id: self.inner.target_id.clone(),
                },
                None,
            )
            .await
            .map_err(|err| self.annotate(err))?;
        Ok(())
    }

    /// Evaluate an expression and fold the result into the neutral value
    /// tree. Page-side exceptions surface as protocol errors.
    pub async fn evaluate(&self, expression: &str) -> Result<RemoteValue> {
        let response = self
            .send(runtime::Evaluate::by_value(expression))
            .await?;
        if let Some(details) = response.exception_details {
            return Err(self.annotate(
                Error::new(ErrorKind::Protocol)
                    .with_method(runtime::Evaluate::METHOD)
                    .with_hint(format!("evaluation raised: {}", details.message())),
            ));
        }
        Ok(values::from_remote_object(response.result))
    }

    /// First element matching the selector, or `None`.
    pub async fn query(&self, selector: &str) -> Result<Option<Element>> {
        let root = self
            .send(dom::GetDocument {
                depth: Some(0),
                pierce: None,
            })
            .await?
            .root;
        let found = self
            .send(dom::QuerySelector {
                node_id: root.node_id,
                selector: selector.to_string(),
            })
            .await?;
        if found.node_id.0 == 0 {
            return Ok(None);
        }
        self.element_from_node_id(found.node_id).await.map(Some)
    }

    /// Every element matching the selector.
    pub async fn query_all(&self, selector: &str) -> Result<Vec<Element>> {
        let root = self
            .send(dom::GetDocument {
                depth: Some(0),
                pierce: None,
            })
            .await?
            .root;
        let found = self
            .send(dom::QuerySelectorAll {
                node_id: root.node_id,
                selector: selector.to_string(),
            })
            .await?;
        let mut elements = Vec::with_capacity(found.node_ids.len());
        for node_id in found.node_ids {
            if node_id.0 == 0 {
                continue;
            }
            elements.push(self.element_from_node_id(node_id).await?);
        }
        Ok(elements)
    }

    pub(crate) async fn element_from_node_id(&self, node_id: dom::NodeId) -> Result<Element> {
        let described = self
            .send(dom::DescribeNode {
                node_id: Some(node_id),
                ..Default::default()
            })
            .await?;
        Ok(Element::from_node(self.clone(), described.node, node_id))
    }

    /// Poll for a selector until it appears, with the configured default
    /// timeout.
    pub async fn wait_for(&self, selector: &str) -> Result<Element> {
        self.wait_for_with_timeout(selector, self.inner.config.wait_for_timeout())
            .await
    }

    pub async fn wait_for_with_timeout(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Element> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(element) = self.query(selector).await? {
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(self.annotate(
                    Error::new(ErrorKind::Timeout)
                        .with_hint(format!("waiting for selector '{selector}'")),
                ));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        self.send(input::DispatchMouseEvent::moved(x, y)).await?;
        Ok(())
    }

    /// Left-button press and release at viewport coordinates. The returned
    /// future resolves only after the browser acknowledged both dispatches.
    pub async fn mouse_click(&self, x: f64, y: f64) -> Result<()> {
        self.send(input::DispatchMouseEvent::pressed(
            x,
            y,
            input::MouseButton::Left,
        ))
        .await?;
        self.send(input::DispatchMouseEvent::released(
            x,
            y,
            input::MouseButton::Left,
        ))
        .await?;
        Ok(())
    }

    /// Press one named key ("Escape", "Enter", ...) or single character.
    pub async fn key_press(&self, key: &str) -> Result<()> {
        for event in keys::events_for_key(key, keys::modifiers::NONE)? {
            self.send(event).await?;
        }
        Ok(())
    }

    /// Type text into the focused element. Delivery mode follows the
    /// configuration: one insertText call, or a per-character key
    /// sequence delivered strictly in order.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        match self.inner.config.typing {
            TypingMode::Insert => {
                self.send(input::InsertText {
                    text: text.to_string(),
                })
                .await?;
            }
            TypingMode::PerKey => {
                for ch in text.chars() {
                    for event in keys::events_for_char(ch, keys::modifiers::NONE)? {
                        self.send(event).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// PNG screenshot bytes.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let response = self
            .send(page::CaptureScreenshot {
                format: Some("png".into()),
                quality: None,
            })
            .await?;
        STANDARD.decode(response.data).map_err(|err| {
            self.annotate(
                Error::new(ErrorKind::Protocol)
                    .with_method(page::CaptureScreenshot::METHOD)
                    .with_hint(format!("undecodable screenshot payload: {err}")),
            )
        })
    }

    /// Install request interception for the given patterns.
    pub async fn intercept(
        &self,
        patterns: Vec<zendriver_cdp::fetch::RequestPattern>,
    ) -> Result<Interceptor> {
        Interceptor::install(self.clone(), patterns).await
    }
}
