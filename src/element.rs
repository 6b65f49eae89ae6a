//! Local proxies for remote DOM nodes.
//!
//! An element carries the backend node id (stable within a document), a
//! lazily acquired remote-object token, and a snapshot of the node taken
//! at construction. The only automatic retry in the driver lives here:
//! an operation that trips over a stale object id re-resolves through
//! `DOM.resolveNode` exactly once before failing with a stale-element
//! error.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use zendriver_cdp::dom::{self, BackendNodeId, NodeId};
use zendriver_cdp::target::SessionId;
use zendriver_cdp::{input, runtime, Command};

use crate::connection::Connection;
use crate::errors::{Error, ErrorKind, Result};
use crate::keys;
use crate::tab::Tab;
use crate::values::{self, RemoteValue};

/// Error strings the browser uses for handles that no longer resolve.
const STALE_MARKERS: &[&str] = &[
    "Could not find object with given id",
    "No node with given id",
    "Node with given id does not belong to the document",
    "Object id doesn't reference a Node",
    "Cannot find context with specified id",
];

fn is_stale(err: &Error) -> bool {
    if err.kind() != ErrorKind::Protocol {
        return false;
    }
    let hint = err.hint().unwrap_or_default();
    STALE_MARKERS.iter().any(|marker| hint.contains(marker))
}

/// Owns a remote `objectId`. Dropping the token schedules
/// `Runtime.releaseObject` so browser-side handles do not leak.
pub(crate) struct RemoteObjectToken {
    object_id: String,
    conn: Connection,
    session: SessionId,
}

impl RemoteObjectToken {
    fn new(object_id: String, conn: Connection, session: SessionId) -> Self {
        Self {
            object_id,
            conn,
            session,
        }
    }

    fn id(&self) -> &str {
        &self.object_id
    }
}

impl Drop for RemoteObjectToken {
    fn drop(&mut self) {
        if !self.conn.is_open() {
            return;
        }
        let conn = self.conn.clone();
        let session = self.session.clone();
        let object_id = std::mem::take(&mut self.object_id);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = conn
                    .send(runtime::ReleaseObject { object_id }, Some(&session))
                    .await
                {
                    debug!(target: "zendriver::element", %err, "release of remote object failed");
                }
            });
        } else {
            debug!(target: "zendriver::element", "no runtime available to release remote object");
        }
    }
}

#[derive(Clone)]
pub struct Element {
    inner: Arc<ElementInner>,
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("backend_node_id", &self.inner.backend_node_id)
            .field("tag", &self.inner.tag)
            .finish()
    }
}

struct ElementInner {
    tab: Tab,
    backend_node_id: BackendNodeId,
    node_id: Mutex<NodeId>,
    tag: String,
    namespace: Option<String>,
    attrs: Mutex<HashMap<String, String>>,
    parent: Option<NodeId>,
    object: tokio::sync::Mutex<Option<RemoteObjectToken>>,
}

impl Element {
    pub(crate) fn from_node(tab: Tab, node: dom::Node, node_id: NodeId) -> Self {
        let mut attrs = HashMap::new();
        if let Some(raw) = &node.attributes {
            for pair in raw.chunks_exact(2) {
                attrs.insert(pair[0].clone(), pair[1].clone());
            }
        }
        let resolved_node_id = if node.node_id.0 != 0 { node.node_id } else { node_id };
        Self {
            inner: Arc::new(ElementInner {
                tab,
                backend_node_id: node.backend_node_id,
                node_id: Mutex::new(resolved_node_id),
                tag: if node.local_name.is_empty() {
                    node.node_name.to_ascii_lowercase()
                } else {
                    node.local_name
                },
                namespace: node.namespace_uri,
                attrs: Mutex::new(attrs),
                parent: node.parent_id,
                object: tokio::sync::Mutex::new(None),
            }),
        }
    }

    fn tab(&self) -> &Tab {
        &self.inner.tab
    }

    pub fn backend_node_id(&self) -> BackendNodeId {
        self.inner.backend_node_id
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn namespace(&self) -> Option<&str> {
        self.inner.namespace.as_deref()
    }

    pub fn parent_node_id(&self) -> Option<NodeId> {
        self.inner.parent
    }

    /// Attribute from the snapshot taken at construction (kept current by
    /// `set_attr`/`remove_attr` on this handle).
    pub fn attr(&self, name: &str) -> Option<String> {
        self.inner.attrs.lock().get(name).cloned()
    }

    pub fn attrs(&self) -> HashMap<String, String> {
        self.inner.attrs.lock().clone()
    }

    fn map_backend_err(&self, err: Error) -> Error {
        if is_stale(&err) {
            Error::new(ErrorKind::StaleElement)
                .with_hint(err.hint().unwrap_or_default().to_string())
        } else {
            err
        }
    }

    /// Direct children, described one level deep.
    pub async fn children(&self) -> Result<Vec<Element>> {
        let described = self
            .tab()
            .send(dom::DescribeNode {
                backend_node_id: Some(self.inner.backend_node_id),
                depth: Some(1),
                ..Default::default()
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        let children = described.node.children.unwrap_or_default();
        Ok(children
            .into_iter()
            .map(|child| {
                let node_id = child.node_id;
                Element::from_node(self.tab().clone(), child, node_id)
            })
            .collect())
    }

    /// The node id, pushing the node to the client if it has none yet.
    async fn node_id(&self) -> Result<NodeId> {
        {
            let current = *self.inner.node_id.lock();
            if current.0 != 0 {
                return Ok(current);
            }
        }
        let object_id = self.object_id().await?;
        let response = self
            .tab()
            .send(dom::RequestNode { object_id })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        *self.inner.node_id.lock() = response.node_id;
        Ok(response.node_id)
    }

    pub async fn set_attr(&self, name: &str, value: &str) -> Result<()> {
        let node_id = self.node_id().await?;
        self.tab()
            .send(dom::SetAttributeValue {
                node_id,
                name: name.to_string(),
                value: value.to_string(),
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        self.inner
            .attrs
            .lock()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub async fn remove_attr(&self, name: &str) -> Result<()> {
        let node_id = self.node_id().await?;
        self.tab()
            .send(dom::RemoveAttribute {
                node_id,
                name: name.to_string(),
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        self.inner.attrs.lock().remove(name);
        Ok(())
    }

    /// Visible text content, resolved lazily from the outer HTML.
    pub async fn text(&self) -> Result<String> {
        let response = self
            .tab()
            .send(dom::GetOuterHtml {
                backend_node_id: Some(self.inner.backend_node_id),
                ..Default::default()
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        Ok(strip_markup(&response.outer_html))
    }

    pub async fn outer_html(&self) -> Result<String> {
        let response = self
            .tab()
            .send(dom::GetOuterHtml {
                backend_node_id: Some(self.inner.backend_node_id),
                ..Default::default()
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        Ok(response.outer_html)
    }

    /// Scroll into view, resolve the content-box center and dispatch a
    /// left-button press/release there. Elements without a box are not
    /// interactable.
    pub async fn click(&self) -> Result<()> {
        if let Err(err) = self
            .tab()
            .send(dom::ScrollIntoViewIfNeeded {
                backend_node_id: Some(self.inner.backend_node_id),
                ..Default::default()
            })
            .await
        {
            let err = self.map_backend_err(err);
            if err.kind() == ErrorKind::StaleElement {
                return Err(err);
            }
            // Some targets cannot scroll; clicking may still work.
            debug!(target: "zendriver::element", %err, "scrollIntoViewIfNeeded failed");
        }

        let model = match self
            .tab()
            .send(dom::GetBoxModel {
                backend_node_id: Some(self.inner.backend_node_id),
                ..Default::default()
            })
            .await
        {
            Ok(response) => response.model,
            Err(err) => {
                let err = self.map_backend_err(err);
                if err.kind() == ErrorKind::StaleElement {
                    return Err(err);
                }
                return Err(Error::new(ErrorKind::ElementNotInteractable)
                    .with_hint(err.hint().unwrap_or("no box model").to_string()));
            }
        };

        let (x, y) = model.content_center().ok_or_else(|| {
            Error::new(ErrorKind::ElementNotInteractable).with_hint("element has an empty box")
        })?;

        self.tab()
            .send(input::DispatchMouseEvent::pressed(
                x,
                y,
                input::MouseButton::Left,
            ))
            .await?;
        self.tab()
            .send(input::DispatchMouseEvent::released(
                x,
                y,
                input::MouseButton::Left,
            ))
            .await?;
        Ok(())
    }

    pub async fn focus(&self) -> Result<()> {
        self.tab()
            .send(dom::Focus {
                backend_node_id: Some(self.inner.backend_node_id),
                ..Default::default()
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        Ok(())
    }

    pub async fn blur(&self) -> Result<()> {
        self.with_object(|object_id| async move {
            let tab = self.tab();
            tab.send(runtime::CallFunctionOn::on_object(
                object_id,
                "function() { this.blur(); }",
            ))
            .await?;
            Ok(())
        })
        .await
    }

    /// Focus the element and type into it, honoring the configured typing
    /// mode.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.focus().await?;
        match self.tab().config().typing {
            crate::config::TypingMode::Insert => {
                self.tab()
                    .send(input::InsertText {
                        text: text.to_string(),
                    })
                    .await?;
            }
            crate::config::TypingMode::PerKey => {
                for ch in text.chars() {
                    for event in keys::events_for_char(ch, keys::modifiers::NONE)? {
                        self.tab().send(event).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Select an `<option>` by value, falling back to label matching.
    pub async fn select_option(&self, value: &str) -> Result<()> {
        const SELECT_FN: &str = r#"
function(targetValue) {
    if (!this.options) { return { status: "not-a-select" }; }
    const options = Array.from(this.options);
    let option = options.find(opt => opt.value === targetValue);
    if (!option) {
        option = options.find(opt => opt.text === targetValue);
    }
    if (!option) { return { status: "option-missing" }; }
    this.value = option.value;
    this.dispatchEvent(new Event("input", { bubbles: true }));
    this.dispatchEvent(new Event("change", { bubbles: true }));
    return { status: "selected", value: this.value };
}
"#;

        let result = self
            .with_object(|object_id| async move {
                let call = runtime::CallFunctionOn::on_object(object_id, SELECT_FN.trim())
                    .with_argument(runtime::CallArgument::value(json!(value)));
                let response = self.tab().send(call).await?;
                if let Some(details) = response.exception_details {
                    return Err(Error::new(ErrorKind::Protocol)
                        .with_method(runtime::CallFunctionOn::METHOD)
                        .with_hint(details.message()));
                }
                Ok(values::from_remote_object(response.result))
            })
            .await?;

        let status = match &result {
            RemoteValue::Object(fields) => fields
                .iter()
                .find(|(key, _)| key == "status")
                .and_then(|(_, value)| value.as_str())
                .unwrap_or("unknown")
                .to_string(),
            _ => "unknown".to_string(),
        };

        match status.as_str() {
            "selected" => Ok(()),
            "option-missing" => Err(Error::new(ErrorKind::Protocol)
                .with_hint(format!("no option matching '{value}'"))),
            "not-a-select" => Err(Error::new(ErrorKind::ElementNotInteractable)
                .with_hint("element has no options")),
            other => {
                Err(Error::new(ErrorKind::Protocol)
                    .with_hint(format!("select failed: {other}")))
            }
        }
    }

    /// Attach local files to a file input.
    pub async fn upload_file(&self, paths: &[impl AsRef<Path>]) -> Result<()> {
        let files = paths
            .iter()
            .map(|path| path.as_ref().to_string_lossy().into_owned())
            .collect();
        self.tab()
            .send(dom::SetFileInputFiles {
                files,
                backend_node_id: Some(self.inner.backend_node_id),
                ..Default::default()
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        Ok(())
    }

    /// First descendant matching the selector, scoped to this node.
    pub async fn query(&self, selector: &str) -> Result<Option<Element>> {
        let node_id = self.node_id().await?;
        let found = self
            .tab()
            .send(dom::QuerySelector {
                node_id,
                selector: selector.to_string(),
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        if found.node_id.0 == 0 {
            return Ok(None);
        }
        self.tab().element_from_node_id(found.node_id).await.map(Some)
    }

    /// Every descendant matching the selector, scoped to this node.
    pub async fn query_all(&self, selector: &str) -> Result<Vec<Element>> {
        let node_id = self.node_id().await?;
        let found = self
            .tab()
            .send(dom::QuerySelectorAll {
                node_id,
                selector: selector.to_string(),
            })
            .await
            .map_err(|err| self.map_backend_err(err))?;
        let mut elements = Vec::with_capacity(found.node_ids.len());
        for child in found.node_ids {
            if child.0 == 0 {
                continue;
            }
            elements.push(self.tab().element_from_node_id(child).await?);
        }
        Ok(elements)
    }

    /// Run an object-id operation with the single automatic stale retry:
    /// on a stale handle, re-resolve via `DOM.resolveNode` once and rerun;
    /// a second failure is a stale element.
    async fn with_object<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let object_id = self.object_id().await?;
        match op(object_id).await {
            Err(err) if is_stale(&err) => {
                warn!(
                    target: "zendriver::element",
                    tag = %self.inner.tag,
                    "stale object id; re-resolving once"
                );
                let object_id = self.refresh_object().await?;
                op(object_id).await.map_err(|err| {
                    if is_stale(&err) {
                        Error::new(ErrorKind::StaleElement)
                            .with_hint(err.hint().unwrap_or_default().to_string())
                    } else {
                        err
                    }
                })
            }
            other => other,
        }
    }

    async fn object_id(&self) -> Result<String> {
        let mut slot = self.inner.object.lock().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.id().to_string());
        }
        let token = self.resolve_token().await?;
        let id = token.id().to_string();
        *slot = Some(token);
        Ok(id)
    }

    async fn refresh_object(&self) -> Result<String> {
        let mut slot = self.inner.object.lock().await;
        slot.take();
        let token = self.resolve_token().await?;
        let id = token.id().to_string();
        *slot = Some(token);
        Ok(id)
    }

    async fn resolve_token(&self) -> Result<RemoteObjectToken> {
        let session = self.tab().session().await?;
        let response = self
            .tab()
            .send(dom::ResolveNode {
                backend_node_id: Some(self.inner.backend_node_id),
                ..Default::default()
            })
            .await
            .map_err(|err| {
                if is_stale(&err) {
                    Error::new(ErrorKind::StaleElement)
                        .with_hint(err.hint().unwrap_or_default().to_string())
                } else {
                    err
                }
            })?;
        let object_id = response.object.object_id.ok_or_else(|| {
            Error::new(ErrorKind::StaleElement).with_hint("node did not resolve to an object")
        })?;
        Ok(RemoteObjectToken::new(
            object_id,
            self.tab().connection().clone(),
            session,
        ))
    }
}

/// Strip tags from an HTML fragment and collapse the remaining whitespace.
fn strip_markup(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_stripping_collapses_whitespace() {
        let html = "<div class=\"a\">  hello\n   <b>world</b> &amp; more </div>";
        assert_eq!(strip_markup(html), "hello world & more");
    }

    #[test]
    fn stale_detection_matches_browser_messages() {
        let err = Error::new(ErrorKind::Protocol)
            .with_code(-32000)
            .with_hint("Could not find object with given id");
        assert!(is_stale(&err));

        let err = Error::new(ErrorKind::Protocol).with_hint("something else entirely");
        assert!(!is_stale(&err));

        let err = Error::new(ErrorKind::Timeout).with_hint("No node with given id");
        assert!(!is_stale(&err));
    }
}
