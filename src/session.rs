//! Session router: maps CDP session ids to targets and scopes events.
//!
//! Attachment always uses flatten mode; there is no code path for
//! non-flattened sessions. Concurrent attach calls for one target collapse
//! onto a single in-flight `Target.attachToTarget`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use zendriver_cdp::target::{self, SessionId, TargetId};
use zendriver_cdp::CdpEvent;

use crate::bus::TaggedEvent;
use crate::connection::Connection;
use crate::errors::Result;

pub struct SessionRouter {
    by_session: DashMap<SessionId, TargetId>,
    by_target: DashMap<TargetId, SessionId>,
    pending: DashMap<TargetId, Arc<OnceCell<SessionId>>>,
}

impl SessionRouter {
    pub(crate) fn new() -> Self {
        Self {
            by_session: DashMap::new(),
            by_target: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Attach to a target, reusing the existing session when one is live.
    /// Idempotent under concurrency: N simultaneous callers issue at most
    /// one `Target.attachToTarget` and all observe the same session id.
    pub async fn attach(&self, conn: &Connection, target: &TargetId) -> Result<SessionId> {
        if let Some(existing) = self.by_target.get(target) {
            return Ok(existing.clone());
        }

        let cell = {
            let entry = self
                .pending
                .entry(target.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()));
            Arc::clone(entry.value())
        };

        let wanted = target.clone();
        let result = cell
            .get_or_try_init(|| async {
                let response = conn
                    .send(
                        target::AttachToTarget {
                            target_id: wanted.clone(),
                            flatten: true,
                        },
                        None,
                    )
                    .await
                    .map_err(|err| err.with_target(wanted.clone()))?;
                Ok(response.session_id)
            })
            .await;

        match result {
            Ok(session) => {
                let session = session.clone();
                self.note_attached(session.clone(), target.clone());
                Ok(session)
            }
            Err(err) => {
                self.pending.remove(target);
                Err(err)
            }
        }
    }

    /// Detach a session. The mapping is removed before the command is
    /// issued, so no event for this session id is published after this
    /// call returns.
    pub async fn detach(&self, conn: &Connection, session: &SessionId) -> Result<()> {
        self.note_detached(session);
        conn.send(
            target::DetachFromTarget {
                session_id: session.clone(),
            },
            None,
        )
        .await?;
        Ok(())
    }

    pub(crate) fn note_attached(&self, session: SessionId, target: TargetId) {
        self.by_session.insert(session.clone(), target.clone());
        self.by_target.insert(target, session);
    }

    pub(crate) fn note_detached(&self, session: &SessionId) {
        if let Some((_, target)) = self.by_session.remove(session) {
            self.by_target
                .remove_if(&target, |_, bound| bound == session);
            self.pending.remove(&target);
        }
    }

    pub(crate) fn forget_target(&self, target: &TargetId) {
        if let Some((_, session)) = self.by_target.remove(target) {
            self.by_session.remove(&session);
        }
        self.pending.remove(target);
    }

    pub fn session_for(&self, target: &TargetId) -> Option<SessionId> {
        self.by_target.get(target).map(|entry| entry.clone())
    }

    pub fn target_for(&self, session: &SessionId) -> Option<TargetId> {
        self.by_session.get(session).map(|entry| entry.clone())
    }

    /// Tag an inbound event with its Tab's target. Browser-level events
    /// pass through untagged; events for unknown sessions are dropped.
    pub(crate) fn tag(
        &self,
        event: Arc<CdpEvent>,
        session_id: Option<String>,
    ) -> Option<TaggedEvent> {
        match session_id {
            None => Some(TaggedEvent {
                event,
                session_id: None,
                target_id: None,
            }),
            Some(raw) => {
                let session = SessionId(raw);
                match self.target_for(&session) {
                    Some(target) => Some(TaggedEvent {
                        event,
                        session_id: Some(session),
                        target_id: Some(target),
                    }),
                    None => {
                        debug!(
                            target: "zendriver::session",
                            session = %session,
                            method = event.method(),
                            "event for unknown session dropped"
                        );
                        None
                    }
                }
            }
        }
    }
}
