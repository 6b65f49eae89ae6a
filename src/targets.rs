//! Local mirror of the browser's target table.
//!
//! The registry is mutated only in response to `Target.*` events plus the
//! initial `Target.getTargets` seed. Destroyed targets leave a tombstone so
//! handles bound to them can report `TargetGone` instead of "unknown".

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::debug;

use zendriver_cdp::target::{TargetId, TargetInfo};
use zendriver_cdp::CdpEvent;

#[derive(Clone)]
pub struct TargetRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    targets: DashMap<TargetId, TargetInfo>,
    destroyed: DashSet<TargetId>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                targets: DashMap::new(),
                destroyed: DashSet::new(),
            }),
        }
    }

    /// Initial population from `Target.getTargets`.
    pub(crate) fn seed(&self, infos: Vec<TargetInfo>) {
        for info in infos {
            self.inner.targets.insert(info.target_id.clone(), info);
        }
    }

    /// Fold one target lifecycle event into the table.
    pub(crate) fn apply_event(&self, event: &CdpEvent) {
        match event {
            CdpEvent::TargetCreated(ev) => {
                debug!(
                    target: "zendriver::targets",
                    id = %ev.target_info.target_id,
                    kind = %ev.target_info.kind,
                    "target created"
                );
                self.inner
                    .targets
                    .insert(ev.target_info.target_id.clone(), ev.target_info.clone());
            }
            CdpEvent::TargetInfoChanged(ev) => {
                self.inner
                    .targets
                    .insert(ev.target_info.target_id.clone(), ev.target_info.clone());
            }
            CdpEvent::TargetDestroyed(ev) => {
                debug!(target: "zendriver::targets", id = %ev.target_id, "target destroyed");
                self.inner.targets.remove(&ev.target_id);
                self.inner.destroyed.insert(ev.target_id.clone());
            }
            CdpEvent::TargetCrashed(ev) => {
                debug!(
                    target: "zendriver::targets",
                    id = %ev.target_id,
                    status = %ev.status,
                    "target crashed"
                );
                self.inner.targets.remove(&ev.target_id);
                self.inner.destroyed.insert(ev.target_id.clone());
            }
            CdpEvent::AttachedToTarget(ev) => {
                self.inner
                    .targets
                    .insert(ev.target_info.target_id.clone(), ev.target_info.clone());
            }
            _ => {}
        }
    }

    pub fn get(&self, target: &TargetId) -> Option<TargetInfo> {
        self.inner.targets.get(target).map(|entry| entry.clone())
    }

    pub fn is_destroyed(&self, target: &TargetId) -> bool {
        self.inner.destroyed.contains(target)
    }

    pub fn page_targets(&self) -> Vec<TargetInfo> {
        self.inner
            .targets
            .iter()
            .filter(|entry| entry.is_page())
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<TargetInfo> {
        self.inner
            .targets
            .iter()
            .map(|entry| entry.clone())
            .collect()
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn created(id: &str, kind: &str, url: &str) -> CdpEvent {
        CdpEvent::parse(
            "Target.targetCreated",
            json!({
                "targetInfo": {
                    "targetId": id,
                    "type": kind,
                    "title": "",
                    "url": url,
                    "attached": false
                }
            }),
        )
        .unwrap()
    }

    #[test]
    fn tracks_create_change_destroy() {
        let registry = TargetRegistry::new();
        registry.apply_event(&created("T1", "page", "about:blank"));
        assert!(registry.get(&TargetId("T1".into())).is_some());
        assert_eq!(registry.page_targets().len(), 1);

        let changed = CdpEvent::parse(
            "Target.targetInfoChanged",
            json!({
                "targetInfo": {
                    "targetId": "T1",
                    "type": "page",
                    "title": "Example",
                    "url": "https://example.com",
                    "attached": true
                }
            }),
        )
        .unwrap();
        registry.apply_event(&changed);
        assert_eq!(
            registry.get(&TargetId("T1".into())).unwrap().url,
            "https://example.com"
        );

        let destroyed =
            CdpEvent::parse("Target.targetDestroyed", json!({"targetId": "T1"})).unwrap();
        registry.apply_event(&destroyed);
        assert!(registry.get(&TargetId("T1".into())).is_none());
        assert!(registry.is_destroyed(&TargetId("T1".into())));
    }

    #[test]
    fn non_page_targets_are_kept_but_not_listed_as_pages() {
        let registry = TargetRegistry::new();
        registry.apply_event(&created("W1", "service_worker", "sw.js"));
        assert!(registry.get(&TargetId("W1".into())).is_some());
        assert!(registry.page_targets().is_empty());
    }
}
