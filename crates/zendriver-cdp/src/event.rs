//! The event sum type: one variant per supported CDP event, plus a
//! raw-carrying `Other` for methods outside the generated surface.
//!
//! Subscriptions match on [`EventKind`], the fieldless discriminant, so
//! filtering never compares method strings at runtime.

use serde_json::Value;

use crate::{fetch, network, page, runtime, target, CodecError};

macro_rules! cdp_events {
    ( $( $method:literal => $variant:ident ( $payload:ty ) ),+ $(,)? ) => {
        /// A parsed CDP event.
        #[derive(Clone, Debug)]
        pub enum CdpEvent {
            $( $variant($payload), )+
            /// An event outside the generated surface; raw params retained.
            Other { method: String, params: Value },
        }

        /// Fieldless discriminant of [`CdpEvent`], used in subscription
        /// filters.
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
        pub enum EventKind {
            $( $variant, )+
            Other,
        }

        impl CdpEvent {
            /// Parse an event frame into its typed variant. Unknown methods
            /// land in [`CdpEvent::Other`]; malformed payloads for known
            /// methods are decode errors carrying the raw params.
            pub fn parse(method: &str, params: Value) -> Result<CdpEvent, CodecError> {
                match method {
                    $(
                        $method => {
                            let raw = params.to_string();
                            serde_json::from_value(params)
                                .map(CdpEvent::$variant)
                                .map_err(|source| CodecError::Decode { source, raw })
                        }
                    )+
                    _ => Ok(CdpEvent::Other {
                        method: method.to_string(),
                        params,
                    }),
                }
            }

            pub fn kind(&self) -> EventKind {
                match self {
                    $( CdpEvent::$variant(_) => EventKind::$variant, )+
                    CdpEvent::Other { .. } => EventKind::Other,
                }
            }

            pub fn method(&self) -> &str {
                match self {
                    $( CdpEvent::$variant(_) => $method, )+
                    CdpEvent::Other { method, .. } => method,
                }
            }
        }
    };
}

cdp_events! {
    "Target.targetCreated" => TargetCreated(target::TargetCreatedEvent),
    "Target.targetInfoChanged" => TargetInfoChanged(target::TargetInfoChangedEvent),
    "Target.targetDestroyed" => TargetDestroyed(target::TargetDestroyedEvent),
    "Target.targetCrashed" => TargetCrashed(target::TargetCrashedEvent),
    "Target.attachedToTarget" => AttachedToTarget(target::AttachedToTargetEvent),
    "Target.detachedFromTarget" => DetachedFromTarget(target::DetachedFromTargetEvent),
    "Page.frameStartedLoading" => FrameStartedLoading(page::FrameStartedLoadingEvent),
    "Page.frameStoppedLoading" => FrameStoppedLoading(page::FrameStoppedLoadingEvent),
    "Page.frameNavigated" => FrameNavigated(page::FrameNavigatedEvent),
    "Page.frameAttached" => FrameAttached(page::FrameAttachedEvent),
    "Page.frameDetached" => FrameDetached(page::FrameDetachedEvent),
    "Page.loadEventFired" => LoadEventFired(page::LoadEventFiredEvent),
    "Page.domContentEventFired" => DomContentEventFired(page::DomContentEventFiredEvent),
    "Page.lifecycleEvent" => LifecycleEvent(page::LifecycleEventEvent),
    "Network.requestWillBeSent" => RequestWillBeSent(network::RequestWillBeSentEvent),
    "Network.responseReceived" => ResponseReceived(network::ResponseReceivedEvent),
    "Network.loadingFinished" => LoadingFinished(network::LoadingFinishedEvent),
    "Network.loadingFailed" => LoadingFailed(network::LoadingFailedEvent),
    "Fetch.requestPaused" => RequestPaused(fetch::RequestPausedEvent),
    "Runtime.exceptionThrown" => ExceptionThrown(runtime::ExceptionThrownEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_event() {
        let event = CdpEvent::parse(
            "Page.frameStoppedLoading",
            json!({"frameId": "F1", "ignoredExtra": 1}),
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::FrameStoppedLoading);
        match event {
            CdpEvent::FrameStoppedLoading(ev) => assert_eq!(ev.frame_id.0, "F1"),
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn unknown_method_becomes_other() {
        let event = CdpEvent::parse("Cast.sinksUpdated", json!({"sinks": []})).unwrap();
        assert_eq!(event.kind(), EventKind::Other);
        assert_eq!(event.method(), "Cast.sinksUpdated");
    }

    #[test]
    fn malformed_known_payload_is_a_decode_error() {
        let err = CdpEvent::parse("Target.targetDestroyed", json!({"bogus": true}))
            .unwrap_err();
        match err {
            CodecError::Decode { raw, .. } => assert!(raw.contains("bogus")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn attached_event_carries_session_and_target() {
        let event = CdpEvent::parse(
            "Target.attachedToTarget",
            json!({
                "sessionId": "S1",
                "targetInfo": {
                    "targetId": "T1",
                    "type": "page",
                    "title": "t",
                    "url": "about:blank",
                    "attached": true
                },
                "waitingForDebugger": false
            }),
        )
        .unwrap();
        match event {
            CdpEvent::AttachedToTarget(ev) => {
                assert_eq!(ev.session_id.0, "S1");
                assert!(ev.target_info.is_page());
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }
}
