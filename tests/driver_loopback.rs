//! Tab, element and interception behavior over a scripted endpoint.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{json, Value};
use zendriver::cdp::fetch::RequestPattern;
use zendriver::{Browser, Config, ErrorKind};

use common::{browser_responder, event, page_target, reply, reply_err, spawn_loopback};

fn document_node() -> Value {
    json!({
        "root": {
            "nodeId": 1,
            "backendNodeId": 10,
            "nodeType": 9,
            "nodeName": "#document"
        }
    })
}

fn button_node() -> Value {
    json!({
        "node": {
            "nodeId": 5,
            "backendNodeId": 42,
            "nodeType": 1,
            "nodeName": "BUTTON",
            "localName": "button",
            "attributes": ["id", "b", "class", "primary"]
        }
    })
}

#[tokio::test]
async fn bootstrap_exposes_tabs_and_main_tab() {
    let server = spawn_loopback(browser_responder(|_, _, _, _| None)).await;
    let browser = Browser::connect(&server.url).await.unwrap();

    let tabs = browser.tabs();
    assert_eq!(tabs.len(), 1);
    let tab = browser.main_tab().unwrap();
    assert_eq!(tab.target_id().0, "T1");
    assert_eq!(tab.url().as_deref(), Some("about:blank"));
    browser.stop().await;
}

#[tokio::test]
async fn navigation_waits_for_main_frame_stop() {
    let server = spawn_loopback(browser_responder(|id, method, _, session| match method {
        "Page.navigate" => {
            assert_eq!(session, Some("S1"));
            Some(vec![
                reply(id, json!({"frameId": "F1", "loaderId": "L1"})),
                event(
                    "Page.frameStoppedLoading",
                    json!({"frameId": "F1"}),
                    Some("S1"),
                ),
            ])
        }
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();
    tab.get("https://example.com").await.unwrap();

    let navigations = server.sent("Page.navigate");
    assert_eq!(navigations.len(), 1);
    assert_eq!(navigations[0].0["url"], "https://example.com");

    let attaches = server.sent("Target.attachToTarget");
    assert_eq!(attaches.len(), 1);
    assert_eq!(attaches[0].0["flatten"], true);
    browser.stop().await;
}

#[tokio::test]
async fn failed_navigation_surfaces_error_text() {
    let server = spawn_loopback(browser_responder(|id, method, _, _| match method {
        "Page.navigate" => Some(vec![reply(
            id,
            json!({"frameId": "F1", "errorText": "net::ERR_NAME_NOT_RESOLVED"}),
        )]),
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();
    let err = tab.get("https://nope.invalid").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.hint().unwrap().contains("ERR_NAME_NOT_RESOLVED"));
    browser.stop().await;
}

#[tokio::test]
async fn superseding_navigation_resolves_prior_waiter() {
    let navigations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&navigations);
    let server = spawn_loopback(browser_responder(move |id, method, _, _| match method {
        "Page.navigate" => {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // First navigation never completes.
                Some(vec![reply(id, json!({"frameId": "F1"}))])
            } else {
                Some(vec![
                    reply(id, json!({"frameId": "F1"})),
                    event(
                        "Page.frameStoppedLoading",
                        json!({"frameId": "F1"}),
                        Some("S1"),
                    ),
                ])
            }
        }
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();

    let first_tab = tab.clone();
    let first = tokio::spawn(async move { first_tab.get("https://one.example").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    tab.get("https://two.example").await.unwrap();

    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NavigationSuperseded);
    browser.stop().await;
}

#[tokio::test]
async fn query_builds_element_and_click_dispatches_mouse_events() {
    let server = spawn_loopback(browser_responder(|id, method, params, _| match method {
        "DOM.getDocument" => Some(vec![reply(id, document_node())]),
        "DOM.querySelector" => {
            assert_eq!(params["selector"], "#b");
            Some(vec![reply(id, json!({"nodeId": 5}))])
        }
        "DOM.describeNode" => Some(vec![reply(id, button_node())]),
        "DOM.getBoxModel" => Some(vec![reply(
            id,
            json!({"model": {
                "content": [10.0, 20.0, 110.0, 20.0, 110.0, 60.0, 10.0, 60.0],
                "width": 100.0,
                "height": 40.0
            }}),
        )]),
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();

    let element = tab.query("#b").await.unwrap().expect("element present");
    assert_eq!(element.tag(), "button");
    assert_eq!(element.attr("id").as_deref(), Some("b"));
    assert_eq!(element.attr("class").as_deref(), Some("primary"));

    element.click().await.unwrap();

    let mouse = server.sent("Input.dispatchMouseEvent");
    assert_eq!(mouse.len(), 2);
    assert_eq!(mouse[0].0["type"], "mousePressed");
    assert_eq!(mouse[1].0["type"], "mouseReleased");
    // Center of the content quad.
    assert_eq!(mouse[0].0["x"], 60.0);
    assert_eq!(mouse[0].0["y"], 40.0);
    browser.stop().await;
}

#[tokio::test]
async fn empty_box_model_is_not_interactable() {
    let server = spawn_loopback(browser_responder(|id, method, _, _| match method {
        "DOM.getDocument" => Some(vec![reply(id, document_node())]),
        "DOM.querySelector" => Some(vec![reply(id, json!({"nodeId": 5}))]),
        "DOM.describeNode" => Some(vec![reply(id, button_node())]),
        "DOM.getBoxModel" => Some(vec![reply_err(id, -32000, "Could not compute box model.")]),
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();
    let element = tab.query("#b").await.unwrap().unwrap();
    let err = element.click().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ElementNotInteractable);
    browser.stop().await;
}

#[tokio::test]
async fn stale_object_id_is_reresolved_exactly_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let resolves = Arc::new(AtomicUsize::new(0));
    let call_counter = Arc::clone(&calls);
    let resolve_counter = Arc::clone(&resolves);

    let server = spawn_loopback(browser_responder(move |id, method, _, _| match method {
        "DOM.getDocument" => Some(vec![reply(id, document_node())]),
        "DOM.querySelector" => Some(vec![reply(id, json!({"nodeId": 5}))]),
        "DOM.describeNode" => Some(vec![reply(id, button_node())]),
        "DOM.resolveNode" => {
            let n = resolve_counter.fetch_add(1, Ordering::SeqCst);
            Some(vec![reply(
                id,
                json!({"object": {"type": "object", "subtype": "node", "objectId": format!("obj-{n}")}}),
            )])
        }
        "Runtime.callFunctionOn" => {
            let n = call_counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Some(vec![reply_err(
                    id,
                    -32000,
                    "Could not find object with given id",
                )])
            } else {
                Some(vec![reply(id, json!({"result": {"type": "undefined"}}))])
            }
        }
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();
    let element = tab.query("#b").await.unwrap().unwrap();

    element.blur().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly one retry");
    assert_eq!(resolves.load(Ordering::SeqCst), 2, "initial resolve plus refresh");
    browser.stop().await;
}

#[tokio::test]
async fn persistently_stale_object_fails_with_stale_element() {
    let server = spawn_loopback(browser_responder(|id, method, _, _| match method {
        "DOM.getDocument" => Some(vec![reply(id, document_node())]),
        "DOM.querySelector" => Some(vec![reply(id, json!({"nodeId": 5}))]),
        "DOM.describeNode" => Some(vec![reply(id, button_node())]),
        "DOM.resolveNode" => Some(vec![reply(
            id,
            json!({"object": {"type": "object", "objectId": "obj"}}),
        )]),
        "Runtime.callFunctionOn" => Some(vec![reply_err(
            id,
            -32000,
            "Could not find object with given id",
        )]),
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();
    let element = tab.query("#b").await.unwrap().unwrap();

    let err = element.blur().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StaleElement);
    browser.stop().await;
}

#[tokio::test]
async fn evaluate_folds_result_into_value_tree() {
    let server = spawn_loopback(browser_responder(|id, method, params, _| match method {
        "Runtime.evaluate" => {
            assert_eq!(params["expression"], "window.__c");
            assert_eq!(params["returnByValue"], true);
            Some(vec![reply(
                id,
                json!({"result": {"type": "number", "value": 1}}),
            )])
        }
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();
    let value = tab.evaluate("window.__c").await.unwrap();
    assert_eq!(value.as_f64(), Some(1.0));
    browser.stop().await;
}

#[tokio::test]
async fn destroyed_target_invalidates_tab_permanently() {
    let server = spawn_loopback(browser_responder(|_, _, _, _| None)).await;
    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();

    server.push_event("Target.targetDestroyed", json!({"targetId": "T1"}), None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = tab.evaluate("1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TargetGone);
    assert_eq!(err.target_id().unwrap().0, "T1");

    // Still gone on the next call.
    let err = tab.query("#x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TargetGone);
    browser.stop().await;
}

#[tokio::test]
async fn close_waits_for_target_destroyed() {
    let server = spawn_loopback(browser_responder(|id, method, params, _| match method {
        "Target.closeTarget" => {
            assert_eq!(params["targetId"], "T1");
            Some(vec![
                reply(id, json!({"success": true})),
                event("Target.targetDestroyed", json!({"targetId": "T1"}), None),
            ])
        }
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();
    tab.close().await.unwrap();
    assert!(browser.registry().is_destroyed(tab.target_id()));
    browser.stop().await;
}

#[tokio::test]
async fn interception_fulfills_request_locally() {
    let server = spawn_loopback(browser_responder(|_, _, _, _| None)).await;
    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();

    let interceptor = tab
        .intercept(vec![RequestPattern::url("*/api/v1/*")])
        .await
        .unwrap();

    let fulfilled = Arc::new(AtomicUsize::new(0));
    let fulfilled_count = Arc::clone(&fulfilled);
    interceptor.on(Arc::new(move |record| {
        let fulfilled_count = Arc::clone(&fulfilled_count);
        async move {
            assert_eq!(record.method(), "GET");
            assert!(record.url().contains("/api/v1/"));
            record
                .fulfill(
                    200,
                    &[("content-type", "application/json")],
                    br#"{"ok":true}"#,
                )
                .await
                .unwrap();
            fulfilled_count.fetch_add(1, Ordering::SeqCst);

            // The record is spent: a second resolution must be rejected
            // locally without another protocol call.
            let err = record.continue_request(None).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol);
        }
        .boxed()
    }));

    let enables = server.sent("Fetch.enable");
    assert_eq!(enables.len(), 1);
    assert_eq!(enables[0].0["patterns"][0]["urlPattern"], "*/api/v1/*");

    server.push_event(
        "Fetch.requestPaused",
        json!({
            "requestId": "R1",
            "request": {
                "url": "https://site.example/api/v1/items",
                "method": "GET",
                "headers": {}
            },
            "resourceType": "Fetch"
        }),
        Some("S1"),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fulfilled.load(Ordering::SeqCst), 1);

    let sent = server.sent("Fetch.fulfillRequest");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0["requestId"], "R1");
    assert_eq!(sent[0].0["responseCode"], 200);
    // No continue went out for a fulfilled record.
    assert_eq!(server.count("Fetch.continueRequest"), 0);
    browser.stop().await;
}

#[tokio::test]
async fn unresolved_request_is_auto_continued_with_warning() {
    let server = spawn_loopback(browser_responder(|_, _, _, _| None)).await;
    let config = Config::from_json(json!({"intercept_auto_continue_ms": 150})).unwrap();
    let browser = Browser::connect_with_config(&server.url, config).await.unwrap();
    let tab = browser.main_tab().unwrap();

    let _interceptor = tab.intercept(vec![RequestPattern::url("*")]).await.unwrap();

    server.push_event(
        "Fetch.requestPaused",
        json!({
            "requestId": "R7",
            "request": {"url": "https://site.example/x", "method": "GET", "headers": {}},
            "resourceType": "Document"
        }),
        Some("S1"),
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let continued = server.sent("Fetch.continueRequest");
    assert_eq!(continued.len(), 1);
    assert_eq!(continued[0].0["requestId"], "R7");
    browser.stop().await;
}

#[tokio::test]
async fn first_resolving_handler_wins_and_chain_stops() {
    let server = spawn_loopback(browser_responder(|_, _, _, _| None)).await;
    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.main_tab().unwrap();
    let interceptor = tab.intercept(vec![RequestPattern::url("*")]).await.unwrap();

    let second_saw = Arc::new(AtomicUsize::new(0));

    interceptor.on(Arc::new(move |record| {
        async move {
            record.continue_request(None).await.unwrap();
        }
        .boxed()
    }));
    let second_counter = Arc::clone(&second_saw);
    interceptor.on(Arc::new(move |_record| {
        let second_counter = Arc::clone(&second_counter);
        async move {
            second_counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }));

    server.push_event(
        "Fetch.requestPaused",
        json!({
            "requestId": "R2",
            "request": {"url": "https://site.example/y", "method": "GET", "headers": {}},
            "resourceType": "XHR"
        }),
        Some("S1"),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.count("Fetch.continueRequest"), 1);
    assert_eq!(
        second_saw.load(Ordering::SeqCst),
        0,
        "resolved record leaked to a later handler"
    );
    browser.stop().await;
}

#[tokio::test]
async fn new_tab_waits_for_target_to_appear() {
    let server = spawn_loopback(browser_responder(|id, method, params, _| match method {
        "Target.createTarget" => {
            assert_eq!(params["url"], "about:blank");
            Some(vec![
                reply(id, json!({"targetId": "T2"})),
                event(
                    "Target.targetCreated",
                    json!({"targetInfo": page_target("T2", "about:blank")}),
                    None,
                ),
            ])
        }
        _ => None,
    }))
    .await;

    let browser = Browser::connect(&server.url).await.unwrap();
    let tab = browser.new_tab("about:blank").await.unwrap();
    assert_eq!(tab.target_id().0, "T2");
    assert_eq!(browser.tabs().len(), 2);
    browser.stop().await;
}
