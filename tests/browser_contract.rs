//! End-to-end scenarios against a real Chromium. Ignored by default: they
//! need a local browser binary. Enable with
//! `ZENDRIVER_TEST_BROWSERS=headless|headful|both` (and optionally
//! `ZENDRIVER_TEST_NO_SANDBOX=1` when running as root), then
//! `cargo test -- --ignored`.

use std::env;
use std::time::{Duration, Instant};

use zendriver::cdp::fetch::RequestPattern;
use zendriver::{Browser, Config, ErrorKind, HeadlessMode};

fn modes_under_test() -> Vec<HeadlessMode> {
    match env::var("ZENDRIVER_TEST_BROWSERS")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "headful" => vec![HeadlessMode::False],
        "both" => vec![HeadlessMode::New, HeadlessMode::False],
        "headless" => vec![HeadlessMode::New],
        _ => Vec::new(),
    }
}

fn no_sandbox() -> bool {
    env::var("ZENDRIVER_TEST_NO_SANDBOX")
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

async fn launch(mode: HeadlessMode) -> Browser {
    let config = Config::new()
        .with_headless(mode)
        .with_sandbox(!no_sandbox());
    Browser::start(config).await.expect("browser launch")
}

fn page_url(html: &str) -> String {
    format!("data:text/html,{}", urlencode(html))
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[tokio::test]
#[ignore = "requires a local Chromium; set ZENDRIVER_TEST_BROWSERS"]
async fn simple_navigation() {
    for mode in modes_under_test() {
        let browser = launch(mode).await;
        let tab = browser.main_tab().expect("main tab");

        let start = Instant::now();
        tab.get_with_timeout("about:blank", Duration::from_secs(1))
            .await
            .expect("navigation resolves");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(tab.url().as_deref(), Some("about:blank"));

        browser.stop().await;
    }
}

#[tokio::test]
#[ignore = "requires a local Chromium; set ZENDRIVER_TEST_BROWSERS"]
async fn element_click_runs_page_handler() {
    for mode in modes_under_test() {
        let browser = launch(mode).await;
        let tab = browser.main_tab().expect("main tab");

        tab.get(&page_url(
            r#"<button id="b" onclick="window.__c=1">x</button>"#,
        ))
        .await
        .unwrap();

        let button = tab.wait_for("#b").await.unwrap();
        button.click().await.unwrap();

        let value = tab.evaluate("window.__c").await.unwrap();
        assert_eq!(value.as_f64(), Some(1.0));

        browser.stop().await;
    }
}

#[tokio::test]
#[ignore = "requires a local Chromium; set ZENDRIVER_TEST_BROWSERS"]
async fn escape_closes_modal() {
    for mode in modes_under_test() {
        let browser = launch(mode).await;
        let tab = browser.main_tab().expect("main tab");

        tab.get(&page_url(
            r#"<div id="modal">open</div>
               <script>
                 window.mainpageState = "open";
                 document.addEventListener("keydown", (e) => {
                   if (e.key === "Escape") { window.mainpageState = "closed"; }
                 });
               </script>"#,
        ))
        .await
        .unwrap();

        tab.key_press("Escape").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let state = tab.evaluate("window.mainpageState").await.unwrap();
            if state.as_str() == Some("closed") {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "modal state never reached 'closed'"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        browser.stop().await;
    }
}

#[tokio::test]
#[ignore = "requires a local Chromium; set ZENDRIVER_TEST_BROWSERS"]
async fn interception_fulfills_api_call() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures_util::FutureExt;

    for mode in modes_under_test() {
        let browser = launch(mode).await;
        let tab = browser.main_tab().expect("main tab");
        tab.get("about:blank").await.unwrap();

        let interceptor = tab
            .intercept(vec![RequestPattern::url("*/api/v1/*")])
            .await
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hit_counter = Arc::clone(&hits);
        interceptor.on(Arc::new(move |record| {
            let hit_counter = Arc::clone(&hit_counter);
            async move {
                hit_counter.fetch_add(1, Ordering::SeqCst);
                record
                    .fulfill(
                        200,
                        &[("content-type", "application/json")],
                        br#"{"ok":true}"#,
                    )
                    .await
                    .unwrap();
            }
            .boxed()
        }));

        tab.evaluate(
            r#"fetch("https://interception.invalid/api/v1/ping")
                   .then(r => r.text())
                   .then(t => { window.__body = t; })"#,
        )
        .await
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let body = tab.evaluate("window.__body").await.unwrap();
            if body.as_str() == Some(r#"{"ok":true}"#) {
                break;
            }
            assert!(Instant::now() < deadline, "fulfilled body never observed");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        browser.stop().await;
    }
}

#[tokio::test]
#[ignore = "requires a local Chromium; set ZENDRIVER_TEST_BROWSERS"]
async fn five_concurrent_tabs_have_distinct_sessions() {
    for mode in modes_under_test() {
        let browser = launch(mode).await;

        let mut handles = Vec::new();
        for index in 0..5 {
            let browser = browser.clone();
            handles.push(tokio::spawn(async move {
                let title = format!("tab-{index}");
                let html = format!("<title>{title}</title><h1>{title}</h1>");
                let tab = browser.new_tab("about:blank").await.unwrap();
                tab.get(&page_url(&html)).await.unwrap();
                let session = tab.session().await.unwrap();
                let seen = tab.evaluate("document.title").await.unwrap();
                (title, seen, session)
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            let (expected, seen, session) = handle.await.unwrap();
            assert_eq!(seen.as_str(), Some(expected.as_str()));
            sessions.push(session);
        }
        for a in 0..sessions.len() {
            for b in (a + 1)..sessions.len() {
                assert_ne!(sessions[a], sessions[b], "session ids must be distinct");
            }
        }

        browser.stop().await;
    }
}

#[tokio::test]
#[ignore = "requires a local Chromium; set ZENDRIVER_TEST_BROWSERS"]
async fn graceful_shutdown_fails_pending_wait() {
    for mode in modes_under_test() {
        let browser = launch(mode).await;
        let tab = browser.main_tab().expect("main tab");
        tab.get("about:blank").await.unwrap();

        let waiter_tab = tab.clone();
        let waiter = tokio::spawn(async move {
            waiter_tab
                .wait_for_with_timeout("#never", Duration::from_secs(60))
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        browser.stop().await;
        let outcome = waiter.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        let err = outcome.unwrap_err();
        assert!(
            matches!(err.kind(), ErrorKind::ConnectionClosed | ErrorKind::TargetGone),
            "unexpected error kind: {err}"
        );
    }
}
