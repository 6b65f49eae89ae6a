//! zendriver: browser automation over the Chrome DevTools Protocol.
//!
//! A [`Browser`] launches (or attaches to) a Chromium-family browser and
//! exposes [`Tab`] handles for its page targets. Tabs navigate, query the
//! DOM into [`Element`] proxies, evaluate scripts, synthesize input and
//! intercept network requests. Underneath, one [`Connection`] per browser
//! multiplexes every command and event over a single WebSocket, with
//! flattened per-target sessions.
//!
//! ```no_run
//! use zendriver::{Browser, Config, HeadlessMode};
//!
//! # async fn run() -> zendriver::Result<()> {
//! let browser = Browser::start(Config::new().with_headless(HeadlessMode::New)).await?;
//! let tab = browser.main_tab().expect("browser always has a page");
//! tab.get("https://example.com").await?;
//! if let Some(heading) = tab.query("h1").await? {
//!     println!("{}", heading.text().await?);
//! }
//! browser.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! All externally visible operations are asynchronous; there is no
//! WebDriver layer and no behavior guarantee outside Chromium-family
//! browsers.

mod browser;
mod bus;
mod config;
mod connection;
mod element;
mod errors;
mod fetch;
mod keys;
mod session;
mod tab;
mod targets;
mod util;
mod values;

pub use browser::{Browser, CookieJar};
pub use bus::{
    AsyncEventHandler, BusMessage, EventBus, EventFilter, EventHandler, HandlerId, SessionFilter,
    Subscription, TaggedEvent,
};
pub use config::{
    detect_browser_executable, Config, HeadlessMode, TypingMode, DEFAULT_AUTO_CONTINUE_TIMEOUT,
    DEFAULT_NAVIGATION_TIMEOUT, DEFAULT_WAIT_FOR_TIMEOUT,
};
pub use connection::Connection;
pub use element::Element;
pub use errors::{Error, ErrorKind, Result};
pub use fetch::{ContinueOverrides, InterceptHandler, Interceptor, RequestPausedRecord};
pub use keys::modifiers;
pub use session::SessionRouter;
pub use tab::Tab;
pub use targets::TargetRegistry;
pub use values::{RemoteObjectRef, RemoteValue};

pub use zendriver_cdp as cdp;
pub use zendriver_cdp::{CdpEvent, EventKind};
