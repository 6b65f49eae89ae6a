//! Browser supervisor: process lifetime, endpoint discovery and the root
//! connection.
//!
//! The supervisor launches (or attaches to) a Chromium-family browser,
//! surfaces its devtools endpoint to the connection engine, keeps the
//! target registry fed from lifecycle events, and tears everything down
//! on stop: `Browser.close`, a grace period, then a hard kill. A profile
//! directory created here (because the user supplied none) is deleted on
//! stop.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use zendriver_cdp::network::{Cookie, CookieParam};
use zendriver_cdp::target::{self, TargetId};
use zendriver_cdp::{browser as browser_domain, storage};

use crate::bus::EventFilter;
use crate::config::Config;
use crate::connection::Connection;
use crate::errors::{Error, ErrorKind, Result};
use crate::tab::Tab;
use crate::targets::TargetRegistry;
use crate::util;

const LAUNCH_DEADLINE: Duration = Duration::from_secs(20);
const PROBE_ATTEMPTS: u32 = 20;
const PROBE_DELAY: Duration = Duration::from_millis(250);
const STOP_GRACE_POLLS: u32 = 12;
const STOP_GRACE_INTERVAL: Duration = Duration::from_millis(250);
const NEW_TAB_DEADLINE: Duration = Duration::from_secs(5);
const NEW_TAB_POLL: Duration = Duration::from_millis(50);

/// Root handle owning the browser process and its root connection.
#[derive(Clone)]
pub struct Browser {
    inner: Arc<BrowserInner>,
}

struct BrowserInner {
    config: Arc<Config>,
    conn: Connection,
    registry: TargetRegistry,
    process: tokio::sync::Mutex<Option<Child>>,
    temp_profile: Mutex<Option<TempDir>>,
    initial_target: Mutex<Option<TargetId>>,
    stopped: AtomicBool,
}

impl Browser {
    /// Launch a browser process and connect to it.
    pub async fn start(config: Config) -> Result<Browser> {
        let executable = config.resolve_executable()?;
        let port = match config.port {
            Some(port) => port,
            None => util::free_port().map_err(|err| {
                Error::new(ErrorKind::Connect).with_hint(format!("no free port: {err}"))
            })?,
        };

        let (profile_dir, temp_profile) = match &config.user_data_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("zendriver-profile-")
                    .tempdir()
                    .map_err(|err| {
                        Error::new(ErrorKind::Config)
                            .with_hint(format!("could not create temp profile: {err}"))
                    })?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        let args = launch_args(&config, &profile_dir, port);
        info!(
            target: "zendriver::browser",
            executable = %executable.display(),
            port,
            "launching browser"
        );
        debug!(target: "zendriver::browser", ?args, "launch arguments");

        let mut child = ProcessCommand::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::new(ErrorKind::Connect).with_hint(format!(
                    "failed to launch {}: {err}",
                    executable.display()
                ))
            })?;

        let endpoint = match util::extract_ws_url(&mut child, LAUNCH_DEADLINE).await {
            Ok(url) => url,
            Err(scrape_err) => {
                debug!(target: "zendriver::browser", %scrape_err, "stderr scrape failed; probing http endpoint");
                util::fetch_ws_endpoint(&config.host, port, PROBE_ATTEMPTS, PROBE_DELAY)
                    .await
                    .map_err(|probe_err| {
                        Error::new(ErrorKind::Connect)
                            .with_hint(format!("{scrape_err}; {probe_err}"))
                    })?
            }
        };

        Self::bootstrap(endpoint, config, Some(child), temp_profile).await
    }

    /// Attach to an already running browser via its websocket endpoint.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Browser> {
        Self::bootstrap(endpoint.into(), Config::default(), None, None).await
    }

    /// Attach to an already running browser with explicit configuration.
    pub async fn connect_with_config(
        endpoint: impl Into<String>,
        config: Config,
    ) -> Result<Browser> {
        Self::bootstrap(endpoint.into(), config, None, None).await
    }

    /// Attach to a running browser through its `/json/version` endpoint.
    pub async fn connect_to_host(host: &str, port: u16) -> Result<Browser> {
        let endpoint = util::fetch_ws_endpoint(host, port, PROBE_ATTEMPTS, PROBE_DELAY)
            .await
            .map_err(|err| Error::new(ErrorKind::Connect).with_hint(err.to_string()))?;
        Self::bootstrap(endpoint, Config::default(), None, None).await
    }

    async fn bootstrap(
        endpoint: String,
        config: Config,
        process: Option<Child>,
        temp_profile: Option<TempDir>,
    ) -> Result<Browser> {
        let conn = Connection::open(endpoint).await?;
        let registry = TargetRegistry::new();

        // The registry is fed exclusively from Target.* events.
        let feed = registry.clone();
        conn.add_handler(
            EventFilter::any(),
            Arc::new(move |event| feed.apply_event(&event.event)),
        );

        conn.send(target::SetDiscoverTargets { discover: true }, None)
            .await?;
        let seed = conn.send(target::GetTargets::default(), None).await?;
        let first_page = seed
            .target_infos
            .iter()
            .find(|info| info.is_page())
            .map(|info| info.target_id.clone());
        registry.seed(seed.target_infos);

        Ok(Browser {
            inner: Arc::new(BrowserInner {
                config: Arc::new(config),
                conn,
                registry,
                process: tokio::sync::Mutex::new(process),
                temp_profile: Mutex::new(temp_profile),
                initial_target: Mutex::new(first_page),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.inner.registry
    }

    fn tab_for(&self, target_id: TargetId) -> Tab {
        Tab::new(
            target_id,
            self.inner.conn.clone(),
            self.inner.registry.clone(),
            Arc::clone(&self.inner.config),
        )
    }

    /// Handles for every live page target.
    pub fn tabs(&self) -> Vec<Tab> {
        self.inner
            .registry
            .page_targets()
            .into_iter()
            .map(|info| self.tab_for(info.target_id))
            .collect()
    }

    /// The tab the browser was launched with, or any live page if that one
    /// is gone.
    pub fn main_tab(&self) -> Option<Tab> {
        let initial = self.inner.initial_target.lock().clone();
        if let Some(target_id) = initial {
            if self.inner.registry.get(&target_id).is_some() {
                return Some(self.tab_for(target_id));
            }
        }
        self.inner
            .registry
            .page_targets()
            .into_iter()
            .next()
            .map(|info| self.tab_for(info.target_id))
    }

    /// Open a new tab and wait until the browser reports the target.
    pub async fn new_tab(&self, url: &str) -> Result<Tab> {
        let created = self
            .inner
            .conn
            .send(target::CreateTarget::new(url), None)
            .await?;

        let deadline = tokio::time::Instant::now() + NEW_TAB_DEADLINE;
        loop {
            if self.inner.registry.get(&created.target_id).is_some() {
                return Ok(self.tab_for(created.target_id));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::new(ErrorKind::Timeout)
                    .with_target(created.target_id)
                    .with_hint("created target never appeared"));
            }
            sleep(NEW_TAB_POLL).await;
        }
    }

    /// Navigate the main tab (or a fresh one) to a URL and return its
    /// handle once loading stops.
    pub async fn get(&self, url: &str, new_tab: bool) -> Result<Tab> {
        let tab = if new_tab {
            self.new_tab("about:blank").await?
        } else {
            self.main_tab().ok_or_else(|| {
                Error::new(ErrorKind::Protocol).with_hint("browser has no page target")
            })?
        };
        tab.get(url).await?;
        Ok(tab)
    }

    /// Re-seed the target table from `Target.getTargets`.
    pub async fn update_targets(&self) -> Result<()> {
        let targets = self
            .inner
            .conn
            .send(target::GetTargets::default(), None)
            .await?;
        self.inner.registry.seed(targets.target_infos);
        Ok(())
    }

    /// Browser-wide cookie access.
    pub fn cookies(&self) -> CookieJar {
        CookieJar {
            conn: self.inner.conn.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Graceful shutdown: ask the browser to close, close the connection
    /// (failing everything pending on it), then make sure the process is
    /// gone and the temporary profile is removed.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.inner.conn.is_open() {
            if let Err(err) = self
                .inner
                .conn
                .send_with_timeout(browser_domain::Close::default(), None, Duration::from_secs(2))
                .await
            {
                debug!(target: "zendriver::browser", %err, "Browser.close failed");
            }
        }
        self.inner.conn.close().await;

        if let Some(mut child) = self.inner.process.lock().await.take() {
            let mut exited = false;
            for _ in 0..STOP_GRACE_POLLS {
                match child.try_wait() {
                    Ok(Some(_)) => {
                        exited = true;
                        break;
                    }
                    Ok(None) => sleep(STOP_GRACE_INTERVAL).await,
                    Err(err) => {
                        warn!(target: "zendriver::browser", %err, "could not poll browser process");
                        break;
                    }
                }
            }
            if !exited {
                debug!(target: "zendriver::browser", "browser did not exit in grace period; killing");
                if let Err(err) = child.kill().await {
                    warn!(target: "zendriver::browser", %err, "failed to kill browser process");
                }
            }
            let _ = child.wait().await;
        }

        if let Some(profile) = self.inner.temp_profile.lock().take() {
            let path = profile.path().to_path_buf();
            if let Err(err) = profile.close() {
                debug!(
                    target: "zendriver::browser",
                    path = %path.display(),
                    %err,
                    "temp profile cleanup failed"
                );
            }
        }
        info!(target: "zendriver::browser", "browser stopped");
    }
}

/// Browser-wide cookie surface over the Storage domain.
pub struct CookieJar {
    conn: Connection,
}

impl CookieJar {
    pub async fn get_all(&self) -> Result<Vec<Cookie>> {
        let response = self
            .conn
            .send(storage::GetCookies::default(), None)
            .await?;
        Ok(response.cookies)
    }

    pub async fn set_all(&self, cookies: Vec<CookieParam>) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        self.conn
            .send(
                storage::SetCookies {
                    cookies,
                    browser_context_id: None,
                },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.conn
            .send(storage::ClearCookies::default(), None)
            .await?;
        Ok(())
    }
}

fn launch_args(config: &Config, profile_dir: &Path, port: u16) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={port}"),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-breakpad".to_string(),
        "--disable-client-side-phishing-detection".to_string(),
        "--disable-component-update".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-hang-monitor".to_string(),
        "--disable-popup-blocking".to_string(),
        "--disable-prompt-on-repost".to_string(),
        "--disable-sync".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
        "--use-mock-keychain".to_string(),
        "--remote-allow-origins=*".to_string(),
    ];

    match config.headless {
        crate::config::HeadlessMode::False => {}
        crate::config::HeadlessMode::True => {
            args.push("--headless".to_string());
            args.push("--hide-scrollbars".to_string());
            args.push("--mute-audio".to_string());
        }
        crate::config::HeadlessMode::New => {
            args.push("--headless=new".to_string());
            args.push("--hide-scrollbars".to_string());
            args.push("--mute-audio".to_string());
        }
    }

    if !config.sandbox {
        args.push("--no-sandbox".to_string());
    }
    if let Some(lang) = &config.lang {
        args.push(format!("--lang={lang}"));
    }
    if let Some((width, height)) = config.window_size {
        args.push(format!("--window-size={width},{height}"));
    }
    if config.expert {
        args.push("--disable-blink-features=AutomationControlled".to_string());
        args.push("--disable-site-isolation-trials".to_string());
        args.push("--disable-web-security".to_string());
    }
    args.extend(config.browser_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadlessMode;
    use std::path::PathBuf;

    #[test]
    fn launch_args_reflect_config() {
        let config = Config::new()
            .with_headless(HeadlessMode::New)
            .with_sandbox(false)
            .with_window_size(1280, 720)
            .with_expert(true)
            .with_arg("--custom-flag");
        let dir = PathBuf::from("/tmp/profile");
        let args = launch_args(&config, &dir, 9333);

        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--window-size=1280,720".to_string()));
        assert!(args.contains(&"--disable-blink-features=AutomationControlled".to_string()));
        assert!(args.contains(&"--custom-flag".to_string()));
        assert_eq!(args.last().unwrap(), "about:blank");
    }

    #[test]
    fn headful_launch_has_no_headless_flags() {
        let config = Config::new();
        let args = launch_args(&config, &PathBuf::from("/tmp/p"), 1);
        assert!(!args.iter().any(|arg| arg.starts_with("--headless")));
        assert!(!args.contains(&"--no-sandbox".to_string()));
    }
}
