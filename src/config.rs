//! Launch and driver configuration.
//!
//! `Config` is the full supervisor surface: headless mode, profile
//! directory, executable override, sandbox, extra arguments, window
//! geometry, language, debugger host/port and the expert flag set. When
//! built from external JSON, unknown keys fail with a config error rather
//! than being silently dropped.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use which::which;

use crate::errors::{Error, ErrorKind, Result};

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WAIT_FOR_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_AUTO_CONTINUE_TIMEOUT: Duration = Duration::from_secs(20);

/// Headless rendering mode. `New` selects Chromium's `--headless=new`.
/// In configuration JSON this is `true`, `false` or `"new"`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HeadlessMode {
    True,
    #[default]
    False,
    New,
}

impl HeadlessMode {
    pub fn is_headless(self) -> bool {
        !matches!(self, HeadlessMode::False)
    }
}

impl Serialize for HeadlessMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            HeadlessMode::True => serializer.serialize_bool(true),
            HeadlessMode::False => serializer.serialize_bool(false),
            HeadlessMode::New => serializer.serialize_str("new"),
        }
    }
}

impl<'de> Deserialize<'de> for HeadlessMode {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct ModeVisitor;

        impl<'de> serde::de::Visitor<'de> for ModeVisitor {
            type Value = HeadlessMode;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("true, false or \"new\"")
            }

            fn visit_bool<E: serde::de::Error>(
                self,
                value: bool,
            ) -> std::result::Result<HeadlessMode, E> {
                Ok(if value {
                    HeadlessMode::True
                } else {
                    HeadlessMode::False
                })
            }

            fn visit_str<E: serde::de::Error>(
                self,
                value: &str,
            ) -> std::result::Result<HeadlessMode, E> {
                match value {
                    "true" => Ok(HeadlessMode::True),
                    "false" => Ok(HeadlessMode::False),
                    "new" => Ok(HeadlessMode::New),
                    other => Err(E::invalid_value(serde::de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}

/// How `type_text` delivers characters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingMode {
    /// Single `Input.insertText` call.
    #[default]
    Insert,
    /// Per-character key down/up sequence.
    PerKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub headless: HeadlessMode,
    #[serde(default)]
    pub user_data_dir: Option<PathBuf>,
    #[serde(default)]
    pub browser_executable_path: Option<PathBuf>,
    #[serde(default = "default_sandbox")]
    pub sandbox: bool,
    #[serde(default)]
    pub browser_args: Vec<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    /// `None` picks a free port at launch.
    #[serde(default)]
    pub port: Option<u16>,
    /// Adds flags useful for evading automation detection.
    #[serde(default)]
    pub expert: bool,
    #[serde(default)]
    pub window_size: Option<(u32, u32)>,
    #[serde(default)]
    pub typing: TypingMode,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default = "default_wait_for_timeout_ms")]
    pub wait_for_timeout_ms: u64,
    #[serde(default = "default_auto_continue_ms")]
    pub intercept_auto_continue_ms: u64,
}

fn default_sandbox() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_navigation_timeout_ms() -> u64 {
    DEFAULT_NAVIGATION_TIMEOUT.as_millis() as u64
}

fn default_wait_for_timeout_ms() -> u64 {
    DEFAULT_WAIT_FOR_TIMEOUT.as_millis() as u64
}

fn default_auto_continue_ms() -> u64 {
    DEFAULT_AUTO_CONTINUE_TIMEOUT.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            headless: HeadlessMode::default(),
            user_data_dir: None,
            browser_executable_path: None,
            sandbox: default_sandbox(),
            browser_args: Vec::new(),
            lang: None,
            host: default_host(),
            port: None,
            expert: false,
            window_size: None,
            typing: TypingMode::default(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            wait_for_timeout_ms: default_wait_for_timeout_ms(),
            intercept_auto_continue_ms: default_auto_continue_ms(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object; unknown keys are a configuration error.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|err| {
            Error::new(ErrorKind::Config).with_hint(err.to_string())
        })
    }

    pub fn with_headless(mut self, mode: HeadlessMode) -> Self {
        self.headless = mode;
        self
    }

    pub fn with_user_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_data_dir = Some(dir.into());
        self
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.browser_executable_path = Some(path.into());
        self
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.browser_args.push(arg.into());
        self
    }

    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window_size = Some((width, height));
        self
    }

    pub fn with_expert(mut self, expert: bool) -> Self {
        self.expert = expert;
        self
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn wait_for_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_for_timeout_ms)
    }

    pub fn auto_continue_timeout(&self) -> Duration {
        Duration::from_millis(self.intercept_auto_continue_ms)
    }

    /// The executable that will actually be launched.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = &self.browser_executable_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::new(ErrorKind::Config).with_hint(format!(
                "browser executable not found at {}",
                path.display()
            )));
        }
        detect_browser_executable().ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_hint("could not determine browser executable; set browser_executable_path")
        })
    }
}

/// Locate a Chromium-family executable: well-known names on PATH first,
/// OS-specific install locations second.
pub fn detect_browser_executable() -> Option<PathBuf> {
    for name in browser_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    for candidate in os_specific_browser_paths() {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

fn browser_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_browser_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for root in [
            std::path::Path::new("C:/Program Files"),
            std::path::Path::new("C:/Program Files (x86)"),
        ] {
            paths.push(root.join("Google/Chrome/Application/chrome.exe"));
            paths.push(root.join("Chromium/Application/chrome.exe"));
            paths.push(root.join("Microsoft/Edge/Application/msedge.exe"));
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}
