//! Endpoint discovery helpers for the supervisor.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Ask the OS for a free TCP port on the loopback interface.
pub(crate) fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Scrape the DevTools websocket URL from the browser's stderr. Chromium
/// prints a `DevTools listening on ws://...` line shortly after startup.
pub(crate) async fn extract_ws_url(child: &mut Child, deadline: Duration) -> Result<String> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("browser process missing stderr handle"))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut captured = Vec::new();

    let reader = async {
        while let Some(line) = lines.next_line().await? {
            captured.push(line.clone());
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") && ws.contains("devtools/browser") {
                    return Ok(ws.to_string());
                }
            }
        }
        Err(anyhow!(
            "browser exited before exposing devtools websocket url. stderr preview: {}",
            captured
                .iter()
                .take(8)
                .cloned()
                .collect::<Vec<_>>()
                .join(" | ")
        ))
    };

    timeout(deadline, reader)
        .await
        .map_err(|_| anyhow!("timed out waiting for devtools websocket url"))?
}

/// Fetch the websocket endpoint from `http://host:port/json/version`,
/// retrying while the debugger comes up.
pub(crate) async fn fetch_ws_endpoint(
    host: &str,
    port: u16,
    attempts: u32,
    delay: Duration,
) -> Result<String> {
    let url = format!("http://{host}:{port}/json/version");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let mut last_error = anyhow!("no attempts made");
    for attempt in 0..attempts {
        match client.get(&url).send().await {
            Ok(response) => match response.json::<Value>().await {
                Ok(body) => {
                    if let Some(ws) = body
                        .get("webSocketDebuggerUrl")
                        .and_then(|value| value.as_str())
                    {
                        return Ok(ws.to_string());
                    }
                    last_error = anyhow!("version endpoint had no webSocketDebuggerUrl");
                }
                Err(err) => last_error = err.into(),
            },
            Err(err) => {
                debug!(target: "zendriver::util", attempt, %err, "version probe failed");
                last_error = err.into();
            }
        }
        sleep(delay).await;
    }
    Err(anyhow!("debugger endpoint not reachable at {url}: {last_error}"))
}
