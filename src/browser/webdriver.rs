//! W3C WebDriver client for a remote headless Chrome

use parking_lot::RwLock;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Browser, BrowserError};

/// Opening a fresh browser session can take a while on a loaded hub
const HUB_TIMEOUT: Duration = Duration::from_secs(120);

/// Clicks the verification checkbox when the challenge page is up
const CHALLENGE_SCRIPT: &str =
    r#"const box = document.querySelector('input[type="checkbox"]'); if (box) { box.click(); }"#;

/// One remote browser session on a WebDriver hub
pub struct WebDriverClient {
    http: Client,
    hub_url: String,
    network_proxy: Option<String>,
    session_id: RwLock<Option<String>>,
}

impl WebDriverClient {
    /// `network_proxy` is handed to Chrome, not used for hub traffic.
    pub fn new(hub_url: impl Into<String>, network_proxy: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(HUB_TIMEOUT)
            .build()
            .context("failed to build webdriver client")?;

        Ok(Self {
            http,
            hub_url: hub_url.into().trim_end_matches('/').to_string(),
            network_proxy,
            session_id: RwLock::new(None),
        })
    }

    fn session_url(&self, tail: &str) -> Result<String, BrowserError> {
        let guard = self.session_id.read();
        let id = guard
            .as_deref()
            .ok_or_else(|| BrowserError::InvalidSession("no active session".to_string()))?;
        Ok(format!("{}/session/{}/{}", self.hub_url, id, tail))
    }

    /// One wire command. Error replies carry `value.error`; "invalid session
    /// id" is the one the keeper recovers from.
    async fn command(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<Value, BrowserError> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let payload: Value = response.json().await.map_err(classify)?;

        if !status.is_success() {
            let error = payload
                .pointer("/value/error")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let message = payload
                .pointer("/value/message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if error == "invalid session id" {
                return Err(BrowserError::InvalidSession(message));
            }
            return Err(BrowserError::Protocol(format!("{error}: {message}")));
        }
        Ok(payload)
    }
}

#[async_trait]
impl Browser for WebDriverClient {
    async fn new_session(&self) -> Result<(), BrowserError> {
        let url = format!("{}/session", self.hub_url);
        let capabilities = chrome_capabilities(self.network_proxy.as_deref());
        let payload = self.command(Method::POST, url, Some(capabilities)).await?;

        let id = payload
            .pointer("/value/sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol("session reply carried no sessionId".to_string()))?;
        debug!("opened browser session {id}");
        *self.session_id.write() = Some(id.to_string());
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let target = self.session_url("url")?;
        self.command(Method::POST, target, Some(json!({"url": url})))
            .await?;
        Ok(())
    }

    async fn refresh(&self) -> Result<(), BrowserError> {
        let url = self.session_url("refresh")?;
        self.command(Method::POST, url, Some(json!({}))).await?;
        Ok(())
    }

    async fn cookies(&self) -> Result<BTreeMap<String, String>, BrowserError> {
        let url = self.session_url("cookie")?;
        let payload = self.command(Method::GET, url, None).await?;

        let mut cookies = BTreeMap::new();
        if let Some(entries) = payload.pointer("/value").and_then(Value::as_array) {
            for entry in entries {
                if let (Some(name), Some(value)) = (
                    entry.get("name").and_then(Value::as_str),
                    entry.get("value").and_then(Value::as_str),
                ) {
                    cookies.insert(name.to_string(), value.to_string());
                }
            }
        }
        Ok(cookies)
    }

    async fn title(&self) -> Result<String, BrowserError> {
        let url = self.session_url("title")?;
        let payload = self.command(Method::GET, url, None).await?;
        Ok(string_value(&payload))
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        let url = self.session_url("source")?;
        let payload = self.command(Method::GET, url, None).await?;
        Ok(string_value(&payload))
    }

    async fn solve_challenge(&self) -> Result<(), BrowserError> {
        let url = self.session_url("execute/sync")?;
        self.command(
            Method::POST,
            url,
            Some(json!({"script": CHALLENGE_SCRIPT, "args": []})),
        )
        .await?;
        Ok(())
    }
}

fn string_value(payload: &Value) -> String {
    payload
        .pointer("/value")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn classify(err: reqwest::Error) -> BrowserError {
    if err.is_connect() {
        BrowserError::ConnectionRefused(err.to_string())
    } else {
        BrowserError::Transport(err)
    }
}

/// Chrome session request: headless, automation markers stripped, optional
/// egress proxy.
fn chrome_capabilities(network_proxy: Option<&str>) -> Value {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--incognito".to_string(),
        "--headless=new".to_string(),
    ];
    if let Some(proxy) = network_proxy {
        args.push(format!("--proxy-server={proxy}"));
    }

    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "goog:chromeOptions": {
                    "args": args,
                    "excludeSwitches": ["enable-automation"],
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
