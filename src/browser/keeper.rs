//! Periodic browser refresh and cookie export

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Browser, BrowserError};
use crate::session::SessionStore;

/// Page the browser keeps open
pub const CHATGPT_URL: &str = "https://chat.openai.com/chat";
/// Logged once the page answers with the expected title
pub const WELCOME_TEXT: &str = "API is ready to provide cookies.";
/// Title of the chat page when no challenge is up
const READY_TITLE: &str = "ChatGPT";
/// Marker of a hard block that no challenge clicking resolves
const ACCESS_DENIED_MARKER: &str = "Access denied";
/// Cadence of the keep-alive refresh
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Drives the remote browser and feeds its cookies into the session store
pub struct SessionKeeper {
    browser: Arc<dyn Browser>,
    store: SessionStore,
}

impl SessionKeeper {
    pub fn new(browser: Arc<dyn Browser>, store: SessionStore) -> Self {
        Self { browser, store }
    }

    /// Open the session, load the chat page and export the first cookies.
    pub async fn start(&self) -> Result<(), BrowserError> {
        self.browser.new_session().await?;
        self.browser.navigate(CHATGPT_URL).await?;

        if self.is_ready().await? {
            info!("{WELCOME_TEXT}");
        } else if self.is_access_denied().await? {
            error!("Upstream blocks this egress address, cookies will not work");
        } else {
            self.browser.solve_challenge().await?;
            info!("{WELCOME_TEXT}");
        }

        self.export_cookies().await
    }

    /// Refresh loop, runs until the task is dropped.
    pub async fn run(&self) {
        let mut ticker = time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the interval fires immediately once; the session was just started
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.refresh_once().await;
        }
    }

    /// One keep-alive cycle. A vanished session is reopened, an unreachable
    /// hub is only reported, nothing here can do better than wait.
    async fn refresh_once(&self) {
        match self.browser.refresh().await {
            Ok(()) => {
                if let Err(err) = self.browser.solve_challenge().await {
                    warn!("Challenge script failed: {err}");
                }
                if let Err(err) = self.export_cookies().await {
                    warn!("Cookie export failed: {err}");
                }
            }
            Err(BrowserError::ConnectionRefused(message)) => {
                error!("Browser hub is not reachable, make sure it is running: {message}");
            }
            Err(BrowserError::InvalidSession(_)) => {
                warn!("Browser session expired, opening a new one");
                if let Err(err) = self.resume().await {
                    error!("Failed to resume browser session: {err}");
                }
            }
            Err(err) => {
                warn!("Browser refresh failed: {err}");
            }
        }
    }

    async fn resume(&self) -> Result<(), BrowserError> {
        self.browser.new_session().await?;
        self.browser.navigate(CHATGPT_URL).await?;
        if let Err(err) = self.browser.solve_challenge().await {
            warn!("Challenge script failed: {err}");
        }
        self.export_cookies().await
    }

    async fn is_ready(&self) -> Result<bool, BrowserError> {
        Ok(self.browser.title().await? == READY_TITLE)
    }

    async fn is_access_denied(&self) -> Result<bool, BrowserError> {
        let source = self.browser.page_source().await?;
        Ok(source.contains(ACCESS_DENIED_MARKER))
    }

    async fn export_cookies(&self) -> Result<(), BrowserError> {
        let cookies = self.browser.cookies().await?;
        debug!("exported {} browser cookies", cookies.len());
        self.store.merge_cookies(cookies);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
