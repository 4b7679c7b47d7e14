//! Browser-backed session keeping
//!
//! A remote browser holds the live upstream session; its cookies are what
//! make forwarded requests pass. The [`Browser`] trait covers the slice of
//! the WebDriver protocol the keeper needs, [`WebDriverClient`] speaks it
//! against a hub, and [`SessionKeeper`] drives the page on a fixed cadence.

mod keeper;
mod webdriver;

pub use keeper::SessionKeeper;
pub use webdriver::WebDriverClient;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    /// The hub itself is unreachable
    #[error("browser hub unreachable: {0}")]
    ConnectionRefused(String),
    /// The hub answered but the session no longer exists
    #[error("invalid session id: {0}")]
    InvalidSession(String),
    /// Any other rejection from the hub
    #[error("webdriver protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Transport(reqwest::Error),
}

/// Remote browser operations used by the keeper
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_session(&self) -> Result<(), BrowserError>;
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn refresh(&self) -> Result<(), BrowserError>;
    async fn cookies(&self) -> Result<BTreeMap<String, String>, BrowserError>;
    async fn title(&self) -> Result<String, BrowserError>;
    async fn page_source(&self) -> Result<String, BrowserError>;
    async fn solve_challenge(&self) -> Result<(), BrowserError>;
}
