//! Configuration management

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listen address
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: String,

    /// Base URL of the upstream private API
    #[serde(default = "default_upstream_api_url")]
    pub upstream_api_url: String,

    /// Remote WebDriver endpoint; the browser session keeper runs only when set
    pub browser_hub_url: Option<String>,

    /// Egress proxy for upstream traffic and the automated browser
    pub network_proxy: Option<String>,
}

fn default_gateway_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream_api_url() -> String {
    "https://chat.openai.com/backend-api".to_string()
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            gateway_addr: std::env::var("GATEWAY_ADDR").unwrap_or_else(|_| default_gateway_addr()),
            upstream_api_url: std::env::var("UPSTREAM_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| default_upstream_api_url()),
            browser_hub_url: std::env::var("BROWSER_HUB_URL").ok(),
            network_proxy: std::env::var("NETWORK_PROXY").ok(),
        })
    }
}
