//! ChatGPT Gateway Library
//!
//! A pass-through HTTP gateway that republishes the ChatGPT web API as a
//! plain REST service, with a scripted credential login and a browser-backed
//! session keeper.
//!
//! # Architecture
//!
//! ```text
//! Client ──HTTP──▶ Gateway (this) ──HTTPS──▶ chat.openai.com/backend-api
//!                    │
//!                    ├── Request Forwarder (byte-for-byte relay)
//!                    ├── Credential Login (auth0 redirect walk)
//!                    ├── Session Store (cookies + token, in-memory)
//!                    └── Session Keeper (WebDriver hub, optional)
//! ```
//!
//! # Usage
//!
//! ```bash
//! # All environment variables are optional
//! export GATEWAY_ADDR=0.0.0.0:8080
//! export UPSTREAM_API_URL=https://chat.openai.com/backend-api
//! export BROWSER_HUB_URL=http://127.0.0.1:4444    # enables the session keeper
//! export NETWORK_PROXY=socks5://127.0.0.1:1080    # egress proxy
//!
//! # Run
//! chatgpt-gateway
//! ```

pub mod admission;
pub mod browser;
pub mod config;
pub mod error;
pub mod login;
pub mod routes;
pub mod session;
pub mod types;
pub mod upstream;

pub use admission::AdmissionGate;
pub use config::GatewayConfig;
pub use error::ApiError;
pub use routes::{AppState, build_router};
pub use session::{Session, SessionStore};
pub use upstream::UpstreamClient;

/// Prelude for common imports
pub mod prelude {
    pub use crate::admission::AdmissionGate;
    pub use crate::config::GatewayConfig;
    pub use crate::error::ApiError;
    pub use crate::routes::{AppState, build_router};
    pub use crate::session::{Session, SessionStore};
    pub use crate::upstream::UpstreamClient;
}
