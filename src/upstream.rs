//! Upstream client and generic request forwarding
//!
//! One inbound API call becomes one upstream call. Requests carry the fixed
//! browser User-Agent, the caller's bearer token, and the stored session
//! cookies; responses are relayed byte-for-byte, streamed for the
//! conversation-send route. Two known upstream error texts are rewritten
//! into fixed messages, everything else passes through untouched.

use axum::body::Body;
use axum::response::Response;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, Proxy, RequestBuilder, header};
use serde::Serialize;
use std::time::Duration;
use tracing::error;

use anyhow::{Context, Result};

use crate::admission::{AdmissionPermit, BUSY_MESSAGE};
use crate::error::ApiError;
use crate::session::SessionStore;
use crate::types::CreateConversationRequest;

/// Browser identity presented on every upstream request
pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36";

/// Long enough to cover a full streamed conversation reply
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// HTTP client for the upstream private API
pub struct UpstreamClient {
    http: Client,
    api_base: String,
    store: SessionStore,
}

impl UpstreamClient {
    pub fn new(api_base: impl Into<String>, store: SessionStore, proxy: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(Proxy::all(proxy).context("invalid network proxy")?);
        }
        let http = builder.build().context("failed to build upstream client")?;

        Ok(Self {
            http,
            api_base: api_base.into(),
            store,
        })
    }

    pub async fn get(
        &self,
        path: &str,
        authorization: &str,
        label: &str,
    ) -> Result<Response, ApiError> {
        let request = self.request_builder(Method::GET, path, authorization);
        self.dispatch(request, label).await
    }

    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        authorization: &str,
        body: &T,
        label: &str,
    ) -> Result<Response, ApiError> {
        let request = self
            .request_builder(Method::POST, path, authorization)
            .json(body);
        self.dispatch(request, label).await
    }

    pub async fn patch_json<T: Serialize>(
        &self,
        path: &str,
        authorization: &str,
        body: &T,
        label: &str,
    ) -> Result<Response, ApiError> {
        let request = self
            .request_builder(Method::PATCH, path, authorization)
            .json(body);
        self.dispatch(request, label).await
    }

    /// Send a conversation request and relay the reply incrementally.
    /// The admission permit is moved into the relayed stream so the gate
    /// stays held until the last byte went out, not merely until the
    /// handler returned.
    pub async fn send_conversation(
        &self,
        authorization: &str,
        request: &CreateConversationRequest,
        permit: AdmissionPermit,
    ) -> Result<Response, ApiError> {
        let response = self
            .request_builder(Method::POST, "/conversation", authorization)
            .header(header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|err| {
                error!("Failed to send conversation: {err}");
                ApiError::internal(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            drop(permit);
            return relay_error(response, "Failed to send conversation.").await;
        }

        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let stream = response.bytes_stream().map(move |chunk| {
            let _ = &permit;
            chunk
        });
        Ok(relay_response(status, content_type, Body::from_stream(stream)))
    }

    fn request_builder(&self, method: Method, path: &str, authorization: &str) -> RequestBuilder {
        let url = format!("{}{}", self.api_base, path);
        let mut request = self
            .http
            .request(method, url)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::AUTHORIZATION, derive_bearer(authorization));
        if let Some(cookie) = self.store.snapshot().cookie_header() {
            request = request.header(header::COOKIE, cookie);
        }
        request
    }

    async fn dispatch(&self, request: RequestBuilder, label: &str) -> Result<Response, ApiError> {
        let response = request.send().await.map_err(|err| {
            error!("{label} {err}");
            ApiError::internal(err.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return relay_error(response, label).await;
        }

        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = response
            .bytes()
            .await
            .map_err(|err| ApiError::internal(err.to_string()))?;
        Ok(relay_response(status, content_type, Body::from(body)))
    }
}

/// Relay a non-success upstream reply: known error texts become fixed
/// messages, everything else is passed through with status and body
/// untouched.
async fn relay_error(response: reqwest::Response, label: &str) -> Result<Response, ApiError> {
    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let body = response
        .bytes()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    error!("{label} upstream status: {status}");

    let text = String::from_utf8_lossy(&body);
    if let Some(message) = rewrite_known_errors(&text) {
        return Err(ApiError::upstream(status, message));
    }
    Ok(relay_response(status, content_type, Body::from(body)))
}

fn relay_response(
    status: reqwest::StatusCode,
    content_type: Option<header::HeaderValue>,
    body: Body,
) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}

/// Prefix the caller's token with the bearer scheme when it lacks one.
/// The token itself is never validated, the upstream is the judge.
pub(crate) fn derive_bearer(authorization: &str) -> String {
    if authorization.starts_with("Bearer ") {
        authorization.to_string()
    } else {
        format!("Bearer {authorization}")
    }
}

static WAIT_SECONDS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"_in":\s*(\d+)"#).unwrap());

/// Best-effort substitution of the two known upstream error texts.
/// Substring matches against upstream wording, so an upstream copy change
/// silently disables the rewrite and the raw body is relayed instead.
fn rewrite_known_errors(body: &str) -> Option<String> {
    if body.contains("too many messages") {
        if let Some(seconds) = WAIT_SECONDS.captures(body).and_then(|caps| caps.get(1)) {
            let seconds = seconds.as_str();
            return Some(format!(
                "You have sent too many messages to the model. Please try again in {seconds} seconds."
            ));
        }
    }
    if body.contains("one message at a time") {
        return Some(BUSY_MESSAGE.to_string());
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
