//! Credential login against the upstream auth endpoints
//!
//! Replicates the browser login dance as six dependent HTTP steps:
//! CSRF token, authorized URL, state scrape, username check, password
//! check, session fetch. Cookies are threaded through an explicit
//! [`Session`] value that every step extends and the next step sends back,
//! so nothing leaks between concurrent attempts. Redirects are followed
//! manually so cookies set on intermediate hops are captured too.

use axum::body::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderValue;
use reqwest::{Client, Method, Proxy, StatusCode, Url, header, redirect};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use anyhow::{Context, Result};

use crate::session::{Session, SessionStore};
use crate::upstream::{REQUEST_TIMEOUT, USER_AGENT};

// =============================================================================
// Endpoints
// =============================================================================

const CSRF_URL: &str = "https://chat.openai.com/api/auth/csrf";
const PROMPT_LOGIN_URL: &str = "https://chat.openai.com/api/auth/signin/auth0?prompt=login";
const LOGIN_USERNAME_URL: &str = "https://auth0.openai.com/u/login/identifier";
const LOGIN_PASSWORD_URL: &str = "https://auth0.openai.com/u/login/password";
const AUTH_SESSION_URL: &str = "https://chat.openai.com/api/auth/session";

const MAX_REDIRECTS: usize = 10;

/// The URLs the login steps talk to. Defaults to the production endpoints;
/// overridable so tests can point the flow at a local server.
#[derive(Debug, Clone)]
pub struct LoginEndpoints {
    pub csrf_url: String,
    pub prompt_login_url: String,
    pub login_username_url: String,
    pub login_password_url: String,
    pub auth_session_url: String,
}

impl Default for LoginEndpoints {
    fn default() -> Self {
        Self {
            csrf_url: CSRF_URL.to_string(),
            prompt_login_url: PROMPT_LOGIN_URL.to_string(),
            login_username_url: LOGIN_USERNAME_URL.to_string(),
            login_password_url: LOGIN_PASSWORD_URL.to_string(),
            auth_session_url: AUTH_SESSION_URL.to_string(),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// One variant per login step; the display text is the message surfaced to
/// the caller and the carried status is the upstream status that failed the
/// step.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Failed to get CSRF token.")]
    CsrfTokenUnavailable(StatusCode),
    #[error("Failed to get authorized url.")]
    AuthorizedUrlUnavailable(StatusCode),
    #[error("Failed to get state.")]
    StateUnavailable(StatusCode),
    #[error("Email is not valid.")]
    InvalidEmail(StatusCode),
    #[error("Email or password is not correct.")]
    InvalidCredentials(StatusCode),
    #[error("Failed to get access token.")]
    AccessTokenUnavailable(StatusCode),
    #[error("Too many login redirects.")]
    TooManyRedirects,
    #[error("Invalid login redirect location.")]
    InvalidRedirect,
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
}

impl LoginError {
    /// HTTP status to answer with; step failures propagate the status they
    /// observed upstream.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::CsrfTokenUnavailable(status)
            | Self::AuthorizedUrlUnavailable(status)
            | Self::StateUnavailable(status)
            | Self::InvalidEmail(status)
            | Self::InvalidCredentials(status)
            | Self::AccessTokenUnavailable(status) => *status,
            Self::TooManyRedirects | Self::InvalidRedirect | Self::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// =============================================================================
// Flow
// =============================================================================

/// Result of a successful login: the session reply body relayed verbatim,
/// plus the access token when the reply was a JSON envelope carrying one.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub body: Bytes,
    pub content_type: Option<HeaderValue>,
    pub access_token: Option<String>,
}

/// Executes the six-step login sequence and records the resulting session
/// in the shared [`SessionStore`].
pub struct LoginFlow {
    client: Client,
    csrf_url: Url,
    prompt_login_url: Url,
    login_username_url: Url,
    login_password_url: Url,
    auth_session_url: Url,
    store: SessionStore,
}

impl LoginFlow {
    /// Build the flow with its own client. Redirects are disabled on the
    /// client because the flow follows them itself to collect cookies.
    pub fn new(endpoints: LoginEndpoints, store: SessionStore, proxy: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(Proxy::all(proxy).context("invalid network proxy")?);
        }
        let client = builder.build().context("failed to build login client")?;

        Ok(Self {
            client,
            csrf_url: Url::parse(&endpoints.csrf_url).context("invalid csrf url")?,
            prompt_login_url: Url::parse(&endpoints.prompt_login_url)
                .context("invalid prompt login url")?,
            login_username_url: Url::parse(&endpoints.login_username_url)
                .context("invalid username check url")?,
            login_password_url: Url::parse(&endpoints.login_password_url)
                .context("invalid password check url")?,
            auth_session_url: Url::parse(&endpoints.auth_session_url)
                .context("invalid auth session url")?,
            store,
        })
    }

    /// Run the whole sequence. Any step failure aborts the attempt and
    /// nothing is recorded; on success the attempt's cookies and token are
    /// merged into the store and the session reply is returned verbatim.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, LoginError> {
        debug!("starting credential login");

        let session = Session::new();
        let (session, csrf_token) = self.fetch_csrf_token(session).await?;
        let (session, authorized_url) = self.fetch_authorized_url(session, &csrf_token).await?;
        let (session, state) = self.fetch_login_state(session, authorized_url).await?;
        let session = self.submit_username(session, &state, username).await?;
        let session = self
            .submit_password(session, &state, username, password)
            .await?;
        let (session, outcome) = self.fetch_session_reply(session).await?;

        self.store.merge(&session);
        info!("login succeeded, session recorded");
        Ok(outcome)
    }

    async fn fetch_csrf_token(&self, session: Session) -> Result<(Session, String), LoginError> {
        let (session, response) = self
            .execute(Method::GET, self.csrf_url.clone(), None, session)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoginError::CsrfTokenUnavailable(status));
        }

        let reply: CsrfReply = response
            .json()
            .await
            .map_err(|_| LoginError::CsrfTokenUnavailable(status))?;
        if reply.csrf_token.is_empty() {
            return Err(LoginError::CsrfTokenUnavailable(status));
        }
        debug!("obtained CSRF token");
        Ok((session, reply.csrf_token))
    }

    async fn fetch_authorized_url(
        &self,
        session: Session,
        csrf_token: &str,
    ) -> Result<(Session, Url), LoginError> {
        let form = [
            ("callbackUrl", "/"),
            ("csrfToken", csrf_token),
            ("json", "true"),
        ];
        let (session, response) = self
            .execute(
                Method::POST,
                self.prompt_login_url.clone(),
                Some(&form),
                session,
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoginError::AuthorizedUrlUnavailable(status));
        }

        let reply: AuthorizedUrlReply = response
            .json()
            .await
            .map_err(|_| LoginError::AuthorizedUrlUnavailable(status))?;
        let authorized_url =
            Url::parse(&reply.url).map_err(|_| LoginError::AuthorizedUrlUnavailable(status))?;
        debug!("obtained authorized url");
        Ok((session, authorized_url))
    }

    async fn fetch_login_state(
        &self,
        session: Session,
        authorized_url: Url,
    ) -> Result<(Session, String), LoginError> {
        let (session, response) = self
            .execute(Method::GET, authorized_url, None, session)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoginError::StateUnavailable(status));
        }

        let html = response
            .text()
            .await
            .map_err(|_| LoginError::StateUnavailable(status))?;
        let state = scrape_state(&html).ok_or(LoginError::StateUnavailable(status))?;
        debug!("scraped login state");
        Ok((session, state))
    }

    async fn submit_username(
        &self,
        session: Session,
        state: &str,
        username: &str,
    ) -> Result<Session, LoginError> {
        let form = [
            ("state", state),
            ("username", username),
            ("js-available", "true"),
            ("webauthn-available", "true"),
            ("is-brave", "false"),
            ("webauthn-platform-available", "false"),
            ("action", "default"),
        ];
        let url = with_state(&self.login_username_url, state);
        let (session, response) = self
            .execute(Method::POST, url, Some(&form), session)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoginError::InvalidEmail(status));
        }
        Ok(session)
    }

    async fn submit_password(
        &self,
        session: Session,
        state: &str,
        username: &str,
        password: &str,
    ) -> Result<Session, LoginError> {
        let form = [
            ("state", state),
            ("username", username),
            ("password", password),
            ("action", "default"),
        ];
        let url = with_state(&self.login_password_url, state);
        let (session, response) = self
            .execute(Method::POST, url, Some(&form), session)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoginError::InvalidCredentials(status));
        }
        Ok(session)
    }

    async fn fetch_session_reply(
        &self,
        session: Session,
    ) -> Result<(Session, LoginOutcome), LoginError> {
        let (session, response) = self
            .execute(Method::GET, self.auth_session_url.clone(), None, session)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoginError::AccessTokenUnavailable(status));
        }

        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = response.bytes().await?;

        // The reply is either the raw token or a JSON envelope; relay it
        // either way and lift the token out when the envelope parses.
        let access_token = serde_json::from_slice::<SessionReply>(&body)
            .ok()
            .map(|reply| reply.access_token)
            .filter(|token| !token.is_empty());
        let session = match &access_token {
            Some(token) => session.with_access_token(token.clone()),
            None => session,
        };

        Ok((
            session,
            LoginOutcome {
                body,
                content_type,
                access_token,
            },
        ))
    }

    /// Send one step's request, following redirects by hand. Every hop's
    /// `Set-Cookie` headers are merged into the session before the next
    /// request goes out. 307/308 keep the method and form, every other
    /// redirect downgrades to GET.
    async fn execute(
        &self,
        method: Method,
        url: Url,
        form: Option<&[(&str, &str)]>,
        mut session: Session,
    ) -> Result<(Session, reqwest::Response), LoginError> {
        let mut method = method;
        let mut url = url;
        let mut form = form;
        let mut hops = 0;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header(header::USER_AGENT, USER_AGENT);
            if let Some(cookie) = session.cookie_header() {
                request = request.header(header::COOKIE, cookie);
            }
            if let Some(pairs) = form {
                request = request.form(pairs);
            }

            let response = request.send().await?;
            session = session.with_cookies(response_cookies(&response));

            if !response.status().is_redirection() {
                return Ok((session, response));
            }

            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(LoginError::TooManyRedirects);
            }
            let Some(location) = response
                .headers()
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return Ok((session, response));
            };
            url = url.join(location).map_err(|_| LoginError::InvalidRedirect)?;
            if !matches!(
                response.status(),
                StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
            ) {
                method = Method::GET;
                form = None;
            }
        }
    }
}

fn response_cookies(response: &reqwest::Response) -> Vec<(String, String)> {
    response
        .cookies()
        .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
        .collect()
}

/// Append the scraped `state` as a query parameter, percent-encoded.
fn with_state(url: &Url, state: &str) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut().append_pair("state", state);
    url
}

static STATE_INPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<input[^>]*name="state"[^>]*value="([^"]*)""#).unwrap());
static STATE_INPUT_VALUE_FIRST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<input[^>]*value="([^"]*)"[^>]*name="state""#).unwrap());

/// Pull the hidden `state` input out of the authorize page. Attribute order
/// varies between page revisions, so two patterns are tried.
fn scrape_state(html: &str) -> Option<String> {
    for pattern in [&STATE_INPUT, &STATE_INPUT_VALUE_FIRST] {
        if let Some(captures) = pattern.captures(html) {
            let state = captures.get(1)?.as_str();
            if !state.is_empty() {
                return Some(state.to_string());
            }
        }
    }
    None
}

#[derive(Deserialize)]
struct CsrfReply {
    #[serde(rename = "csrfToken", default)]
    csrf_token: String,
}

#[derive(Deserialize)]
struct AuthorizedUrlReply {
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct SessionReply {
    #[serde(rename = "accessToken", default)]
    access_token: String,
}

// =============================================================================
// Tests
// =============================================================================
