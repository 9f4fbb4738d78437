//! Credential acquisition and caching.
//!
//! DESIGN
//! ======
//! The manager owns the only copy of the current credential. Callers ask for
//! it through `acquire()`, which returns the cached value while it is present
//! and unexpired, and otherwise runs the source's acquisition flow:
//!
//! - `StaticToken` / `Password`: the configured secret, immediately.
//! - `HttpToken`: an HTTP GET to a token endpoint, then the token is scraped
//!   out of an HTML element, a JSON field, or a response header.
//!
//! `on_rejected()` drops the cached value so the next `acquire()` goes back to
//! the source. The manager never retries on its own; a failed acquisition
//! surfaces to the session, whose reconnect policy decides what happens next.
//!
//! The `reqwest::Client` is shared with `http::TokenHttpClient` so that any
//! session cookie set by the token endpoint rides along with API calls.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::Value;

use crate::error::SessionError;

/// Element id scraped from token pages when nothing else is configured.
pub const DEFAULT_TOKEN_ELEMENT_ID: &str = "token";

// =============================================================================
// CREDENTIAL
// =============================================================================

/// An opaque secret plus an optional expiry hint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: String,
    expires_at: Option<Instant>,
}

impl Credential {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into(), expires_at: None }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: Instant) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// SOURCES
// =============================================================================

/// Where the token lives in a token endpoint's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenExtraction {
    /// Text content of the element with this `id` attribute.
    HtmlElement { id: String },
    /// A top-level JSON string field, or a JSON pointer when it starts with `/`.
    JsonField { name: String },
    /// A response header, read regardless of status code.
    Header { name: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct TokenEndpoint {
    pub url: String,
    pub extraction: TokenExtraction,
    pub basic_auth: Option<(String, String)>,
    /// How long a fetched token stays valid, when the server says nothing.
    pub ttl: Option<Duration>,
}

impl TokenEndpoint {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            extraction: TokenExtraction::HtmlElement { id: DEFAULT_TOKEN_ELEMENT_ID.to_owned() },
            basic_auth: None,
            ttl: None,
        }
    }

    #[must_use]
    pub fn with_extraction(mut self, extraction: TokenExtraction) -> Self {
        self.extraction = extraction;
        self
    }

    #[must_use]
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl fmt::Debug for TokenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEndpoint")
            .field("url", &self.url)
            .field("extraction", &self.extraction)
            .field("basic_auth", &self.basic_auth.as_ref().map(|(user, _)| user))
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    StaticToken(String),
    Password { username: String, password: String },
    HttpToken(TokenEndpoint),
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaticToken(_) => f.write_str("StaticToken(<redacted>)"),
            Self::Password { username, .. } => {
                f.debug_struct("Password").field("username", username).field("password", &"<redacted>").finish()
            }
            Self::HttpToken(endpoint) => f.debug_tuple("HttpToken").field(endpoint).finish(),
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Token pages often tie the token to a session cookie, so token fetches and
/// API calls share one cookie jar.
fn cookie_client() -> reqwest::Client {
    reqwest::Client::builder().cookie_store(true).build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "credentials: cookie client unavailable, session cookies will not be kept");
        reqwest::Client::new()
    })
}

/// Cheaply cloneable handle; clones share the cached credential.
#[derive(Clone)]
pub struct CredentialManager {
    source: Arc<CredentialSource>,
    client: reqwest::Client,
    cached: Arc<Mutex<Option<Credential>>>,
}

impl CredentialManager {
    #[must_use]
    pub fn new(source: CredentialSource) -> Self {
        Self::with_client(source, cookie_client())
    }

    #[must_use]
    pub fn with_client(source: CredentialSource, client: reqwest::Client) -> Self {
        Self { source: Arc::new(source), client, cached: Arc::new(Mutex::new(None)) }
    }

    #[must_use]
    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// HTTP client used for token fetches.
    #[must_use]
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Return the cached credential, or run the acquisition flow.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthRejected`] when the token endpoint refuses
    /// the request or its response contains no token, and
    /// [`SessionError::Http`] when the endpoint cannot be reached.
    pub async fn acquire(&self) -> Result<Credential, SessionError> {
        if let Some(credential) = self.cached_at(Instant::now()) {
            return Ok(credential);
        }
        let credential = match self.source.as_ref() {
            CredentialSource::StaticToken(token) => Credential::new(token.clone()),
            CredentialSource::Password { password, .. } => Credential::new(password.clone()),
            CredentialSource::HttpToken(endpoint) => self.fetch(endpoint).await?,
        };
        self.store(credential.clone());
        Ok(credential)
    }

    /// Drop the cached credential; the next `acquire()` goes to the source.
    pub fn on_rejected(&self) {
        let had_cached = self.cached.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take().is_some();
        tracing::debug!(had_cached, "credentials: invalidated");
    }

    /// Store a token the server pushed to us (e.g. a fresh session id on a 409).
    pub fn accept_issued(&self, secret: impl Into<String>) {
        self.store(Credential::new(secret));
        tracing::debug!("credentials: accepted server-issued token");
    }

    /// Cached credential if still valid at `now`.
    #[must_use]
    pub fn cached_at(&self, now: Instant) -> Option<Credential> {
        let cached = self.cached.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cached.as_ref().filter(|c| !c.is_expired_at(now)).cloned()
    }

    fn store(&self, credential: Credential) {
        *self.cached.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(credential);
    }

    async fn fetch(&self, endpoint: &TokenEndpoint) -> Result<Credential, SessionError> {
        let mut request = self.client.get(&endpoint.url);
        if let Some((user, pass)) = &endpoint.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send().await?;
        let status = response.status();

        let token = if let TokenExtraction::Header { name } = &endpoint.extraction {
            let token = response.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
            check_status(status, token.is_some())?;
            token
        } else {
            check_status(status, false)?;
            let body = response.text().await?;
            extract_token(&endpoint.extraction, &body)
        };

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            tracing::warn!(url = %endpoint.url, "credentials: token not found in response");
            return Err(SessionError::AuthRejected("token endpoint returned no token".into()));
        };
        tracing::info!(url = %endpoint.url, "credentials: fetched token");

        let credential = Credential::new(token);
        Ok(match endpoint.ttl {
            Some(ttl) => credential.with_expiry(Instant::now() + ttl),
            None => credential,
        })
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager").field("source", &self.source).finish_non_exhaustive()
    }
}

fn check_status(status: StatusCode, token_in_headers: bool) -> Result<(), SessionError> {
    if status.is_success() || token_in_headers {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SessionError::AuthRejected(format!("token endpoint returned {status}")));
    }
    Err(SessionError::Http(format!("token endpoint returned {status}")))
}

/// Pull a token out of a response body.
#[must_use]
pub fn extract_token(extraction: &TokenExtraction, body: &str) -> Option<String> {
    match extraction {
        TokenExtraction::HtmlElement { id } => extract_html_element(body, id),
        TokenExtraction::JsonField { name } => {
            let value: Value = serde_json::from_str(body).ok()?;
            let field = if name.starts_with('/') { value.pointer(name) } else { value.get(name) };
            field.and_then(Value::as_str).map(str::to_owned)
        }
        TokenExtraction::Header { .. } => None,
    }
}

/// Text content of the first element whose `id` attribute equals `id`.
fn extract_html_element(html: &str, id: &str) -> Option<String> {
    let start = [format!("id='{id}'"), format!("id=\"{id}\"")]
        .iter()
        .filter_map(|needle| html.find(needle.as_str()))
        .min()?;
    let rest = &html[start..];
    let open_end = rest.find('>')?;
    let content = &rest[open_end + 1..];
    let close = content.find('<').unwrap_or(content.len());
    let token = content[..close].trim();
    (!token.is_empty()).then(|| token.to_owned())
}

#[cfg(test)]
#[path = "credentials_test.rs"]
mod tests;
