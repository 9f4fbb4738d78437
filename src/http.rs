//! Stateless HTTP client with token refresh-and-retry.
//!
//! DESIGN
//! ======
//! Download-manager style web APIs have no persistent connection: every
//! request carries a token, and the server signals a stale token with a
//! rejection status. `TokenHttpClient` attaches the current credential from a
//! [`CredentialManager`], and on rejection refreshes it and retries once:
//!
//! - `401`/`403`: invalidate and re-acquire (e.g. scrape `/gui/token.html`)
//! - `409` with a session-id header: adopt the id the server just issued
//!
//! TRADE-OFFS
//! ==========
//! Exactly one refresh per call. A server that rejects the fresh credential
//! too gets `AuthRejected` back instead of a retry loop.

use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;

use crate::credentials::{Credential, CredentialManager};
use crate::error::SessionError;

pub use reqwest::Method;

/// Header Transmission-style servers use to hand out session ids with `409`.
pub const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";

/// Longest error body excerpt kept in a `ProtocolError`.
const ERROR_BODY_LIMIT: usize = 200;

/// Where the credential goes on each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPlacement {
    /// `?{name}={secret}` query parameter.
    Query { name: String },
    /// `{name}: {secret}` request header.
    Header { name: String },
    /// `Authorization: Bearer {secret}`.
    Bearer,
}

/// How a rejected request gets a fresh credential.
enum Refresh {
    Reacquire,
    Issued(String),
}

#[derive(Debug, Clone)]
pub struct TokenHttpClient {
    base_url: String,
    credentials: CredentialManager,
    placement: TokenPlacement,
    session_header: String,
}

impl TokenHttpClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, credentials: CredentialManager, placement: TokenPlacement) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credentials,
            placement,
            session_header: SESSION_ID_HEADER.to_owned(),
        }
    }

    /// Header read from `409` responses for a server-issued session id.
    #[must_use]
    pub fn with_session_header(mut self, name: impl Into<String>) -> Self {
        self.session_header = name.into();
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    /// Send one request with the current credential, refreshing and retrying
    /// once if the server rejects it.
    ///
    /// Returns the JSON body, `Value::String` for non-JSON bodies, or
    /// `Value::Null` for an empty one.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AuthRejected`] when the retry is rejected too, or
    ///   the credential cannot be acquired
    /// - [`SessionError::ProtocolError`] for any other non-success status
    /// - [`SessionError::Http`] for network failures
    pub async fn execute(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, SessionError> {
        let credential = self.credentials.acquire().await?;
        let response = self.send(&method, path, body.as_ref(), &credential).await?;
        let Some(refresh) = self.rejection(&response) else {
            return read_body(response).await;
        };
        tracing::info!(%method, path, status = %response.status(), "http: credential rejected, refreshing");

        match refresh {
            Refresh::Issued(secret) => self.credentials.accept_issued(secret),
            Refresh::Reacquire => self.credentials.on_rejected(),
        }
        let credential = self.credentials.acquire().await?;
        let response = self.send(&method, path, body.as_ref(), &credential).await?;
        if self.rejection(&response).is_some() {
            let status = response.status();
            tracing::warn!(%method, path, %status, "http: refreshed credential rejected");
            return Err(SessionError::AuthRejected(format!("{method} {path} rejected with {status} after refresh")));
        }
        read_body(response).await
    }

    /// # Errors
    ///
    /// Same as [`TokenHttpClient::execute`].
    pub async fn get(&self, path: &str) -> Result<Value, SessionError> {
        self.execute(Method::GET, path, None).await
    }

    /// # Errors
    ///
    /// Same as [`TokenHttpClient::execute`].
    pub async fn post(&self, path: &str, body: Value) -> Result<Value, SessionError> {
        self.execute(Method::POST, path, Some(body)).await
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        credential: &Credential,
    ) -> Result<Response, SessionError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.credentials.http_client().request(method.clone(), url);
        request = self.place(request, credential.secret());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        tracing::debug!(%method, path, status = %response.status(), "http: response");
        Ok(response)
    }

    fn place(&self, request: RequestBuilder, secret: &str) -> RequestBuilder {
        match &self.placement {
            TokenPlacement::Query { name } => request.query(&[(name.as_str(), secret)]),
            TokenPlacement::Header { name } => request.header(name.as_str(), secret),
            TokenPlacement::Bearer => request.bearer_auth(secret),
        }
    }

    fn rejection(&self, response: &Response) -> Option<Refresh> {
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(Refresh::Reacquire),
            StatusCode::CONFLICT => response
                .headers()
                .get(self.session_header.as_str())
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(|v| Refresh::Issued(v.to_owned())),
            _ => None,
        }
    }
}

async fn read_body(response: Response) -> Result<Value, SessionError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        let excerpt: String = text.chars().take(ERROR_BODY_LIMIT).collect();
        return Err(SessionError::ProtocolError(format!("server returned {status}: {excerpt}")));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
