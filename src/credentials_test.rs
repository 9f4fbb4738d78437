use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;

use super::*;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

async fn token_page(State(hits): State<Arc<AtomicUsize>>) -> Html<String> {
    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
    Html(format!("<html><div id='token' style='display:none;'>TOKEN_{n}</div></html>"))
}

async fn token_server() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new().route("/gui/token.html", get(token_page)).with_state(hits.clone());
    (serve(router).await, hits)
}

// =============================================================================
// CREDENTIAL
// =============================================================================

#[test]
fn debug_redacts_secret() {
    let credential = Credential::new("super-secret");
    let rendered = format!("{credential:?}");
    assert!(!rendered.contains("super-secret"));
    assert!(rendered.contains("redacted"));

    let source = CredentialSource::Password { username: "admin".into(), password: "hunter2".into() };
    let rendered = format!("{source:?}");
    assert!(rendered.contains("admin"));
    assert!(!rendered.contains("hunter2"));
}

#[test]
fn expiry_is_checked_against_given_instant() {
    let now = Instant::now();
    let credential = Credential::new("t").with_expiry(now + Duration::from_secs(10));
    assert!(!credential.is_expired_at(now));
    assert!(credential.is_expired_at(now + Duration::from_secs(10)));
    assert!(!Credential::new("t").is_expired_at(now + Duration::from_secs(3600)));
}

// =============================================================================
// EXTRACTION
// =============================================================================

#[test]
fn html_extraction_handles_both_quote_styles() {
    let id = TokenExtraction::HtmlElement { id: "token".into() };
    assert_eq!(extract_token(&id, "<html><div id='token'>ABC</div></html>").as_deref(), Some("ABC"));
    assert_eq!(extract_token(&id, "<div class=\"x\"></div><div id=\"token\">  DEF  </div>").as_deref(), Some("DEF"));
}

#[test]
fn html_extraction_misses_return_none() {
    let id = TokenExtraction::HtmlElement { id: "token".into() };
    assert_eq!(extract_token(&id, "<html><div class='not-token'>WRONG</div></html>"), None);
    assert_eq!(extract_token(&id, "<html><div id='token'></div></html>"), None);
}

#[test]
fn json_extraction_supports_pointers() {
    let field = TokenExtraction::JsonField { name: "access_token".into() };
    assert_eq!(extract_token(&field, r#"{"access_token":"jwt"}"#).as_deref(), Some("jwt"));

    let pointer = TokenExtraction::JsonField { name: "/data/token".into() };
    assert_eq!(extract_token(&pointer, r#"{"data":{"token":"nested"}}"#).as_deref(), Some("nested"));
    assert_eq!(extract_token(&field, "not json"), None);
}

// =============================================================================
// MANAGER
// =============================================================================

#[tokio::test]
async fn static_token_is_returned_immediately() {
    let manager = CredentialManager::new(CredentialSource::StaticToken("abc".into()));
    assert_eq!(manager.acquire().await.expect("acquire").secret(), "abc");
}

#[tokio::test]
async fn password_source_yields_password() {
    let manager =
        CredentialManager::new(CredentialSource::Password { username: "admin".into(), password: "pw".into() });
    assert_eq!(manager.acquire().await.expect("acquire").secret(), "pw");
}

#[tokio::test]
async fn http_token_is_cached_until_rejected() {
    let (base, hits) = token_server().await;
    let manager = CredentialManager::new(CredentialSource::HttpToken(TokenEndpoint::new(format!("{base}/gui/token.html"))));

    assert_eq!(manager.acquire().await.expect("first").secret(), "TOKEN_1");
    assert_eq!(manager.acquire().await.expect("cached").secret(), "TOKEN_1");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    manager.on_rejected();
    assert_eq!(manager.acquire().await.expect("refetched").secret(), "TOKEN_2");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expired_token_is_refetched() {
    let (base, hits) = token_server().await;
    let endpoint = TokenEndpoint::new(format!("{base}/gui/token.html")).with_ttl(Duration::ZERO);
    let manager = CredentialManager::new(CredentialSource::HttpToken(endpoint));

    manager.acquire().await.expect("first");
    manager.acquire().await.expect("second");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unauthorized_endpoint_is_auth_rejection() {
    let router = Router::new().route("/token", get(|| async { StatusCode::UNAUTHORIZED }));
    let base = serve(router).await;
    let manager = CredentialManager::new(CredentialSource::HttpToken(TokenEndpoint::new(format!("{base}/token"))));

    let err = manager.acquire().await.expect_err("rejected");
    assert!(err.is_auth_rejection());
}

#[tokio::test]
async fn server_error_is_http_failure() {
    let router = Router::new().route("/token", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let base = serve(router).await;
    let manager = CredentialManager::new(CredentialSource::HttpToken(TokenEndpoint::new(format!("{base}/token"))));

    let err = manager.acquire().await.expect_err("failed");
    assert!(matches!(err, SessionError::Http(_)));
    assert!(err.retryable());
}

#[tokio::test]
async fn basic_auth_is_sent_to_endpoint() {
    async fn guarded(headers: HeaderMap) -> impl IntoResponse {
        if headers.contains_key("authorization") {
            Html("<div id='token'>OK</div>").into_response()
        } else {
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
    let base = serve(Router::new().route("/gui/token.html", get(guarded))).await;

    let endpoint = TokenEndpoint::new(format!("{base}/gui/token.html")).with_basic_auth("admin", "pw");
    let manager = CredentialManager::new(CredentialSource::HttpToken(endpoint));
    assert_eq!(manager.acquire().await.expect("acquire").secret(), "OK");
}

#[tokio::test]
async fn header_token_is_read_from_conflict_response() {
    let router = Router::new().route(
        "/rpc",
        get(|| async { (StatusCode::CONFLICT, [("x-transmission-session-id", "SESSION_42")]) }),
    );
    let base = serve(router).await;
    let endpoint = TokenEndpoint::new(format!("{base}/rpc"))
        .with_extraction(TokenExtraction::Header { name: "x-transmission-session-id".into() });
    let manager = CredentialManager::new(CredentialSource::HttpToken(endpoint));

    assert_eq!(manager.acquire().await.expect("acquire").secret(), "SESSION_42");
}

#[tokio::test]
async fn token_page_cookie_is_sent_with_later_requests() {
    async fn login() -> impl IntoResponse {
        ([(axum::http::header::SET_COOKIE, "GUID=abc123; Path=/")], Html("<div id='token'>T1</div>"))
    }
    async fn guarded(headers: HeaderMap) -> StatusCode {
        let cookie = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()).unwrap_or("");
        if cookie.contains("GUID=abc123") { StatusCode::OK } else { StatusCode::UNAUTHORIZED }
    }
    let base = serve(Router::new().route("/gui/token.html", get(login)).route("/gui/", get(guarded))).await;
    let manager = CredentialManager::new(CredentialSource::HttpToken(TokenEndpoint::new(format!("{base}/gui/token.html"))));

    assert_eq!(manager.acquire().await.expect("acquire").secret(), "T1");
    let status = manager.http_client().get(format!("{base}/gui/")).send().await.expect("request").status();
    assert_eq!(status, reqwest::StatusCode::OK);
}

#[tokio::test]
async fn accept_issued_replaces_cached_token() {
    let manager = CredentialManager::new(CredentialSource::StaticToken("old".into()));
    manager.acquire().await.expect("acquire");
    manager.accept_issued("new");
    assert_eq!(manager.acquire().await.expect("acquire").secret(), "new");
}

#[tokio::test]
async fn unreachable_endpoint_is_http_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let manager = CredentialManager::new(CredentialSource::HttpToken(TokenEndpoint::new(format!("http://{addr}/t"))));

    assert!(matches!(manager.acquire().await, Err(SessionError::Http(_))));
}
