use super::*;

#[test]
fn ws_url_rewrites_http_schemes() {
    assert_eq!(ws_url("http://hub.local:8123/api/websocket").expect("url"), "ws://hub.local:8123/api/websocket");
    assert_eq!(ws_url("https://hub.example/api/websocket/").expect("url"), "wss://hub.example/api/websocket");
}

#[test]
fn ws_url_keeps_ws_schemes() {
    assert_eq!(ws_url("ws://127.0.0.1:9000").expect("url"), "ws://127.0.0.1:9000");
    assert_eq!(ws_url("wss://hub.example/ws").expect("url"), "wss://hub.example/ws");
}

#[test]
fn ws_url_rejects_other_schemes() {
    assert!(matches!(ws_url("ftp://hub.example"), Err(TransportError::Connect(_))));
    assert!(ws_url("hub.example").is_err());
}

#[test]
fn default_path_fills_in_bare_base_urls() {
    let bare = WebSocketTransport::new("http://hub.local:8123/").with_default_path("/api/websocket");
    assert_eq!(bare.target().expect("url"), "ws://hub.local:8123/api/websocket");

    let explicit = WebSocketTransport::new("https://hub.example/custom/ws").with_default_path("/api/websocket");
    assert_eq!(explicit.target().expect("url"), "wss://hub.example/custom/ws");

    let plain = WebSocketTransport::new("ws://127.0.0.1:9000");
    assert_eq!(plain.target().expect("url"), "ws://127.0.0.1:9000");
}

#[tokio::test]
async fn open_fails_for_unreachable_endpoint() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let transport = WebSocketTransport::new(format!("http://{addr}"));
    let err = transport.open().await.err().expect("connect should fail");
    assert!(matches!(err, TransportError::Connect(_)));
}
