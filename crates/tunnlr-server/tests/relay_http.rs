//! HTTP surface tests: management routes, proxy error mapping, and a live agent over WebSocket

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;
use tunnlr_auth::{JwtClaims, JwtValidator};
use tunnlr_control::{Outbound, TunnelChannel};
use tunnlr_proto::{ResponseEnvelope, TunnelCodec, TunnelMessage, TunnelStatus};
use tunnlr_relay_db::{MemoryStore, Tunnel, TunnelStore};
use tunnlr_server::{build_router, RelayConfig, RelayState};

const SECRET: &[u8] = b"relay-http-secret";

fn relay_state(store: &MemoryStore) -> Arc<RelayState> {
    let config = RelayConfig {
        domain: "example.com".to_string(),
        request_timeout: Duration::from_secs(5),
        ..RelayConfig::default()
    };
    Arc::new(RelayState::new(
        config,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(JwtValidator::new(SECRET)),
    ))
}

fn token_for(user: &str) -> String {
    let claims = JwtClaims::new(
        user.to_string(),
        "test".to_string(),
        "test".to_string(),
        chrono::Duration::hours(1),
    );
    JwtValidator::encode(SECRET, &claims).unwrap()
}

fn stored_tunnel(id: &str, subdomain: &str, status: TunnelStatus) -> Tunnel {
    Tunnel {
        id: id.to_string(),
        user_id: "owner".to_string(),
        local_port: 3000,
        protocol: "http".to_string(),
        subdomain: subdomain.to_string(),
        public_url: format!("https://{}.example.com", subdomain),
        dashboard_url: format!("https://dashboard.example.com/{}", subdomain),
        status,
        created_at: Utc::now(),
        started_at: Some(Utc::now()),
        ended_at: None,
    }
}

async fn send(
    state: &Arc<RelayState>,
    request: Request<Body>,
) -> (StatusCode, String) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn as_user(method: &str, uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token_for(user)))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_idle_relay() {
    let store = MemoryStore::new();
    let state = relay_state(&store);

    let (status, body) = send(&state, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["connected_tunnels"], 0);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let store = MemoryStore::new();
    let state = relay_state(&store);

    let (status, body) = send(&state, get("/api/openapi.json")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("/api/tunnels/{id}/status"));
}

#[tokio::test]
async fn test_unknown_tunnel_path_is_not_found() {
    let store = MemoryStore::new();
    let state = relay_state(&store);

    let (status, body) = send(&state, get("/api/tunnel/missing/hello")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Tunnel not found");
}

#[tokio::test]
async fn test_tunnel_path_without_local_path() {
    let store = MemoryStore::new();
    store
        .save(&stored_tunnel("t-1", "abc12345", TunnelStatus::Active))
        .await
        .unwrap();
    let state = relay_state(&store);

    let (status, body) = send(&state, get("/api/tunnel/t-1")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Local path not found");
}

#[tokio::test]
async fn test_inactive_tunnel_by_subdomain() {
    let store = MemoryStore::new();
    store
        .save(&stored_tunnel("t-1", "sleepy01", TunnelStatus::Inactive))
        .await
        .unwrap();
    let state = relay_state(&store);

    let request = Request::builder()
        .uri("/anything")
        .header("host", "sleepy01.example.com")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Tunnel is inactive");
}

#[tokio::test]
async fn test_active_tunnel_without_agent_is_offline() {
    let store = MemoryStore::new();
    store
        .save(&stored_tunnel("t-1", "lonely01", TunnelStatus::Active))
        .await
        .unwrap();
    let state = relay_state(&store);

    let (status, body) = send(&state, get("/api/tunnel/t-1/ping")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "Tunnel offline");
}

#[tokio::test]
async fn test_reserved_subdomain_reaches_management_routes() {
    let store = MemoryStore::new();
    let state = relay_state(&store);

    let request = Request::builder()
        .uri("/health")
        .header("host", "api.example.com")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&state, request).await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_management_routes_report_unknown_tunnel() {
    let store = MemoryStore::new();
    let state = relay_state(&store);

    let (status, body) = send(&state, as_user("GET", "/api/tunnels/nope/status", "owner")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["code"], "TUNNEL_NOT_FOUND");

    for uri in ["/api/tunnels/nope", "/api/tunnels/deactivate/nope"] {
        let (status, _) = send(&state, as_user("DELETE", uri, "owner")).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
    }
}

#[tokio::test]
async fn test_deactivate_marks_tunnel_deactivated() {
    let store = MemoryStore::new();
    store
        .save(&stored_tunnel("t-1", "retire01", TunnelStatus::Active))
        .await
        .unwrap();
    let state = relay_state(&store);

    let (status, _) = send(
        &state,
        as_user("DELETE", "/api/tunnels/deactivate/t-1", "owner"),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let tunnel = store.find_by_id("t-1").await.unwrap().unwrap();
    assert_eq!(tunnel.status, TunnelStatus::Deactivated);
}

#[tokio::test]
async fn test_management_routes_require_bearer_token() {
    let store = MemoryStore::new();
    store
        .save(&stored_tunnel("t-1", "guarded1", TunnelStatus::Active))
        .await
        .unwrap();
    let state = relay_state(&store);

    let (status, body) = send(&state, get("/api/tunnels/t-1/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["code"], "MISSING_AUTH");

    for uri in ["/api/tunnels/t-1", "/api/tunnels/deactivate/t-1"] {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
    }

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/tunnels/t-1")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["code"], "INVALID_TOKEN");

    let request = Request::builder()
        .uri("/api/tunnels/t-1/status")
        .header("authorization", token_for("owner"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["code"], "INVALID_AUTH_FORMAT");

    let tunnel = store.find_by_id("t-1").await.unwrap().unwrap();
    assert_eq!(tunnel.status, TunnelStatus::Active);
}

#[tokio::test]
async fn test_other_users_tunnel_reads_as_missing() {
    let store = MemoryStore::new();
    store
        .save(&stored_tunnel("t-1", "private1", TunnelStatus::Active))
        .await
        .unwrap();
    let state = relay_state(&store);

    let (status, body) = send(&state, as_user("GET", "/api/tunnels/t-1/status", "mallory")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["code"], "TUNNEL_NOT_FOUND");

    for uri in ["/api/tunnels/t-1", "/api/tunnels/deactivate/t-1"] {
        let (status, _) = send(&state, as_user("DELETE", uri, "mallory")).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
    }

    let tunnel = store.find_by_id("t-1").await.unwrap().unwrap();
    assert_eq!(tunnel.status, TunnelStatus::Active);

    let (status, _) = send(&state, as_user("GET", "/api/tunnels/t-1/status", "owner")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_relay_host_is_never_a_tunnel() {
    let store = MemoryStore::new();
    store
        .save(&stored_tunnel("t-1", "tunnels", TunnelStatus::Active))
        .await
        .unwrap();
    let config = RelayConfig {
        domain: "mycorp.com".to_string(),
        public_host: Some("tunnels.mycorp.com".to_string()),
        reserved_subdomains: vec!["edge".to_string()],
        ..RelayConfig::default()
    };
    let state = Arc::new(RelayState::new(
        config,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(JwtValidator::new(SECRET)),
    ));

    let request = Request::builder()
        .uri("/health")
        .header("host", "tunnels.mycorp.com")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("healthy"));

    // Reaches the connect route, which rejects a plain GET instead of proxying it
    let request = Request::builder()
        .uri("/tunnel")
        .header("host", "tunnels.mycorp.com")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, request).await;
    assert_ne!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_ne!(body, "Tunnel offline");

    let request = Request::builder()
        .uri("/health")
        .header("host", "edge.mycorp.com")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);

    // Built-in labels are replaced by the configured list
    let request = Request::builder()
        .uri("/health")
        .header("host", "www.mycorp.com")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Tunnel not found");
}

#[tokio::test]
async fn test_unrelated_path_falls_through_to_router() {
    let store = MemoryStore::new();
    let state = relay_state(&store);

    let (status, body) = send(&state, get("/not-a-route")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_shutdown_notice_reaches_connected_agents() {
    let store = MemoryStore::new();
    let state = relay_state(&store);
    let registry = state.manager.registry();

    let (live, mut live_rx) = TunnelChannel::new(4);
    let (gone, gone_rx) = TunnelChannel::new(4);
    registry.add("t-live", live);
    registry.add("t-gone", gone);
    drop(gone_rx);

    assert_eq!(state.announce_shutdown().await, 1);

    match live_rx.recv().await {
        Some(Outbound::Text(text)) => assert_eq!(
            TunnelCodec::decode(&text).unwrap(),
            TunnelMessage::error("Relay is shutting down")
        ),
        other => panic!("expected shutdown notice, got {:?}", other),
    }
}

async fn spawn_relay(state: Arc<RelayState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn next_message<S>(stream: &mut S) -> TunnelMessage
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for relay frame")
            .expect("relay closed the socket")
            .unwrap();
        if let Message::Text(text) = frame {
            return TunnelCodec::decode(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_agent_rejected_with_bad_token() {
    let store = MemoryStore::new();
    let state = relay_state(&store);
    let addr = spawn_relay(state).await;

    let url = format!("ws://{}/tunnel?token=garbage&port=3000", addr);
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let (_sink, mut stream) = socket.split();

    match next_message(&mut stream).await {
        TunnelMessage::Error { reason } => {
            assert!(reason.unwrap().starts_with("Authentication failed"));
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    assert_eq!(store.tunnel_count(), 0);
}

#[tokio::test]
async fn test_live_agent_round_trip_and_deactivation() {
    let store = MemoryStore::new();
    let state = relay_state(&store);
    let addr = spawn_relay(state.clone()).await;

    let url = format!("ws://{}/tunnel?token={}&port=3000", addr, token_for("alice"));
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let (mut sink, mut stream) = socket.split();

    let descriptor = match next_message(&mut stream).await {
        TunnelMessage::TunnelEstablished(descriptor) => descriptor,
        other => panic!("expected TUNNEL_ESTABLISHED, got {:?}", other),
    };
    assert!(descriptor.public_url.ends_with(".example.com"));

    // Agent: answer one request, then report what the relay says next
    let agent = tokio::spawn(async move {
        let request = match next_message(&mut stream).await {
            TunnelMessage::Request(request) => request,
            other => panic!("expected REQUEST, got {:?}", other),
        };
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/hello?x=1");
        assert_eq!(request.body, "ping");

        let mut response = ResponseEnvelope::text(request.request_id, 201, "pong");
        response
            .headers
            .insert("x-agent".to_string(), "yes".to_string());
        let reply = TunnelCodec::encode(&TunnelMessage::Response(response)).unwrap();
        sink.send(Message::Text(reply)).await.unwrap();

        let closing = next_message(&mut stream).await;
        (closing, sink, stream)
    });

    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/tunnel/{}/hello?x=1", descriptor.tunnel_id))
        .body(Body::from("ping"))
        .unwrap();
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-agent"], "yes");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"pong");

    let (status, body) = send(
        &state,
        as_user(
            "GET",
            &format!("/api/tunnels/{}/status", descriptor.tunnel_id),
            "alice",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "Active");
    assert_eq!(json["connected"], true);
    assert_eq!(json["request_count"], 1);
    assert_eq!(json["bytes_transferred"], 8);

    let (status, _) = send(
        &state,
        as_user(
            "DELETE",
            &format!("/api/tunnels/{}", descriptor.tunnel_id),
            "alice",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (closing, _sink, _stream) = agent.await.unwrap();
    match closing {
        TunnelMessage::TunnelClosed { reason } => {
            assert_eq!(reason.as_deref(), Some("Tunnel deactivated by owner"));
        }
        other => panic!("expected TUNNEL_CLOSED, got {:?}", other),
    }

    let (status, body) = send(
        &state,
        get(&format!("/api/tunnel/{}/hello", descriptor.tunnel_id)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Tunnel is inactive");
}
