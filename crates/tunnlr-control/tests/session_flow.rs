//! End-to-end relay flow over in-memory channels
//!
//! Plays the agent side by hand: reads frames the relay queues for it and feeds text frames
//! back into the session's inbound stream.

use chrono::Duration as ChronoDuration;
use futures::channel::mpsc as fmpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tunnlr_auth::{JwtClaims, JwtValidator};
use tunnlr_control::{
    ConnectionRegistry, LifecycleConfig, Outbound, PendingRequests, ProxyConfig, ProxyEngine,
    ProxyError, ProxyRequest, SessionOutcome, SessionParams, TunnelChannel, TunnelHandler,
    TunnelManager,
};
use tunnlr_proto::{
    HeaderMap, ResponseEnvelope, TunnelCodec, TunnelDescriptor, TunnelMessage, TunnelStatus,
};
use tunnlr_relay_db::{MemoryStore, TunnelStore};
use tunnlr_router::RouteResolver;

const SECRET: &[u8] = b"session-flow-secret";

struct Relay {
    handler: Arc<TunnelHandler>,
    engine: Arc<ProxyEngine>,
    store: MemoryStore,
    registry: ConnectionRegistry,
}

fn relay() -> Relay {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = MemoryStore::new();
    let registry = ConnectionRegistry::new();
    let pending = PendingRequests::new();

    let manager = Arc::new(TunnelManager::new(
        Arc::new(store.clone()),
        registry.clone(),
        LifecycleConfig {
            domain: "example.com".to_string(),
            ..LifecycleConfig::default()
        },
    ));

    let handler = Arc::new(TunnelHandler::new(
        Arc::new(JwtValidator::new(SECRET)),
        manager,
        pending.clone(),
    ));

    let engine = Arc::new(ProxyEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        registry.clone(),
        pending,
        ProxyConfig {
            request_timeout: Duration::from_secs(5),
            ..ProxyConfig::default()
        },
    ));

    Relay {
        handler,
        engine,
        store,
        registry,
    }
}

fn token(user: &str) -> String {
    let claims = JwtClaims::new(
        user.to_string(),
        "test".to_string(),
        "test".to_string(),
        ChronoDuration::hours(1),
    );
    JwtValidator::encode(SECRET, &claims).unwrap()
}

fn params(token: Option<String>, port: &str) -> SessionParams {
    SessionParams {
        token,
        port: Some(port.to_string()),
        protocol: Some("http".to_string()),
    }
}

async fn next_message(rx: &mut mpsc::Receiver<Outbound>) -> TunnelMessage {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Outbound::Text(text))) => TunnelCodec::decode(&text).unwrap(),
        other => panic!("Expected a text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rejects_invalid_credential_with_error_then_close() {
    let relay = relay();
    let (channel, mut rx) = TunnelChannel::new(8);
    let (_inbound_tx, inbound_rx) = fmpsc::unbounded::<Result<String, String>>();

    let outcome = relay
        .handler
        .handle_session(params(Some("garbage".to_string()), "3000"), channel, inbound_rx)
        .await;

    assert!(matches!(outcome, SessionOutcome::Rejected { .. }));
    assert!(matches!(
        next_message(&mut rx).await,
        TunnelMessage::Error { reason: Some(_) }
    ));
    assert!(matches!(rx.recv().await, Some(Outbound::Close { .. })));
    assert!(relay.registry.is_empty());
}

#[tokio::test]
async fn test_rejects_missing_or_invalid_port() {
    let relay = relay();

    for port in ["", "abc", "0", "70000"] {
        let (channel, mut rx) = TunnelChannel::new(8);
        let (_tx, inbound_rx) = fmpsc::unbounded::<Result<String, String>>();

        let outcome = relay
            .handler
            .handle_session(params(Some(token("alice")), port), channel, inbound_rx)
            .await;

        assert_eq!(
            outcome,
            SessionOutcome::Rejected {
                reason: "Invalid or missing port".to_string()
            }
        );
        assert!(matches!(
            next_message(&mut rx).await,
            TunnelMessage::Error { .. }
        ));
    }
}

#[tokio::test]
async fn test_full_request_cycle_and_disconnect() {
    let relay = relay();
    let (channel, mut rx) = TunnelChannel::new(8);
    let (inbound_tx, inbound_rx) = fmpsc::unbounded::<Result<String, String>>();

    let handler = relay.handler.clone();
    let session = tokio::spawn(async move {
        handler
            .handle_session(params(Some(token("alice")), "3000"), channel, inbound_rx)
            .await
    });

    // First message is the tunnel descriptor
    let TunnelMessage::TunnelEstablished(TunnelDescriptor {
        tunnel_id,
        public_url,
        dashboard_url,
    }) = next_message(&mut rx).await
    else {
        panic!("expected TUNNEL_ESTABLISHED");
    };
    let subdomain = public_url
        .trim_start_matches("https://")
        .trim_end_matches(".example.com")
        .to_string();
    assert_eq!(dashboard_url, format!("https://dashboard.example.com/{}", subdomain));

    // A public request arrives for the subdomain
    let resolution = RouteResolver::default()
        .resolve(Some(&format!("{}.example.com", subdomain)), "/widgets")
        .unwrap();
    let engine = relay.engine.clone();
    let inflight = tokio::spawn(async move {
        engine
            .forward(
                resolution,
                ProxyRequest {
                    method: "GET".to_string(),
                    headers: HeaderMap::new(),
                    body: String::new(),
                    client_ip: None,
                },
            )
            .await
    });

    // Agent receives the envelope and answers it
    let TunnelMessage::Request(request) = next_message(&mut rx).await else {
        panic!("expected REQUEST");
    };
    assert_eq!(request.path, "/widgets");

    // Noise the relay must tolerate
    inbound_tx
        .unbounded_send(Ok(r#"{"type":"HEARTBEAT"}"#.to_string()))
        .unwrap();
    inbound_tx.unbounded_send(Ok("not json".to_string())).unwrap();

    let response = TunnelMessage::Response(ResponseEnvelope::text(
        request.request_id.clone(),
        200,
        "three widgets",
    ));
    inbound_tx
        .unbounded_send(Ok(TunnelCodec::encode(&response).unwrap()))
        .unwrap();

    let reply = inflight.await.unwrap().unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "three widgets");

    // Agent goes away
    drop(inbound_tx);
    assert_eq!(
        session.await.unwrap(),
        SessionOutcome::Closed {
            tunnel_id: tunnel_id.clone()
        }
    );

    let stored = relay.store.find_by_id(&tunnel_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TunnelStatus::Inactive);
    assert!(stored.ended_at.is_some());
    assert!(!relay.registry.contains(&tunnel_id));

    let err = relay
        .engine
        .forward(
            RouteResolver::default()
                .resolve(None, &format!("/api/tunnel/{}/widgets", tunnel_id))
                .unwrap(),
            ProxyRequest {
                method: "GET".to_string(),
                headers: HeaderMap::new(),
                body: String::new(),
                client_ip: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::TunnelInactive));
}

#[tokio::test]
async fn test_reconnect_reuses_tunnel_and_old_session_end_is_harmless() {
    let relay = relay();

    let (first, mut first_rx) = TunnelChannel::new(8);
    let (first_tx, first_in) = fmpsc::unbounded::<Result<String, String>>();
    let handler = relay.handler.clone();
    let first_session = tokio::spawn(async move {
        handler
            .handle_session(params(Some(token("alice")), "3000"), first, first_in)
            .await
    });
    let TunnelMessage::TunnelEstablished(first_desc) = next_message(&mut first_rx).await else {
        panic!("expected TUNNEL_ESTABLISHED");
    };

    let (second, mut second_rx) = TunnelChannel::new(8);
    let (_second_tx, second_in) = fmpsc::unbounded::<Result<String, String>>();
    let handler = relay.handler.clone();
    let _second_session = tokio::spawn(async move {
        handler
            .handle_session(params(Some(token("alice")), "4000"), second, second_in)
            .await
    });
    let TunnelMessage::TunnelEstablished(second_desc) = next_message(&mut second_rx).await
    else {
        panic!("expected TUNNEL_ESTABLISHED");
    };

    assert_eq!(first_desc, second_desc);

    // The first agent drops; the tunnel stays live for the second one
    drop(first_tx);
    first_session.await.unwrap();

    let stored = relay
        .store
        .find_by_id(&second_desc.tunnel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TunnelStatus::Active);
    assert_eq!(stored.local_port, 4000);
    assert!(relay.registry.contains(&second_desc.tunnel_id));
}
