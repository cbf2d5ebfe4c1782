//! HTTP surface of the TunnlR relay
//!
//! One axum service carries everything the relay exposes:
//! - `GET /tunnel`: agent connect endpoint (WebSocket upgrade)
//! - tunnel traffic, recognized by [`proxy::tunnel_proxy`] before routing
//! - `/api/tunnels/...`: management endpoints
//! - `/health`, plus Swagger UI at `/swagger-ui` and the OpenAPI document at `/api/openapi.json`

pub mod auth;
pub mod handlers;
pub mod models;
pub mod proxy;
pub mod ws;

use axum::{
    http::{header, Method},
    middleware,
    routing::{delete, get},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use tunnlr_auth::AuthValidator;
use tunnlr_control::{
    ConnectionRegistry, LifecycleConfig, PendingRequests, ProxyConfig, ProxyEngine, ResponseMode,
    TunnelHandler, TunnelManager, DEFAULT_CHANNEL_CAPACITY, DEFAULT_REQUEST_TIMEOUT,
};
use tunnlr_proto::{TunnelCodec, TunnelMessage, CONNECT_PATH, DEFAULT_API_PREFIX};
use tunnlr_relay_db::{TrafficLog, TunnelStore};
use tunnlr_router::{RouteConfig, RouteResolver};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

pub use models::{ConnectParams, ErrorResponse, HealthResponse, TunnelStatusResponse};

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "TunnlR Relay API",
        version = "0.1.0",
        description = "Reverse-tunnel relay: agent connect endpoint and tunnel management",
        license(name = "MIT OR Apache-2.0")
    ),
    paths(
        ws::connect_agent,
        handlers::deactivate_tunnel,
        handlers::deactivate_tunnel_legacy,
        handlers::tunnel_status,
        handlers::health_check,
    ),
    components(
        schemas(
            models::TunnelStatusResponse,
            models::HealthResponse,
            models::ErrorResponse,
            tunnlr_proto::TunnelStatus,
        )
    ),
    tags(
        (name = "agents", description = "Agent connect endpoint"),
        (name = "tunnels", description = "Tunnel management endpoints"),
        (name = "system", description = "System health and info")
    )
)]
struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the HTTP server to
    pub bind_addr: SocketAddr,
    /// Base domain tunnels are published under
    pub domain: String,
    /// Scheme used in public and dashboard URLs
    pub public_scheme: String,
    /// First path segment of test paths (`/{api_prefix}/tunnel/{id}/...`)
    pub api_prefix: String,
    /// Host labels that never name a tunnel
    pub reserved_subdomains: Vec<String>,
    /// Host the relay itself is reached at; its first label is reserved too
    pub public_host: Option<String>,
    /// How long to wait for an agent's response
    pub request_timeout: Duration,
    pub response_mode: ResponseMode,
    /// Keep-alive ping cadence on agent channels
    pub ping_interval: Duration,
    /// Outbound queue depth per agent
    pub channel_capacity: usize,
    /// Largest inbound body the proxy will buffer
    pub body_limit: usize,
    pub enable_cors: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            domain: "tunnlr.dev".to_string(),
            public_scheme: "https".to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            reserved_subdomains: RouteConfig::default().reserved_subdomains,
            public_host: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            response_mode: ResponseMode::Passthrough,
            ping_interval: Duration::from_secs(10),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            body_limit: 10 * 1024 * 1024,
            enable_cors: true,
        }
    }
}

/// Shared state behind every handler
pub struct RelayState {
    pub config: RelayConfig,
    pub resolver: RouteResolver,
    pub manager: Arc<TunnelManager>,
    pub engine: ProxyEngine,
    pub handler: TunnelHandler,
    pub pending: PendingRequests,
    pub traffic: Arc<dyn TrafficLog>,
    /// Validates management bearer tokens; shared with the connect handler
    pub auth: Arc<dyn AuthValidator>,
}

impl RelayState {
    /// Wire the relay engine together over the given stores and auth collaborator
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn TunnelStore>,
        traffic: Arc<dyn TrafficLog>,
        auth: Arc<dyn AuthValidator>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let pending = PendingRequests::new();

        let manager = Arc::new(TunnelManager::new(
            store.clone(),
            registry.clone(),
            LifecycleConfig {
                domain: config.domain.clone(),
                public_scheme: config.public_scheme.clone(),
                ..LifecycleConfig::default()
            },
        ));

        let engine = ProxyEngine::new(
            store,
            traffic.clone(),
            registry,
            pending.clone(),
            ProxyConfig {
                request_timeout: config.request_timeout,
                response_mode: config.response_mode,
            },
        );

        let handler = TunnelHandler::new(auth.clone(), manager.clone(), pending.clone());

        let mut route_config = RouteConfig {
            api_prefix: config.api_prefix.clone(),
            reserved_subdomains: config.reserved_subdomains.clone(),
        };
        if let Some(host) = &config.public_host {
            route_config.reserve_host(host);
        }
        let resolver = RouteResolver::new(route_config);

        Self {
            config,
            resolver,
            manager,
            engine,
            handler,
            pending,
            traffic,
            auth,
        }
    }
}

impl RelayState {
    /// Send an ERROR to every connected agent before the relay goes away.
    ///
    /// Returns how many agents were reached.
    pub async fn announce_shutdown(&self) -> usize {
        let payload = match TunnelCodec::encode(&TunnelMessage::error("Relay is shutting down")) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode shutdown notice: {}", e);
                return 0;
            }
        };

        let registry = self.manager.registry();
        let connected = registry.len();
        let failures = registry.broadcast(&payload).await;
        for failure in &failures {
            debug!(
                "Shutdown notice not delivered to tunnel {}: {:?}",
                failure.tunnel_id, failure.outcome
            );
        }
        connected.saturating_sub(failures.len())
    }
}

/// Build the relay's axum service
pub fn build_router(state: Arc<RelayState>) -> Router {
    let api_router = Router::new()
        .route(CONNECT_PATH, get(ws::connect_agent))
        .route("/health", get(handlers::health_check))
        .route("/api/tunnels/{id}", delete(handlers::deactivate_tunnel))
        .route(
            "/api/tunnels/deactivate/{id}",
            delete(handlers::deactivate_tunnel_legacy),
        )
        .route("/api/tunnels/{id}/status", get(handlers::tunnel_status))
        .with_state(state.clone());

    let mut router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .merge(api_router);

    if state.config.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_origin(Any),
        );
    }

    // The proxy wraps the whole router so it also sees paths no route knows about
    let service = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(state, proxy::tunnel_proxy))
        .service(router);

    Router::new().fallback_service(service)
}

/// The relay HTTP server
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(state: RelayState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind and serve until the process stops
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.state.config.bind_addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindError { addr, source })?;

        info!("Starting relay on {}", addr);
        info!("Agent endpoint: ws://{}{}", addr, CONNECT_PATH);
        info!("Swagger UI: http://{}/swagger-ui", addr);

        self.serve(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve(self, listener: tokio::net::TcpListener) -> Result<(), ServerError> {
        let router = self.router();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}
