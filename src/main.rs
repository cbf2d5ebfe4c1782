//! TunnlR CLI
//!
//! Runs the relay, or connects a local service to one.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnlr_auth::{JwtClaims, JwtValidator, DEFAULT_AUDIENCE, DEFAULT_ISSUER};
use tunnlr_client::{
    AgentConfig, AgentEvent, ConnectOutcome, ControlEvent, RelayApiClient, TokenStore,
    TunnelAgent,
};
use tunnlr_control::ResponseMode;
use tunnlr_proto::DEFAULT_API_PREFIX;
use tunnlr_relay_db::{DbStore, MemoryStore, TrafficLog, TunnelStore};
use tunnlr_server::{RelayConfig, RelayServer, RelayState};

/// TunnlR - Expose local services through a public relay
#[derive(Parser, Debug)]
#[command(name = "tunnlr")]
#[command(about = "TunnlR - Expose local services through a public relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the public relay. Agents connect to ws://<bind>/tunnel; public traffic reaches a tunnel
either as https://<subdomain>.<domain>/... or as /api/tunnel/<tunnel-id>/... on the relay.

EXAMPLES:
  # In-memory relay for local testing
  tunnlr relay --jwt-secret dev-secret --domain localhost.test

  # Persistent relay on SQLite
  tunnlr relay --jwt-secret $SECRET --database-url "sqlite://./tunnlr.db?mode=rwc"
    "#)]
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8080", env = "TUNNLR_BIND")]
        bind: SocketAddr,

        /// Base domain tunnels are published under
        #[arg(long, default_value = "tunnlr.dev", env = "TUNNLR_DOMAIN")]
        domain: String,

        /// Scheme used when building public URLs
        #[arg(long, default_value = "https", env = "TUNNLR_PUBLIC_SCHEME")]
        public_scheme: String,

        /// Host the relay itself is reached at; its first label never names a tunnel
        #[arg(long, env = "TUNNLR_PUBLIC_HOST")]
        public_host: Option<String>,

        /// Host labels that never name a tunnel (replaces the built-in list)
        #[arg(
            long = "reserved-subdomain",
            value_delimiter = ',',
            env = "TUNNLR_RESERVED_SUBDOMAINS"
        )]
        reserved_subdomains: Vec<String>,

        /// First path segment of /<prefix>/tunnel/<id>/... test paths
        #[arg(long, default_value = DEFAULT_API_PREFIX, env = "TUNNLR_API_PREFIX")]
        api_prefix: String,

        /// Secret used to verify agent tokens
        #[arg(long, env = "TUNNLR_JWT_SECRET")]
        jwt_secret: String,

        /// Require this token issuer
        #[arg(long, env = "TUNNLR_JWT_ISSUER")]
        jwt_issuer: Option<String>,

        /// Require this token audience
        #[arg(long, env = "TUNNLR_JWT_AUDIENCE")]
        jwt_audience: Option<String>,

        /// Database URL; tunnels are kept in memory when omitted
        #[arg(long, env = "TUNNLR_DATABASE_URL")]
        database_url: Option<String>,

        /// Seconds to wait for an agent's response
        #[arg(long, default_value = "30", env = "TUNNLR_REQUEST_TIMEOUT")]
        request_timeout: u64,

        /// Seconds between keep-alive pings on agent connections
        #[arg(long, default_value = "10", env = "TUNNLR_PING_INTERVAL")]
        ping_interval: u64,

        /// Always answer 200 with the raw body instead of relaying status and headers
        #[arg(long, env = "TUNNLR_LEGACY_OK_RESPONSES")]
        legacy_ok_responses: bool,
    },

    /// Expose a local port through a relay
    Start {
        /// Local port to expose
        #[arg(short, long, env = "TUNNLR_PORT")]
        port: u16,

        /// Protocol of the local service
        #[arg(long, default_value = "http", env = "TUNNLR_PROTOCOL")]
        protocol: String,

        /// Relay URL
        #[arg(long, default_value = "ws://localhost:8080", env = "TUNNLR_RELAY")]
        relay: String,

        /// Authentication token (falls back to the stored token)
        #[arg(long, env = "TUNNLR_TOKEN")]
        token: Option<String>,

        /// Host of the local service
        #[arg(long, default_value = "localhost", env = "TUNNLR_LOCAL_HOST")]
        local_host: String,

        /// Seconds to wait for the local service
        #[arg(long, default_value = "30", env = "TUNNLR_LOCAL_TIMEOUT")]
        local_timeout: u64,
    },

    /// Deactivate a tunnel
    Stop {
        /// Tunnel to deactivate (defaults to the last one started here)
        tunnel_id: Option<String>,

        /// Relay URL
        #[arg(long, default_value = "ws://localhost:8080", env = "TUNNLR_RELAY")]
        relay: String,

        /// Token the tunnel was opened with (falls back to the stored token)
        #[arg(long, env = "TUNNLR_TOKEN")]
        token: Option<String>,
    },

    /// Show a tunnel's status
    Status {
        /// Tunnel to inspect (defaults to the last one started here)
        tunnel_id: Option<String>,

        /// Relay URL
        #[arg(long, default_value = "ws://localhost:8080", env = "TUNNLR_RELAY")]
        relay: String,

        /// Token the tunnel was opened with (falls back to the stored token)
        #[arg(long, env = "TUNNLR_TOKEN")]
        token: Option<String>,
    },

    /// Manage authentication tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommands {
    /// Mint a token signed with the relay's secret
    Mint {
        /// JWT secret (must match the relay's --jwt-secret)
        #[arg(long, env = "TUNNLR_JWT_SECRET")]
        secret: String,

        /// User the token identifies (a random id when omitted)
        #[arg(long)]
        user: Option<String>,

        /// Display name recorded in the token
        #[arg(long)]
        name: Option<String>,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Protocols the token may open (all when omitted)
        #[arg(long, value_delimiter = ',')]
        protocols: Vec<String>,

        #[arg(long, default_value = DEFAULT_ISSUER, env = "TUNNLR_JWT_ISSUER")]
        issuer: String,

        #[arg(long, default_value = DEFAULT_AUDIENCE, env = "TUNNLR_JWT_AUDIENCE")]
        audience: String,

        /// Also store the token for `tunnlr start`
        #[arg(long)]
        save: bool,
    },
    /// Store a token for later `start` commands
    Save { token: String },
    /// Forget the stored token
    Clear,
    /// Print where the token is stored and whether one is present
    Show,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Relay {
            bind,
            domain,
            public_scheme,
            public_host,
            reserved_subdomains,
            api_prefix,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            database_url,
            request_timeout,
            ping_interval,
            legacy_ok_responses,
        } => {
            let defaults = RelayConfig::default();
            let config = RelayConfig {
                bind_addr: bind,
                domain,
                public_scheme,
                public_host,
                api_prefix,
                reserved_subdomains: if reserved_subdomains.is_empty() {
                    defaults.reserved_subdomains.clone()
                } else {
                    reserved_subdomains
                },
                request_timeout: Duration::from_secs(request_timeout),
                ping_interval: Duration::from_secs(ping_interval),
                response_mode: if legacy_ok_responses {
                    ResponseMode::LegacyOk
                } else {
                    ResponseMode::Passthrough
                },
                ..defaults
            };

            let mut validator = JwtValidator::new(jwt_secret.as_bytes());
            if let Some(issuer) = jwt_issuer {
                validator = validator.with_issuer(issuer);
            }
            if let Some(audience) = jwt_audience {
                validator = validator.with_audience(audience);
            }

            run_relay(config, database_url, validator).await
        }
        Commands::Start {
            port,
            protocol,
            relay,
            token,
            local_host,
            local_timeout,
        } => {
            let store = TokenStore::default_location()?;
            let token = match token {
                Some(token) => token,
                None => stored_token(&store)?,
            };

            let config = AgentConfig::builder()
                .relay_url(relay)
                .auth_token(token)
                .local_host(local_host)
                .local_port(port)
                .protocol(protocol)
                .local_timeout(Duration::from_secs(local_timeout))
                .build()?;

            run_agent(config, store).await
        }
        Commands::Stop {
            tunnel_id,
            relay,
            token,
        } => {
            let tunnel_id = resolve_tunnel_id(tunnel_id)?;
            RelayApiClient::new(&relay, resolve_token(token)?)?
                .deactivate(&tunnel_id)
                .await
                .with_context(|| format!("Failed to deactivate tunnel {}", tunnel_id))?;
            println!("Tunnel {} deactivated", tunnel_id);
            Ok(())
        }
        Commands::Status {
            tunnel_id,
            relay,
            token,
        } => {
            let tunnel_id = resolve_tunnel_id(tunnel_id)?;
            let report = RelayApiClient::new(&relay, resolve_token(token)?)?
                .status(&tunnel_id)
                .await
                .with_context(|| format!("Failed to fetch status of tunnel {}", tunnel_id))?;

            println!("Tunnel:      {}", report.tunnel_id);
            println!("Status:      {}", report.status);
            println!("Connected:   {}", report.connected);
            println!("Public URL:  {}", report.public_url);
            println!("Dashboard:   {}", report.dashboard_url);
            println!("Local:       {}://localhost:{}", report.protocol, report.local_port);
            println!("Requests:    {}", report.request_count);
            println!("Transferred: {} bytes", report.bytes_transferred);
            Ok(())
        }
        Commands::Token { command } => handle_token_command(command),
    }
}

async fn run_relay(
    config: RelayConfig,
    database_url: Option<String>,
    validator: JwtValidator,
) -> Result<()> {
    let (store, traffic): (Arc<dyn TunnelStore>, Arc<dyn TrafficLog>) = match database_url {
        Some(url) => {
            let db = DbStore::open(&url)
                .await
                .context("Failed to open tunnel database")?;
            let db = Arc::new(db);
            (db.clone(), db)
        }
        None => {
            warn!("No database configured, tunnels will not survive a restart");
            let memory = MemoryStore::new();
            (Arc::new(memory.clone()), Arc::new(memory))
        }
    };

    info!("Publishing tunnels under *.{}", config.domain);
    let state = RelayState::new(config, store, traffic, Arc::new(validator));

    let server = RelayServer::new(state);
    let state = server.state().clone();

    tokio::select! {
        result = server.run() => {
            result.context("Relay stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            let notified = state.announce_shutdown().await;
            if notified > 0 {
                info!("Told {} connected agent(s) the relay is going away", notified);
                // Agent writers run on their own tasks
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }

    Ok(())
}

async fn run_agent(config: AgentConfig, store: TokenStore) -> Result<()> {
    let local = format!("{}:{}", config.local_host, config.local_port);
    let agent = TunnelAgent::new(config);

    let session = match agent.connect().await.context("Failed to reach relay")? {
        ConnectOutcome::Established(session) => session,
        ConnectOutcome::Rejected { reason } => bail!("Relay rejected the tunnel: {}", reason),
    };

    let descriptor = session.descriptor().clone();
    if let Err(e) = store.set_last_tunnel_id(&descriptor.tunnel_id) {
        warn!("Could not remember tunnel id: {:#}", e);
    }

    println!();
    println!("Tunnel started!");
    println!("  Tunnel ID:  {}", descriptor.tunnel_id);
    println!("  Public URL: {}", descriptor.public_url);
    println!("  Dashboard:  {}", descriptor.dashboard_url);
    println!("  Forwarding: {} -> {}", descriptor.public_url, local);
    println!();
    println!("Press Ctrl+C to stop the tunnel...");

    let (events_tx, mut events) = mpsc::channel(64);
    let mut running = tokio::spawn(session.run(events_tx));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(AgentEvent::RequestForwarded { method, path, status_code, elapsed, .. }) => {
                    info!("{} {} -> {} ({} ms)", method, path, status_code, elapsed.as_millis());
                }
                Some(AgentEvent::Control(ControlEvent::Error { reason })) => {
                    warn!("Relay error: {}", reason.unwrap_or_default());
                }
                Some(AgentEvent::Control(ControlEvent::TunnelClosed { reason })) => {
                    info!("Tunnel closed by relay: {}", reason.unwrap_or_default());
                }
                Some(AgentEvent::Disconnected { reason }) => {
                    match reason {
                        Some(reason) => info!("Disconnected: {}", reason),
                        None => info!("Disconnected"),
                    }
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                running.abort();
                return Ok(());
            }
        }
    }

    match (&mut running).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Tunnel session failed: {}", e);
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn stored_token(store: &TokenStore) -> Result<String> {
    store
        .token()?
        .context("No token given and none stored. Pass --token or run 'tunnlr token save'")
}

fn resolve_token(token: Option<String>) -> Result<String> {
    match token {
        Some(token) => Ok(token),
        None => stored_token(&TokenStore::default_location()?),
    }
}

fn resolve_tunnel_id(tunnel_id: Option<String>) -> Result<String> {
    if let Some(id) = tunnel_id {
        return Ok(id);
    }
    TokenStore::default_location()?
        .last_tunnel_id()?
        .context("No tunnel id given and no tunnel started from this machine")
}

fn handle_token_command(command: TokenCommands) -> Result<()> {
    let store = TokenStore::default_location()?;

    match command {
        TokenCommands::Mint {
            secret,
            user,
            name,
            hours,
            protocols,
            issuer,
            audience,
            save,
        } => {
            let subject = user.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut claims = JwtClaims::new(
                subject.clone(),
                issuer,
                audience,
                chrono::Duration::hours(hours),
            )
            .with_protocols(protocols);
            if let Some(name) = name {
                claims = claims.with_name(name);
            }

            let token = JwtValidator::encode(secret.as_bytes(), &claims)?;
            println!("{}", token);

            if save {
                store.set_token(&token)?;
                eprintln!("Token for {} saved to {}", subject, store.path().display());
            }
            Ok(())
        }
        TokenCommands::Save { token } => {
            store.set_token(token)?;
            println!("Token saved to {}", store.path().display());
            Ok(())
        }
        TokenCommands::Clear => {
            store.clear()?;
            println!("Stored token cleared");
            Ok(())
        }
        TokenCommands::Show => {
            let present = store.token()?.is_some();
            println!(
                "{}: {}",
                store.path().display(),
                if present { "token stored" } else { "no token" }
            );
            Ok(())
        }
    }
}
