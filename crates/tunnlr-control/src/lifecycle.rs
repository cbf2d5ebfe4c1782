//! Tunnel lifecycle: create/reuse on connect, deactivate, disconnect

use crate::connection::{ConnectionRegistry, SendOutcome, TunnelChannel};
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use tunnlr_proto::{TunnelCodec, TunnelMessage, TunnelStatus};
use tunnlr_relay_db::{StoreError, Tunnel, TunnelStore};

const SUBDOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_SUBDOMAIN_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Could not allocate a free subdomain")]
    SubdomainExhausted,
}

/// Naming of public and dashboard URLs
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Base domain tunnels are published under
    pub domain: String,
    /// Scheme of public URLs
    pub public_scheme: String,
    /// Length of generated subdomains
    pub subdomain_length: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            domain: "tunnlr.dev".to_string(),
            public_scheme: "https".to_string(),
            subdomain_length: 8,
        }
    }
}

/// Creates, reuses and retires tunnel records and keeps the registry in step with them
pub struct TunnelManager {
    store: Arc<dyn TunnelStore>,
    registry: ConnectionRegistry,
    config: LifecycleConfig,
    /// Serializes the find-active-then-create sequence per owner. An entry lives only while
    /// someone holds or waits for it.
    owner_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held owner lock; drops the owner's map entry when nobody else wants it
struct OwnerGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    owner: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        // Release first so our own reference is gone before counting
        self.guard.take();
        self.locks
            .remove_if(&self.owner, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl TunnelManager {
    pub fn new(
        store: Arc<dyn TunnelStore>,
        registry: ConnectionRegistry,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            owner_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Attach an agent channel to the owner's tunnel.
    ///
    /// Reuses the owner's `Active` tunnel (updating its port and protocol) or creates a new one
    /// with a fresh subdomain. Either way the channel is registered under the tunnel id.
    pub async fn connect(
        &self,
        owner: &str,
        local_port: u16,
        protocol: &str,
        channel: TunnelChannel,
    ) -> Result<Tunnel, LifecycleError> {
        let _guard = self.lock_owner(owner).await;

        let now = Utc::now();
        let tunnel = match self.store.find_active_tunnel(owner).await? {
            Some(mut tunnel) => {
                tunnel.local_port = local_port;
                tunnel.protocol = protocol.to_string();
                tunnel.started_at = Some(now);
                tunnel.ended_at = None;
                self.store.save(&tunnel).await?;

                info!(
                    "Reusing active tunnel {} for user {} (port {})",
                    tunnel.id, owner, local_port
                );
                tunnel
            }
            None => {
                let subdomain = self.allocate_subdomain().await?;
                let tunnel = Tunnel {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: owner.to_string(),
                    local_port,
                    protocol: protocol.to_string(),
                    public_url: self.public_url(&subdomain),
                    dashboard_url: self.dashboard_url(&subdomain),
                    subdomain,
                    status: TunnelStatus::Active,
                    created_at: now,
                    started_at: Some(now),
                    ended_at: None,
                };
                self.store.save(&tunnel).await?;

                info!(
                    "Created tunnel {} for user {} at {}",
                    tunnel.id, owner, tunnel.public_url
                );
                tunnel
            }
        };

        if let Some(previous) = self.registry.add(&tunnel.id, channel) {
            debug!(
                "Channel {} replaced for tunnel {}",
                previous.connection_id(),
                tunnel.id
            );
        }

        Ok(tunnel)
    }

    /// Deactivate a tunnel on its owner's request and tell a connected agent about it
    pub async fn deactivate(&self, tunnel_id: &str) -> Result<Tunnel, LifecycleError> {
        let mut tunnel = self
            .store
            .find_by_id(tunnel_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(tunnel_id.to_string()))?;

        {
            let _guard = self.lock_owner(&tunnel.user_id).await;

            tunnel.status = TunnelStatus::Deactivated;
            tunnel.ended_at = Some(Utc::now());
            self.store.save(&tunnel).await?;
        }

        info!("Tunnel {} deactivated", tunnel_id);

        let payload = match TunnelCodec::encode(&TunnelMessage::tunnel_closed(
            "Tunnel deactivated by owner",
        )) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode TUNNEL_CLOSED for {}: {}", tunnel_id, e);
                return Ok(tunnel);
            }
        };

        match self.registry.send(tunnel_id, payload).await {
            SendOutcome::Delivered => debug!("Notified agent of tunnel {} closure", tunnel_id),
            SendOutcome::Absent | SendOutcome::Closed => {
                debug!("Tunnel {} has no connected agent to notify", tunnel_id)
            }
        }

        Ok(tunnel)
    }

    /// Handle the end of an agent session.
    ///
    /// Returns `true` if the session still owned the tunnel's channel and the tunnel was marked
    /// `Inactive`. A session that was already replaced by a newer one changes nothing.
    pub async fn disconnect(
        &self,
        tunnel_id: &str,
        connection_id: u64,
    ) -> Result<bool, LifecycleError> {
        let Some(tunnel) = self.store.find_by_id(tunnel_id).await? else {
            self.registry.remove_if_current(tunnel_id, connection_id);
            return Ok(false);
        };

        let _guard = self.lock_owner(&tunnel.user_id).await;

        if !self.registry.remove_if_current(tunnel_id, connection_id) {
            debug!(
                "Session {} for tunnel {} was superseded, leaving tunnel state alone",
                connection_id, tunnel_id
            );
            return Ok(false);
        }

        // Re-read under the lock; a concurrent deactivate may have changed it
        let Some(mut tunnel) = self.store.find_by_id(tunnel_id).await? else {
            return Ok(false);
        };

        if tunnel.status == TunnelStatus::Active {
            tunnel.status = TunnelStatus::Inactive;
            tunnel.ended_at = Some(Utc::now());
            self.store.save(&tunnel).await?;
            info!("Tunnel {} disconnected, marked inactive", tunnel_id);
        }

        Ok(true)
    }

    pub async fn find(&self, tunnel_id: &str) -> Result<Option<Tunnel>, LifecycleError> {
        Ok(self.store.find_by_id(tunnel_id).await?)
    }

    pub fn public_url(&self, subdomain: &str) -> String {
        format!(
            "{}://{}.{}",
            self.config.public_scheme, subdomain, self.config.domain
        )
    }

    pub fn dashboard_url(&self, subdomain: &str) -> String {
        format!(
            "{}://dashboard.{}/{}",
            self.config.public_scheme, self.config.domain, subdomain
        )
    }

    async fn lock_owner(&self, owner: &str) -> OwnerGuard<'_> {
        let lock = self
            .owner_locks
            .entry(owner.to_string())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        OwnerGuard {
            locks: &self.owner_locks,
            owner: owner.to_string(),
            guard: Some(guard),
        }
    }

    async fn allocate_subdomain(&self) -> Result<String, LifecycleError> {
        for _ in 0..MAX_SUBDOMAIN_ATTEMPTS {
            let candidate = generate_subdomain(self.config.subdomain_length);
            if self.store.find_by_subdomain(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            debug!("Subdomain {} already taken, retrying", candidate);
        }
        Err(LifecycleError::SubdomainExhausted)
    }
}

/// Random lowercase base36 label
pub fn generate_subdomain(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| SUBDOMAIN_CHARSET[rng.gen_range(0..SUBDOMAIN_CHARSET.len())] as char)
        .collect()
}
