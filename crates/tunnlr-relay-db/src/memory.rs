//! In-process store

use crate::model::{TrafficRecord, TrafficSummary, Tunnel};
use crate::store::{StoreError, TrafficLog, TunnelStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Keeps tunnel records in a concurrent map
///
/// Traffic is folded into one running [`TrafficSummary`] per tunnel as it is recorded; the
/// individual records are not retained.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tunnels: Arc<DashMap<String, Tunnel>>,
    traffic: Arc<DashMap<String, TrafficSummary>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// All tunnel records owned by a user, oldest first
    pub fn tunnels_for_user(&self, user_id: &str) -> Vec<Tunnel> {
        let mut tunnels: Vec<Tunnel> = self
            .tunnels
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        tunnels.sort_by_key(|t| t.created_at);
        tunnels
    }
}

#[async_trait]
impl TunnelStore for MemoryStore {
    async fn find_active_tunnel(&self, user_id: &str) -> Result<Option<Tunnel>, StoreError> {
        Ok(self
            .tunnels
            .iter()
            .filter(|entry| entry.user_id == user_id && entry.is_active())
            .max_by_key(|entry| entry.created_at)
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, tunnel: &Tunnel) -> Result<(), StoreError> {
        trace!("Saving tunnel {} ({})", tunnel.id, tunnel.status);
        self.tunnels.insert(tunnel.id.clone(), tunnel.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Tunnel>, StoreError> {
        Ok(self.tunnels.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, StoreError> {
        Ok(self
            .tunnels
            .iter()
            .filter(|entry| entry.subdomain.eq_ignore_ascii_case(subdomain))
            .max_by_key(|entry| (entry.is_active(), entry.created_at))
            .map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl TrafficLog for MemoryStore {
    async fn record(&self, record: &TrafficRecord) -> Result<(), StoreError> {
        let mut summary = self.traffic.entry(record.tunnel_id.clone()).or_default();
        summary.request_count += 1;
        summary.bytes_transferred = summary
            .bytes_transferred
            .saturating_add(record.bytes_received)
            .saturating_add(record.bytes_sent);
        Ok(())
    }

    async fn summarize(&self, tunnel_id: &str) -> Result<TrafficSummary, StoreError> {
        Ok(self
            .traffic
            .get(tunnel_id)
            .map(|summary| *summary)
            .unwrap_or_default())
    }
}
