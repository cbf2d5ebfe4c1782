//! Storage traits consumed by the relay engine

use crate::model::{TrafficRecord, TrafficSummary, Tunnel};
use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur in store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Tunnel record persistence
#[async_trait]
pub trait TunnelStore: Send + Sync {
    /// The owner's `Active` tunnel, if any
    async fn find_active_tunnel(&self, user_id: &str) -> Result<Option<Tunnel>, StoreError>;

    /// Insert or update a tunnel record (keyed by id)
    async fn save(&self, tunnel: &Tunnel) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Tunnel>, StoreError>;

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, StoreError>;
}

/// Traffic record persistence and aggregation
#[async_trait]
pub trait TrafficLog: Send + Sync {
    async fn record(&self, record: &TrafficRecord) -> Result<(), StoreError>;

    async fn summarize(&self, tunnel_id: &str) -> Result<TrafficSummary, StoreError>;
}
