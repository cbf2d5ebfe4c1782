//! Domain records handled by the stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tunnlr_proto::{TunnelDescriptor, TunnelStatus};

/// A registered mapping from a public hostname to an agent's local service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: String,
    /// Owning user identity, as established by the auth collaborator
    pub user_id: String,
    pub local_port: u16,
    pub protocol: String,
    pub subdomain: String,
    pub public_url: String,
    pub dashboard_url: String,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Tunnel {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn descriptor(&self) -> TunnelDescriptor {
        TunnelDescriptor {
            tunnel_id: self.id.clone(),
            public_url: self.public_url.clone(),
            dashboard_url: self.dashboard_url.clone(),
        }
    }
}

/// One proxied exchange through a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: String,
    pub tunnel_id: String,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub client_ip: Option<String>,
    /// Request body bytes received from the public caller
    pub bytes_received: u64,
    /// Response body bytes sent back to the public caller
    pub bytes_sent: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl TrafficRecord {
    pub fn latency_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

/// Aggregate traffic counters for a tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSummary {
    pub request_count: u64,
    pub bytes_transferred: u64,
}
