//! SeaORM-backed store

use crate::entities::{tunnel, tunnel_traffic};
use crate::model::{TrafficRecord, TrafficSummary, Tunnel};
use crate::store::{StoreError, TrafficLog, TunnelStore};
use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use tracing::debug;
use tunnlr_proto::TunnelStatus;

/// Stores tunnels and traffic in a relational database
#[derive(Clone)]
pub struct DbStore {
    db: DatabaseConnection,
}

impl DbStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect and bring the schema up to date
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let db = crate::connect(database_url).await?;
        crate::migrate(&db).await?;
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn to_domain(model: tunnel::Model) -> Result<Tunnel, StoreError> {
    let status = model
        .status
        .parse::<TunnelStatus>()
        .map_err(|reason| StoreError::Corrupt {
            id: model.id.clone(),
            reason,
        })?;

    let local_port = u16::try_from(model.local_port).map_err(|_| StoreError::Corrupt {
        id: model.id.clone(),
        reason: format!("local port {} out of range", model.local_port),
    })?;

    Ok(Tunnel {
        id: model.id,
        user_id: model.user_id,
        local_port,
        protocol: model.protocol,
        subdomain: model.subdomain,
        public_url: model.public_url,
        dashboard_url: model.dashboard_url,
        status,
        created_at: model.created_at,
        started_at: model.started_at,
        ended_at: model.ended_at,
    })
}

fn to_active_model(tunnel: &Tunnel) -> tunnel::ActiveModel {
    tunnel::ActiveModel {
        id: Set(tunnel.id.clone()),
        user_id: Set(tunnel.user_id.clone()),
        local_port: Set(i32::from(tunnel.local_port)),
        protocol: Set(tunnel.protocol.clone()),
        subdomain: Set(tunnel.subdomain.clone()),
        public_url: Set(tunnel.public_url.clone()),
        dashboard_url: Set(tunnel.dashboard_url.clone()),
        status: Set(tunnel.status.as_str().to_string()),
        created_at: Set(tunnel.created_at),
        started_at: Set(tunnel.started_at),
        ended_at: Set(tunnel.ended_at),
    }
}

#[async_trait]
impl TunnelStore for DbStore {
    async fn find_active_tunnel(&self, user_id: &str) -> Result<Option<Tunnel>, StoreError> {
        tunnel::Entity::find()
            .filter(tunnel::Column::UserId.eq(user_id))
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active.as_str()))
            .order_by_desc(tunnel::Column::CreatedAt)
            .one(&self.db)
            .await?
            .map(to_domain)
            .transpose()
    }

    async fn save(&self, tunnel: &Tunnel) -> Result<(), StoreError> {
        debug!("Persisting tunnel {} ({})", tunnel.id, tunnel.status);

        tunnel::Entity::insert(to_active_model(tunnel))
            .on_conflict(
                OnConflict::column(tunnel::Column::Id)
                    .update_columns([
                        tunnel::Column::UserId,
                        tunnel::Column::LocalPort,
                        tunnel::Column::Protocol,
                        tunnel::Column::Subdomain,
                        tunnel::Column::PublicUrl,
                        tunnel::Column::DashboardUrl,
                        tunnel::Column::Status,
                        tunnel::Column::StartedAt,
                        tunnel::Column::EndedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Tunnel>, StoreError> {
        tunnel::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .map(to_domain)
            .transpose()
    }

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, StoreError> {
        // Subdomains are generated lower-case
        let models = tunnel::Entity::find()
            .filter(tunnel::Column::Subdomain.eq(subdomain.to_ascii_lowercase()))
            .order_by_desc(tunnel::Column::CreatedAt)
            .all(&self.db)
            .await?;

        let mut tunnels = models
            .into_iter()
            .map(to_domain)
            .collect::<Result<Vec<_>, _>>()?;

        // Prefer the live record if the subdomain was ever reissued
        let active = tunnels.iter().position(Tunnel::is_active).unwrap_or(0);
        Ok(if tunnels.is_empty() {
            None
        } else {
            Some(tunnels.swap_remove(active))
        })
    }
}

#[async_trait]
impl TrafficLog for DbStore {
    async fn record(&self, record: &TrafficRecord) -> Result<(), StoreError> {
        let model = tunnel_traffic::ActiveModel {
            id: Set(record.id.clone()),
            tunnel_id: Set(record.tunnel_id.clone()),
            request_id: Set(record.request_id.clone()),
            method: Set(record.method.clone()),
            path: Set(record.path.clone()),
            status_code: Set(i32::from(record.status_code)),
            client_ip: Set(record.client_ip.clone()),
            bytes_received: Set(i64::try_from(record.bytes_received).unwrap_or(i64::MAX)),
            bytes_sent: Set(i64::try_from(record.bytes_sent).unwrap_or(i64::MAX)),
            connected_at: Set(record.started_at),
            disconnected_at: Set(record.completed_at),
            latency_ms: Set(record.latency_ms()),
        };

        tunnel_traffic::Entity::insert(model).exec(&self.db).await?;
        Ok(())
    }

    async fn summarize(&self, tunnel_id: &str) -> Result<TrafficSummary, StoreError> {
        let row: Option<(i64, i64)> = tunnel_traffic::Entity::find()
            .select_only()
            .column_as(Expr::cust("COUNT(*)"), "request_count")
            .column_as(
                Expr::cust("CAST(COALESCE(SUM(bytes_received + bytes_sent), 0) AS BIGINT)"),
                "bytes_transferred",
            )
            .filter(tunnel_traffic::Column::TunnelId.eq(tunnel_id))
            .into_tuple()
            .one(&self.db)
            .await?;

        let (request_count, bytes_transferred) = row.unwrap_or((0, 0));
        Ok(TrafficSummary {
            request_count: u64::try_from(request_count).unwrap_or(0),
            bytes_transferred: u64::try_from(bytes_transferred).unwrap_or(0),
        })
    }
}
