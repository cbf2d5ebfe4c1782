//! TunnelTraffic entity, one row per proxied exchange

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel_traffic")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub tunnel_id: String,
    pub request_id: String,
    pub method: String,

    #[sea_orm(column_type = "Text")]
    pub path: String,

    pub status_code: i32,
    pub client_ip: Option<String>,
    pub bytes_received: i64,
    pub bytes_sent: i64,
    pub connected_at: ChronoDateTimeUtc,
    pub disconnected_at: ChronoDateTimeUtc,
    pub latency_ms: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id"
    )]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
