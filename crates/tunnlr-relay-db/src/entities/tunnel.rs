//! Tunnel entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub user_id: String,

    pub local_port: i32,
    pub protocol: String,

    pub subdomain: String,

    pub public_url: String,
    pub dashboard_url: String,

    /// "Active" | "Inactive" | "Deactivated"
    pub status: String,

    pub created_at: ChronoDateTimeUtc,
    pub started_at: Option<ChronoDateTimeUtc>,
    pub ended_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tunnel_traffic::Entity")]
    Traffic,
}

impl Related<super::tunnel_traffic::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Traffic.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
