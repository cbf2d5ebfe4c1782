//! Database migrations

use sea_orm_migration::prelude::*;

mod m20260206_000001_create_tunnels;
mod m20260211_000001_create_tunnel_traffic;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260206_000001_create_tunnels::Migration),
            Box::new(m20260211_000001_create_tunnel_traffic::Migration),
        ]
    }
}
