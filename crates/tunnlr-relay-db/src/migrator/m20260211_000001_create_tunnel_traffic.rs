use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TunnelTraffic::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TunnelTraffic::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TunnelTraffic::TunnelId).string().not_null())
                    .col(ColumnDef::new(TunnelTraffic::RequestId).string().not_null())
                    .col(ColumnDef::new(TunnelTraffic::Method).string().not_null())
                    .col(ColumnDef::new(TunnelTraffic::Path).text().not_null())
                    .col(ColumnDef::new(TunnelTraffic::StatusCode).integer().not_null())
                    .col(ColumnDef::new(TunnelTraffic::ClientIp).string().null())
                    .col(
                        ColumnDef::new(TunnelTraffic::BytesReceived)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TunnelTraffic::BytesSent)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TunnelTraffic::ConnectedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TunnelTraffic::DisconnectedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TunnelTraffic::LatencyMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnel_traffic_tunnel_id")
                    .table(TunnelTraffic::Table)
                    .col(TunnelTraffic::TunnelId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TunnelTraffic::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TunnelTraffic {
    Table,
    Id,
    TunnelId,
    RequestId,
    Method,
    Path,
    StatusCode,
    ClientIp,
    BytesReceived,
    BytesSent,
    ConnectedAt,
    DisconnectedAt,
    LatencyMs,
}
