use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tunnels::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tunnels::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Tunnels::UserId).string().not_null())
                    .col(ColumnDef::new(Tunnels::LocalPort).integer().not_null())
                    .col(ColumnDef::new(Tunnels::Protocol).string().not_null())
                    .col(ColumnDef::new(Tunnels::Subdomain).string().not_null())
                    .col(ColumnDef::new(Tunnels::PublicUrl).string().not_null())
                    .col(ColumnDef::new(Tunnels::DashboardUrl).string().not_null())
                    .col(
                        ColumnDef::new(Tunnels::Status)
                            .string_len(16)
                            .not_null()
                            .default("Active"),
                    )
                    .col(
                        ColumnDef::new(Tunnels::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Tunnels::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Tunnels::EndedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Active-tunnel lookup by owner
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_user_id_status")
                    .table(Tunnels::Table)
                    .col(Tunnels::UserId)
                    .col(Tunnels::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_subdomain")
                    .table(Tunnels::Table)
                    .col(Tunnels::Subdomain)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tunnels::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tunnels {
    Table,
    Id,
    UserId,
    LocalPort,
    Protocol,
    Subdomain,
    PublicUrl,
    DashboardUrl,
    Status,
    CreatedAt,
    StartedAt,
    EndedAt,
}
