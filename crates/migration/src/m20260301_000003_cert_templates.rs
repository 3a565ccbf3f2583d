use sea_orm_migration::prelude::*;

use crate::m20260301_000002_events_and_participants::Events;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CertTemplates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CertTemplates::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CertTemplates::EventId).integer().not_null())
                    .col(ColumnDef::new(CertTemplates::TemplatePath).string().not_null())
                    .col(ColumnDef::new(CertTemplates::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(CertTemplates::UpdatedAt).big_integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_cert_templates_event_id")
                            .from(CertTemplates::Table, CertTemplates::EventId)
                            .to(Events::Table, Events::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One template per event; upserts conflict on this index.
        manager
            .create_index(
                Index::create()
                    .name("idx_cert_templates_event_id")
                    .table(CertTemplates::Table)
                    .col(CertTemplates::EventId)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let _ = manager
            .drop_index(Index::drop().name("idx_cert_templates_event_id").to_owned())
            .await;

        manager
            .drop_table(Table::drop().table(CertTemplates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CertTemplates {
    Table,
    Id,
    EventId,
    TemplatePath,
    CreatedAt,
    UpdatedAt,
}
