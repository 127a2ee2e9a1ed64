use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ReadingProgress::Table)
                    .if_not_exists()
                    .col(uuid(ReadingProgress::Id).primary_key())
                    .col(string(ReadingProgress::UserId))
                    .col(string(ReadingProgress::BookId))
                    .col(string(ReadingProgress::ChapterId))
                    .col(double(ReadingProgress::Progress))
                    .col(timestamp_with_time_zone(ReadingProgress::LastUpdatedAt))
                    .to_owned(),
            )
            .await?;

        // Saves upsert on this pair.
        manager
            .create_index(
                Index::create()
                    .name("idx_reading_progress_user_book")
                    .table(ReadingProgress::Table)
                    .col(ReadingProgress::UserId)
                    .col(ReadingProgress::BookId)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ReadingProgress::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum ReadingProgress {
    Table,
    Id,
    UserId,
    BookId,
    ChapterId,
    Progress,
    LastUpdatedAt,
}
