use std::sync::Arc;

use anyhow::Context;
use entities::reading_progress::{ActiveModel, Column, Entity, Model};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    sea_query::OnConflict,
};
use uuid::Uuid;

use super::ProgressStore;
use crate::domain::{ProgressRecord, UserId};

pub struct SeaOrmProgressStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmProgressStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn to_record(user_id: &UserId, model: Model) -> ProgressRecord {
    ProgressRecord {
        user_id: user_id.clone(),
        book_id: model.book_id,
        chapter_id: model.chapter_id,
        progress: model.progress,
        last_updated_at: model.last_updated_at,
    }
}

#[async_trait::async_trait]
impl ProgressStore for SeaOrmProgressStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_progress(
        &self,
        user_id: &UserId,
        book_id: &str,
    ) -> anyhow::Result<Option<ProgressRecord>> {
        let model = Entity::find()
            .filter(Column::UserId.eq(user_id.as_str()))
            .filter(Column::BookId.eq(book_id))
            .one(self.db.as_ref())
            .await
            .with_context(|| format!("Failed to load progress for book {}", book_id))?;
        Ok(model.map(|m| to_record(user_id, m)))
    }

    #[tracing::instrument(level = "debug", skip(self, record), fields(user_id = %record.user_id, book_id = %record.book_id))]
    async fn save_progress(&self, record: &ProgressRecord) -> anyhow::Result<()> {
        let row = ActiveModel {
            id: Set(Uuid::now_v7()),
            user_id: Set(record.user_id.to_string()),
            book_id: Set(record.book_id.clone()),
            chapter_id: Set(record.chapter_id.clone()),
            progress: Set(record.progress),
            last_updated_at: Set(record.last_updated_at),
        };
        // The row id is only assigned on first insert.
        Entity::insert(row)
            .on_conflict(
                OnConflict::columns([Column::UserId, Column::BookId])
                    .update_columns([Column::ChapterId, Column::Progress, Column::LastUpdatedAt])
                    .to_owned(),
            )
            .exec(self.db.as_ref())
            .await
            .with_context(|| format!("Failed to save progress for book {}", record.book_id))?;
        Ok(())
    }
}
