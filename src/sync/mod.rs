pub mod offline;
pub mod policy;
pub mod status;

pub use offline::MergeReport;
pub use policy::{RecencyPolicy, Resolution};
pub use status::SyncStatusQuery;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    config::SyncConfig,
    domain::{
        DeviceId, ProgressRecord, SyncMessage, UserId, validate_book_id, validate_chapter_id,
        validate_progress,
    },
    error::SyncResult,
    hub::Hub,
    storage::ProgressStore,
};

/// Applies the conflict policy to incoming progress and fans accepted updates out.
pub struct SyncCoordinator {
    store: Arc<dyn ProgressStore>,
    hub: Hub,
    policy: RecencyPolicy,
    broadcast_offline_merge: bool,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn ProgressStore>, hub: Hub, config: &SyncConfig) -> Self {
        Self {
            store,
            hub,
            policy: RecencyPolicy::new(config.recency_window),
            broadcast_offline_merge: config.broadcast_offline_merge,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Resolves one live update against the stored record and persists it if it wins.
    ///
    /// Accepted updates are broadcast to the user's other devices, including the first
    /// update for a book.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sync_progress(
        &self,
        user_id: &str,
        book_id: &str,
        chapter_id: &str,
        device_id: &str,
        progress: f64,
        now: DateTime<Utc>,
    ) -> SyncResult<Resolution> {
        let user_id = UserId::parse(user_id)?;
        let device_id = DeviceId::parse(device_id)?;
        validate_book_id(book_id)?;
        validate_chapter_id(chapter_id)?;
        let progress = validate_progress(progress)?;

        let existing = self.store.get_progress(&user_id, book_id).await?;
        let resolution = self.policy.resolve_live(existing.as_ref(), now);
        if !resolution.is_applied() {
            tracing::debug!(%user_id, %device_id, book_id, "discarding update older than stored progress");
            return Ok(resolution);
        }

        let record = ProgressRecord {
            user_id,
            book_id: book_id.to_string(),
            chapter_id: chapter_id.to_string(),
            progress,
            last_updated_at: now,
        };
        self.store.save_progress(&record).await?;
        tracing::debug!(user_id = %record.user_id, %device_id, book_id, progress, resolution = resolution.as_str(), "progress saved");
        self.fan_out(&record, &device_id);
        Ok(resolution)
    }

    /// Stored progress for a book, if any.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_progress(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> SyncResult<Option<ProgressRecord>> {
        let user_id = UserId::parse(user_id)?;
        validate_book_id(book_id)?;
        Ok(self.store.get_progress(&user_id, book_id).await?)
    }

    fn fan_out(&self, record: &ProgressRecord, origin: &DeviceId) {
        if let Err(e) = self.hub.broadcast(SyncMessage::sync(record, origin)) {
            tracing::warn!(user_id = %record.user_id, book_id = %record.book_id, error = %e, "progress saved but not broadcast");
        }
    }
}
