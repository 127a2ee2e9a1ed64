// Persistence seam for progress records; the sync core never talks to a database directly

mod memory;
mod sea_orm_store;

pub use memory::MemoryProgressStore;
pub use sea_orm_store::SeaOrmProgressStore;

use crate::domain::{ProgressRecord, UserId};

/// Stores one progress record per `(user, book)`.
///
/// Implementations must make `save_progress` atomic per key (upsert semantics).
#[async_trait::async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_progress(
        &self,
        user_id: &UserId,
        book_id: &str,
    ) -> anyhow::Result<Option<ProgressRecord>>;

    async fn save_progress(&self, record: &ProgressRecord) -> anyhow::Result<()>;
}
