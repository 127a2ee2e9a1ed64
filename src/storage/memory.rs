use std::collections::HashMap;

use parking_lot::RwLock;

use super::ProgressStore;
use crate::domain::{ProgressRecord, UserId};

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: RwLock<HashMap<(UserId, String), ProgressRecord>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get_progress(
        &self,
        user_id: &UserId,
        book_id: &str,
    ) -> anyhow::Result<Option<ProgressRecord>> {
        let key = (user_id.clone(), book_id.to_string());
        Ok(self.records.read().get(&key).cloned())
    }

    async fn save_progress(&self, record: &ProgressRecord) -> anyhow::Result<()> {
        let key = (record.user_id.clone(), record.book_id.clone());
        self.records.write().insert(key, record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn save_overwrites_per_user_and_book() {
        let store = MemoryProgressStore::new();
        let user = UserId::parse("u1").unwrap();
        let mut record = ProgressRecord {
            user_id: user.clone(),
            book_id: "b1".into(),
            chapter_id: "c1".into(),
            progress: 0.1,
            last_updated_at: Utc::now(),
        };
        store.save_progress(&record).await.unwrap();
        record.progress = 0.9;
        store.save_progress(&record).await.unwrap();

        let stored = store.get_progress(&user, "b1").await.unwrap().unwrap();
        assert_eq!(stored.progress, 0.9);
        assert!(store.get_progress(&user, "b2").await.unwrap().is_none());
    }
}
