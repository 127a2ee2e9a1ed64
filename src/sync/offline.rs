use std::collections::BTreeMap;

use super::{RecencyPolicy, SyncCoordinator};
use crate::{
    domain::{
        DeviceId, OfflineProgress, ProgressRecord, UserId, validate_book_id, validate_chapter_id,
        validate_progress,
    },
    error::{SyncError, SyncResult},
};

/// Books whose offline progress was persisted or dropped by a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: Vec<String>,
    pub discarded: Vec<String>,
}

/// Latest item per book. On equal timestamps the item submitted later wins.
fn latest_per_book(batch: Vec<OfflineProgress>) -> BTreeMap<String, OfflineProgress> {
    let mut latest: BTreeMap<String, OfflineProgress> = BTreeMap::new();
    for item in batch {
        match latest.get(&item.book_id) {
            Some(current) if current.timestamp > item.timestamp => {}
            _ => {
                latest.insert(item.book_id.clone(), item);
            }
        }
    }
    latest
}

impl SyncCoordinator {
    /// Merges progress recorded while a device was offline.
    ///
    /// The whole batch is validated before anything is written. Each book keeps only its
    /// newest item, which is persisted when no record exists or when it is strictly newer
    /// than the stored one.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(items = batch.len()))]
    pub async fn merge_offline_progresses(
        &self,
        user_id: &str,
        batch: Vec<OfflineProgress>,
    ) -> SyncResult<MergeReport> {
        let user_id = UserId::parse(user_id)?;
        for item in &batch {
            if item.user_id != user_id.as_str() {
                return Err(SyncError::InvalidUserId(item.user_id.clone()));
            }
            DeviceId::parse(&item.device_id)?;
            validate_book_id(&item.book_id)?;
            validate_chapter_id(&item.chapter_id)?;
            validate_progress(item.progress)?;
        }

        let mut report = MergeReport::default();
        for (book_id, item) in latest_per_book(batch) {
            let existing = self.store.get_progress(&user_id, &book_id).await?;
            let resolution = RecencyPolicy::resolve_offline(existing.as_ref(), item.timestamp);
            if !resolution.is_applied() {
                tracing::debug!(%user_id, %book_id, "offline progress older than stored record");
                report.discarded.push(book_id);
                continue;
            }

            let record = ProgressRecord {
                user_id: user_id.clone(),
                book_id: book_id.clone(),
                chapter_id: item.chapter_id,
                progress: item.progress,
                last_updated_at: item.timestamp,
            };
            self.store.save_progress(&record).await?;
            if self.broadcast_offline_merge {
                let origin = DeviceId::parse(&item.device_id)?;
                self.fan_out(&record, &origin);
            }
            report.applied.push(book_id);
        }

        tracing::info!(%user_id, applied = report.applied.len(), discarded = report.discarded.len(), "merged offline progress");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeDelta, Utc};
    use tokio::{sync::mpsc::error::TryRecvError, time::timeout};

    use super::*;
    use crate::{
        config::SyncConfig,
        storage::ProgressStore,
        sync::tests::{now, setup, user},
    };

    fn item(book: &str, progress: f64, at: DateTime<Utc>) -> OfflineProgress {
        OfflineProgress {
            user_id: "u1".into(),
            book_id: book.into(),
            chapter_id: "ch1".into(),
            progress,
            timestamp: at,
            device_id: "kindle".into(),
        }
    }

    #[tokio::test]
    async fn newest_item_per_book_wins() {
        let (store, coordinator) = setup(SyncConfig::default());
        let t1 = now() - TimeDelta::minutes(30);
        let t2 = now() - TimeDelta::minutes(10);

        let report = coordinator
            .merge_offline_progresses("u1", vec![item("B", 0.3, t1), item("B", 0.7, t2)])
            .await
            .unwrap();

        assert_eq!(report.applied, vec!["B".to_string()]);
        let stored = store.get_progress(&user(), "B").await.unwrap().unwrap();
        assert_eq!(stored.progress, 0.7);
        assert_eq!(stored.last_updated_at, t2);
    }

    #[tokio::test]
    async fn order_in_batch_does_not_matter() {
        let (store, coordinator) = setup(SyncConfig::default());
        let t1 = now() - TimeDelta::minutes(30);
        let t2 = now() - TimeDelta::minutes(10);

        coordinator
            .merge_offline_progresses("u1", vec![item("B", 0.7, t2), item("B", 0.3, t1)])
            .await
            .unwrap();

        let stored = store.get_progress(&user(), "B").await.unwrap().unwrap();
        assert_eq!(stored.progress, 0.7);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_later_submission() {
        let (store, coordinator) = setup(SyncConfig::default());
        coordinator
            .merge_offline_progresses("u1", vec![item("B", 0.3, now()), item("B", 0.35, now())])
            .await
            .unwrap();

        let stored = store.get_progress(&user(), "B").await.unwrap().unwrap();
        assert_eq!(stored.progress, 0.35);
    }

    #[tokio::test]
    async fn items_not_newer_than_stored_are_discarded() {
        let (store, coordinator) = setup(SyncConfig::default());
        coordinator
            .sync_progress("u1", "B", "ch5", "phone", 0.9, now())
            .await
            .unwrap();

        let report = coordinator
            .merge_offline_progresses(
                "u1",
                vec![
                    item("B", 0.2, now()),
                    item("C", 0.4, now() - TimeDelta::days(1)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.applied, vec!["C".to_string()]);
        assert_eq!(report.discarded, vec!["B".to_string()]);
        let stored = store.get_progress(&user(), "B").await.unwrap().unwrap();
        assert_eq!(stored.progress, 0.9);
        assert_eq!(stored.chapter_id, "ch5");
    }

    #[tokio::test]
    async fn invalid_item_rejects_whole_batch() {
        let (store, coordinator) = setup(SyncConfig::default());
        let err = coordinator
            .merge_offline_progresses(
                "u1",
                vec![item("A", 0.5, now()), item("B", 1.2, now())],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::ProgressOutOfRange(_)));
        assert!(store.get_progress(&user(), "A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn item_for_another_user_is_rejected() {
        let (_store, coordinator) = setup(SyncConfig::default());
        let mut foreign = item("A", 0.5, now());
        foreign.user_id = "u2".into();

        let err = coordinator
            .merge_offline_progresses("u1", vec![foreign])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidUserId(_)));
    }

    #[tokio::test]
    async fn merge_does_not_broadcast_by_default() {
        let (_store, coordinator) = setup(SyncConfig::default());
        let hub = coordinator.hub().clone();
        let mut tablet = hub
            .register(user(), DeviceId::parse("tablet").unwrap())
            .await
            .unwrap();

        coordinator
            .merge_offline_progresses("u1", vec![item("A", 0.5, now())])
            .await
            .unwrap();
        let _barrier = hub
            .register(user(), DeviceId::parse("web").unwrap())
            .await
            .unwrap();

        assert!(matches!(tablet.outbound.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn merge_broadcasts_when_enabled() {
        let (_store, coordinator) = setup(SyncConfig {
            broadcast_offline_merge: true,
            ..SyncConfig::default()
        });
        let mut tablet = coordinator
            .hub()
            .register(user(), DeviceId::parse("tablet").unwrap())
            .await
            .unwrap();

        coordinator
            .merge_offline_progresses("u1", vec![item("A", 0.5, now())])
            .await
            .unwrap();

        let delivered = timeout(Duration::from_secs(2), tablet.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.book_id, "A");
        assert_eq!(delivered.device_id, "kindle");
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let (_store, coordinator) = setup(SyncConfig::default());
        let report = coordinator.merge_offline_progresses("u1", vec![]).await.unwrap();
        assert_eq!(report, MergeReport::default());
    }
}
