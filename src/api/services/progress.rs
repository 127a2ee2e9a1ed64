use chrono::{DateTime, Utc};
use poem_openapi::payload::Json;

use crate::{
    api::models::{
        ErrorDto, OfflineMergeResponse, OfflineProgressDto, ProgressDto, ProgressResponse,
        ProgressUpdateDto, SyncProgressResponse, SyncStatusResponse,
    },
    domain::{OfflineProgress, UserId},
    error::{SyncError, SyncResult},
    sync::{SyncCoordinator, SyncStatusQuery},
};

pub struct ProgressService<'a> {
    pub coordinator: &'a SyncCoordinator,
}

fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SyncError::InvalidTimestamp {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

impl<'a> ProgressService<'a> {
    pub fn new(coordinator: &'a SyncCoordinator) -> Self {
        Self { coordinator }
    }

    #[tracing::instrument(level = "debug", skip(self, body), fields(book_id = %body.book_id))]
    pub async fn sync(&self, user_id: &UserId, body: ProgressUpdateDto) -> SyncProgressResponse {
        let result = self
            .coordinator
            .sync_progress(
                user_id.as_str(),
                &body.book_id,
                &body.chapter_id,
                &body.device_id,
                body.progress,
                Utc::now(),
            )
            .await;
        match result {
            Ok(resolution) => SyncProgressResponse::Ok(Json(resolution.into())),
            Err(e) if e.is_client_error() => SyncProgressResponse::BadRequest(Json((&e).into())),
            Err(e) => {
                tracing::error!(%user_id, error = %e, "failed to sync progress");
                SyncProgressResponse::InternalError(Json((&e).into()))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, items), fields(items = items.len()))]
    pub async fn merge_offline(
        &self,
        user_id: &UserId,
        items: Vec<OfflineProgressDto>,
    ) -> OfflineMergeResponse {
        let batch = items
            .into_iter()
            .map(|item| {
                Ok(OfflineProgress {
                    user_id: user_id.to_string(),
                    timestamp: parse_timestamp(&item.timestamp)?,
                    book_id: item.book_id,
                    chapter_id: item.chapter_id,
                    progress: item.progress,
                    device_id: item.device_id,
                })
            })
            .collect::<SyncResult<Vec<_>>>();
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => return OfflineMergeResponse::BadRequest(Json((&e).into())),
        };

        match self
            .coordinator
            .merge_offline_progresses(user_id.as_str(), batch)
            .await
        {
            Ok(report) => OfflineMergeResponse::Ok(Json(report.into())),
            Err(e) if e.is_client_error() => OfflineMergeResponse::BadRequest(Json((&e).into())),
            Err(e) => {
                tracing::error!(%user_id, error = %e, "failed to merge offline progress");
                OfflineMergeResponse::InternalError(Json((&e).into()))
            }
        }
    }

    pub fn status(&self, user_id: &UserId) -> SyncStatusResponse {
        match SyncStatusQuery::new(self.coordinator.hub()).get_sync_status(user_id.as_str()) {
            Ok(status) => SyncStatusResponse::Ok(Json(status.into())),
            Err(e) => SyncStatusResponse::BadRequest(Json((&e).into())),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get(&self, user_id: &UserId, book_id: &str) -> ProgressResponse {
        match self.coordinator.get_progress(user_id.as_str(), book_id).await {
            Ok(Some(record)) => ProgressResponse::Ok(Json(record.into())),
            Ok(None) => ProgressResponse::Ok(Json(ProgressDto::unread(book_id))),
            Err(e) if e.is_client_error() => ProgressResponse::BadRequest(Json((&e).into())),
            Err(e) => {
                tracing::error!(%user_id, book_id, error = %e, "failed to load progress");
                ProgressResponse::InternalError(Json(ErrorDto::from(format!(
                    "failed to load progress: {}",
                    e
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_timestamps_are_normalized_to_utc() {
        let ts = parse_timestamp("2025-05-20T20:30:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-05-20T18:30:00+00:00");
    }

    #[test]
    fn malformed_timestamp_is_a_client_error() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, SyncError::InvalidTimestamp { .. }));
        assert!(err.is_client_error());
    }
}
