use chrono::Utc;
use poem_openapi::{
    OpenApi, SecurityScheme,
    auth::Bearer,
    param::Path,
    payload::{Json, PlainText},
};

use super::{
    AppState,
    models::{
        ErrorDto, OfflineMergeResponse, OfflineProgressDto, ProgressResponse, ProgressUpdateDto,
        SyncProgressResponse, SyncStatusResponse,
    },
    services::{health::HealthService, progress::ProgressService},
};
use crate::domain::UserId;

/// Token issued by the account service.
#[derive(SecurityScheme)]
#[oai(ty = "bearer")]
pub struct BearerAuth(Bearer);

pub struct ProgressSyncApi {
    pub state: AppState,
}

impl ProgressSyncApi {
    fn authenticate(&self, auth: &BearerAuth) -> Result<UserId, ErrorDto> {
        self.state
            .tokens
            .verify(&auth.0.token, Utc::now())
            .map_err(|e| {
                tracing::debug!(error = %e, "rejecting bearer token");
                ErrorDto::from(e.to_string())
            })
    }
}

#[OpenApi]
impl ProgressSyncApi {
    /// Liveness probe
    #[oai(path = "/health", method = "get")]
    async fn health(&self) -> PlainText<String> {
        HealthService::new(self.state.coordinator.hub()).status_text()
    }

    /// Submit the current reading position from a device
    #[oai(path = "/api/v1/progress/sync", method = "post")]
    #[tracing::instrument(level = "debug", skip(self, auth, body))]
    async fn sync_progress(
        &self,
        auth: BearerAuth,
        body: Json<ProgressUpdateDto>,
    ) -> SyncProgressResponse {
        let user_id = match self.authenticate(&auth) {
            Ok(user_id) => user_id,
            Err(e) => return SyncProgressResponse::Unauthorized(Json(e)),
        };
        ProgressService::new(&self.state.coordinator)
            .sync(&user_id, body.0)
            .await
    }

    /// Merge progress recorded while the device was offline
    #[oai(path = "/api/v1/progress/offline", method = "post")]
    #[tracing::instrument(level = "debug", skip(self, auth, body))]
    async fn merge_offline(
        &self,
        auth: BearerAuth,
        body: Json<Vec<OfflineProgressDto>>,
    ) -> OfflineMergeResponse {
        let user_id = match self.authenticate(&auth) {
            Ok(user_id) => user_id,
            Err(e) => return OfflineMergeResponse::Unauthorized(Json(e)),
        };
        ProgressService::new(&self.state.coordinator)
            .merge_offline(&user_id, body.0)
            .await
    }

    /// Devices of the caller that currently hold a live connection
    #[oai(path = "/api/v1/progress/sync-status", method = "get")]
    #[tracing::instrument(level = "debug", skip(self, auth))]
    async fn sync_status(&self, auth: BearerAuth) -> SyncStatusResponse {
        match self.authenticate(&auth) {
            Ok(user_id) => ProgressService::new(&self.state.coordinator).status(&user_id),
            Err(e) => SyncStatusResponse::Unauthorized(Json(e)),
        }
    }

    /// Stored progress for one book
    #[oai(path = "/api/v1/progress/books/:book_id", method = "get")]
    #[tracing::instrument(level = "debug", skip(self, auth, book_id))]
    async fn get_progress(&self, auth: BearerAuth, book_id: Path<String>) -> ProgressResponse {
        let user_id = match self.authenticate(&auth) {
            Ok(user_id) => user_id,
            Err(e) => return ProgressResponse::Unauthorized(Json(e)),
        };
        ProgressService::new(&self.state.coordinator)
            .get(&user_id, &book_id.0)
            .await
    }
}
