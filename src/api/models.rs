use chrono::{DateTime, Utc};
use poem_openapi::{ApiResponse, Object, payload::Json};

use crate::{
    domain::{ProgressRecord, SyncStatus},
    error::SyncError,
    sync::{MergeReport, Resolution},
};

#[derive(Debug, Clone, Object)]
pub struct ErrorDto {
    /// Human-readable error message
    pub message: String,
}

impl From<String> for ErrorDto {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&SyncError> for ErrorDto {
    fn from(err: &SyncError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct ProgressUpdateDto {
    pub book_id: String,
    #[oai(default)]
    pub chapter_id: String,
    /// Fraction of the book read, 0.0 - 1.0
    pub progress: f64,
    pub device_id: String,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct ProgressUpdateResultDto {
    /// Whether the update was persisted
    pub applied: bool,
    /// created, overwritten, concurrent-accepted or concurrent-discarded
    pub resolution: String,
}

impl From<Resolution> for ProgressUpdateResultDto {
    fn from(resolution: Resolution) -> Self {
        Self {
            applied: resolution.is_applied(),
            resolution: resolution.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct OfflineProgressDto {
    pub book_id: String,
    #[oai(default)]
    pub chapter_id: String,
    pub progress: f64,
    /// RFC 3339 capture time on the device
    pub timestamp: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct MergeReportDto {
    /// Books whose offline progress was persisted
    pub applied: Vec<String>,
    /// Books whose offline progress was older than the stored record
    pub discarded: Vec<String>,
}

impl From<MergeReport> for MergeReportDto {
    fn from(report: MergeReport) -> Self {
        Self {
            applied: report.applied,
            discarded: report.discarded,
        }
    }
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct SyncStatusDto {
    pub user_id: String,
    pub connected_devices: Vec<String>,
    pub device_count: u32,
    pub is_syncing: bool,
}

impl From<SyncStatus> for SyncStatusDto {
    fn from(status: SyncStatus) -> Self {
        Self {
            user_id: status.user_id.to_string(),
            connected_devices: status
                .connected_devices
                .iter()
                .map(ToString::to_string)
                .collect(),
            device_count: u32::try_from(status.device_count).unwrap_or(u32::MAX),
            is_syncing: status.is_syncing,
        }
    }
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct ProgressDto {
    pub book_id: String,
    pub chapter_id: String,
    pub progress: f64,
    /// Absent when nothing has been recorded for the book yet
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl ProgressDto {
    pub fn unread(book_id: &str) -> Self {
        Self {
            book_id: book_id.to_string(),
            chapter_id: String::new(),
            progress: 0.0,
            last_updated_at: None,
        }
    }
}

impl From<ProgressRecord> for ProgressDto {
    fn from(record: ProgressRecord) -> Self {
        Self {
            book_id: record.book_id,
            chapter_id: record.chapter_id,
            progress: record.progress,
            last_updated_at: Some(record.last_updated_at),
        }
    }
}

#[derive(ApiResponse)]
pub enum SyncProgressResponse {
    /// Update resolved against the stored progress
    #[oai(status = 200)]
    Ok(Json<ProgressUpdateResultDto>),

    #[oai(status = 400)]
    BadRequest(Json<ErrorDto>),

    #[oai(status = 401)]
    Unauthorized(Json<ErrorDto>),

    #[oai(status = 500)]
    InternalError(Json<ErrorDto>),
}

#[derive(ApiResponse)]
pub enum OfflineMergeResponse {
    /// Batch merged
    #[oai(status = 200)]
    Ok(Json<MergeReportDto>),

    #[oai(status = 400)]
    BadRequest(Json<ErrorDto>),

    #[oai(status = 401)]
    Unauthorized(Json<ErrorDto>),

    #[oai(status = 500)]
    InternalError(Json<ErrorDto>),
}

#[derive(ApiResponse)]
pub enum SyncStatusResponse {
    #[oai(status = 200)]
    Ok(Json<SyncStatusDto>),

    #[oai(status = 400)]
    BadRequest(Json<ErrorDto>),

    #[oai(status = 401)]
    Unauthorized(Json<ErrorDto>),
}

#[derive(ApiResponse)]
pub enum ProgressResponse {
    /// Stored progress, or zero progress if the book was never opened
    #[oai(status = 200)]
    Ok(Json<ProgressDto>),

    #[oai(status = 400)]
    BadRequest(Json<ErrorDto>),

    #[oai(status = 401)]
    Unauthorized(Json<ErrorDto>),

    #[oai(status = 500)]
    InternalError(Json<ErrorDto>),
}
