// Domain models shared by the hub, the coordinator and the HTTP surface

use std::{borrow::Borrow, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

const MAX_IDENTIFIER_LEN: usize = 64;

fn is_identifier(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_IDENTIFIER_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $error:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> SyncResult<Self> {
                if is_identifier(raw) {
                    Ok(Self(raw.to_string()))
                } else {
                    Err(SyncError::$error(raw.to_string()))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

identifier!(
    /// Authenticated owner of a set of device connections.
    UserId,
    InvalidUserId
);

identifier!(
    /// Logical client instance, independent of the transport session.
    DeviceId,
    InvalidDeviceId
);

pub fn validate_book_id(raw: &str) -> SyncResult<()> {
    if is_identifier(raw) {
        Ok(())
    } else {
        Err(SyncError::InvalidBookId(raw.to_string()))
    }
}

/// An empty chapter id means the client does not know the chapter yet.
pub fn validate_chapter_id(raw: &str) -> SyncResult<()> {
    if raw.is_empty() || is_identifier(raw) {
        Ok(())
    } else {
        Err(SyncError::InvalidChapterId(raw.to_string()))
    }
}

pub fn validate_progress(progress: f64) -> SyncResult<f64> {
    if progress.is_finite() && (0.0..=1.0).contains(&progress) {
        Ok(progress)
    } else {
        Err(SyncError::ProgressOutOfRange(progress))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub user_id: UserId,
    pub book_id: String,
    pub chapter_id: String,
    /// 0.0 - 1.0 fraction
    pub progress: f64,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Sync,
    /// Reserved; never emitted by the server.
    Ack,
    /// Reserved; never emitted by the server.
    Conflict,
}

/// Wire frame exchanged over a device connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub user_id: String,
    pub book_id: String,
    #[serde(default)]
    pub chapter_id: String,
    pub progress: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub device_id: String,
}

impl SyncMessage {
    pub fn sync(record: &ProgressRecord, origin: &DeviceId) -> Self {
        Self {
            kind: MessageKind::Sync,
            user_id: record.user_id.to_string(),
            book_id: record.book_id.clone(),
            chapter_id: record.chapter_id.clone(),
            progress: record.progress,
            timestamp: record.last_updated_at,
            device_id: origin.to_string(),
        }
    }
}

/// Progress captured while a device was disconnected, submitted after reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineProgress {
    pub user_id: String,
    pub book_id: String,
    pub chapter_id: String,
    pub progress: f64,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub user_id: UserId,
    pub connected_devices: Vec<DeviceId>,
    pub device_count: usize,
    pub is_syncing: bool,
}

impl SyncStatus {
    pub fn new(user_id: UserId, connected_devices: Vec<DeviceId>) -> Self {
        let device_count = connected_devices.len();
        Self {
            user_id,
            connected_devices,
            device_count,
            is_syncing: device_count > 1,
        }
    }
}
