use crate::{
    domain::{SyncStatus, UserId},
    error::SyncResult,
    hub::Hub,
};

/// Read-only view of the hub for client status checks.
pub struct SyncStatusQuery<'a> {
    hub: &'a Hub,
}

impl<'a> SyncStatusQuery<'a> {
    pub fn new(hub: &'a Hub) -> Self {
        Self { hub }
    }

    pub fn get_sync_status(&self, user_id: &str) -> SyncResult<SyncStatus> {
        let user_id = UserId::parse(user_id)?;
        let devices = self.hub.connected_devices(&user_id);
        Ok(SyncStatus::new(user_id, devices))
    }
}
