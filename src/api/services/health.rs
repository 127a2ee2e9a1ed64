use poem_openapi::payload::PlainText;

use crate::hub::Hub;

pub struct HealthService<'a> {
    pub hub: &'a Hub,
}

impl<'a> HealthService<'a> {
    pub fn new(hub: &'a Hub) -> Self {
        Self { hub }
    }

    pub fn status_text(&self) -> PlainText<String> {
        PlainText(format!(
            "{} version={} connected_users={}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.hub.connected_users()
        ))
    }
}
