//! Registry of live device connections.
//!
//! The [`Hub`] is a handle to a single task that owns every mutation of the connection map.
//! Register, unregister and broadcast are sent to that task as commands and processed in
//! order. Status queries take a read lock on the map and never go through the loop.

mod connection;

pub use connection::{Connection, ConnectionState, serve};

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};

use crate::{
    config::{SlowConsumerPolicy, SyncConfig},
    domain::{DeviceId, SyncMessage, UserId},
    error::{SyncError, SyncResult},
};

pub type ConnectionId = u64;

/// Identity of one registration. A reconnecting device gets a new `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub device_id: DeviceId,
}

/// A processed registration: the handle plus the receiving end of the outbound queue.
#[derive(Debug)]
pub struct Registration {
    pub handle: ConnectionHandle,
    pub outbound: mpsc::Receiver<SyncMessage>,
}

struct Slot {
    id: ConnectionId,
    outbound: mpsc::Sender<SyncMessage>,
}

type ConnectionMap = HashMap<UserId, HashMap<DeviceId, Slot>>;

enum Command {
    Register {
        user_id: UserId,
        device_id: DeviceId,
        reply: oneshot::Sender<Registration>,
    },
    Unregister(ConnectionHandle),
    Broadcast(SyncMessage),
}

#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    connections: Arc<RwLock<ConnectionMap>>,
}

impl Hub {
    /// Starts the control loop. It stops once every `Hub` clone has been dropped.
    pub fn spawn(config: &SyncConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let connections = Arc::new(RwLock::new(HashMap::new()));
        let control = ControlLoop {
            connections: connections.clone(),
            next_id: 1,
            queue_capacity: config.queue_capacity.max(1),
            slow_consumer_policy: config.slow_consumer_policy,
        };
        tokio::spawn(control.run(rx));
        Self {
            commands,
            connections,
        }
    }

    /// Installs a connection for `(user_id, device_id)`, closing any previous one for the pair.
    ///
    /// Resolves once the loop has processed the command.
    pub async fn register(&self, user_id: UserId, device_id: DeviceId) -> SyncResult<Registration> {
        let (reply, registered) = oneshot::channel();
        self.commands
            .send(Command::Register {
                user_id,
                device_id,
                reply,
            })
            .map_err(|_| SyncError::HubClosed)?;
        registered.await.map_err(|_| SyncError::HubClosed)
    }

    /// Removes the connection if it is still the registered one for its device.
    pub fn unregister(&self, handle: &ConnectionHandle) {
        if self
            .commands
            .send(Command::Unregister(handle.clone()))
            .is_err()
        {
            tracing::debug!(connection_id = handle.id, "hub stopped before unregister");
        }
    }

    /// Fans `message` out to every connection of its user except the originating device.
    pub fn broadcast(&self, message: SyncMessage) -> SyncResult<()> {
        self.commands
            .send(Command::Broadcast(message))
            .map_err(|_| SyncError::HubClosed)
    }

    /// Snapshot of the devices currently connected for `user_id`, sorted.
    pub fn connected_devices(&self, user_id: &UserId) -> Vec<DeviceId> {
        let map = self.connections.read();
        let mut devices: Vec<DeviceId> = map
            .get(user_id)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default();
        devices.sort();
        devices
    }

    pub fn connected_users(&self) -> usize {
        self.connections.read().len()
    }
}

struct ControlLoop {
    connections: Arc<RwLock<ConnectionMap>>,
    next_id: ConnectionId,
    queue_capacity: usize,
    slow_consumer_policy: SlowConsumerPolicy,
}

impl ControlLoop {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!("hub loop started");
        while let Some(command) = commands.recv().await {
            match command {
                Command::Register {
                    user_id,
                    device_id,
                    reply,
                } => self.register(user_id, device_id, reply),
                Command::Unregister(handle) => {
                    if self.remove(handle.user_id.as_str(), handle.device_id.as_str(), handle.id) {
                        tracing::debug!(user_id = %handle.user_id, device_id = %handle.device_id, connection_id = handle.id, "connection unregistered");
                    }
                }
                Command::Broadcast(message) => self.broadcast(message),
            }
        }
        tracing::debug!("hub loop stopped");
    }

    fn register(&mut self, user_id: UserId, device_id: DeviceId, reply: oneshot::Sender<Registration>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let replaced = self
            .connections
            .write()
            .entry(user_id.clone())
            .or_default()
            .insert(device_id.clone(), Slot { id, outbound: tx });
        // Dropping the old sender closes its queue; its outbound pump then closes the socket.
        if let Some(previous) = replaced {
            tracing::info!(%user_id, %device_id, previous = previous.id, connection_id = id, "device reconnected, closing previous connection");
        }

        let handle = ConnectionHandle {
            id,
            user_id,
            device_id,
        };
        let registration = Registration {
            handle: handle.clone(),
            outbound: rx,
        };
        if reply.send(registration).is_err() {
            self.remove(handle.user_id.as_str(), handle.device_id.as_str(), id);
        }
    }

    /// Returns true if the slot was present with a matching id.
    fn remove(&mut self, user_id: &str, device_id: &str, id: ConnectionId) -> bool {
        let mut map = self.connections.write();
        let Some(devices) = map.get_mut(user_id) else {
            return false;
        };
        let current = devices.get(device_id).is_some_and(|slot| slot.id == id);
        let removed = current && devices.remove(device_id).is_some();
        if devices.is_empty() {
            map.remove(user_id);
        }
        removed
    }

    fn broadcast(&mut self, message: SyncMessage) {
        let mut evicted = Vec::new();
        {
            let map = self.connections.read();
            let Some(devices) = map.get(message.user_id.as_str()) else {
                return;
            };
            for (device_id, slot) in devices {
                if device_id.as_str() == message.device_id {
                    continue;
                }
                match slot.outbound.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => match self.slow_consumer_policy {
                        SlowConsumerPolicy::Evict => {
                            tracing::warn!(user_id = %message.user_id, %device_id, connection_id = slot.id, "outbound queue full, evicting slow consumer");
                            evicted.push((device_id.clone(), slot.id));
                        }
                        SlowConsumerPolicy::DropMessage => {
                            tracing::warn!(user_id = %message.user_id, %device_id, connection_id = slot.id, "outbound queue full, dropping message");
                        }
                    },
                    Err(TrySendError::Closed(_)) => {
                        evicted.push((device_id.clone(), slot.id));
                    }
                }
            }
        }
        for (device_id, id) in evicted {
            self.remove(&message.user_id, device_id.as_str(), id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use tokio::{sync::mpsc::error::TryRecvError, time::timeout};

    use super::*;
    use crate::domain::MessageKind;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn device(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    fn message(user_id: &str, origin: &str, progress: f64) -> SyncMessage {
        SyncMessage {
            kind: MessageKind::Sync,
            user_id: user_id.into(),
            book_id: "book1".into(),
            chapter_id: "ch1".into(),
            progress,
            timestamp: Utc::now(),
            device_id: origin.into(),
        }
    }

    async fn recv(queue: &mut mpsc::Receiver<SyncMessage>) -> Option<SyncMessage> {
        timeout(Duration::from_secs(2), queue.recv())
            .await
            .expect("queue did not resolve in time")
    }

    #[tokio::test]
    async fn register_tracks_devices_per_user() {
        let hub = Hub::spawn(&SyncConfig::default());
        let _phone = hub.register(user("u1"), device("phone")).await.unwrap();
        let _web = hub.register(user("u1"), device("web")).await.unwrap();
        let _other = hub.register(user("u2"), device("phone")).await.unwrap();

        assert_eq!(
            hub.connected_devices(&user("u1")),
            vec![device("phone"), device("web")]
        );
        assert_eq!(hub.connected_devices(&user("u2")), vec![device("phone")]);
        assert_eq!(hub.connected_users(), 2);
    }

    #[tokio::test]
    async fn second_registration_closes_the_first_queue() {
        let hub = Hub::spawn(&SyncConfig::default());
        let mut first = hub.register(user("u1"), device("phone")).await.unwrap();
        let second = hub.register(user("u1"), device("phone")).await.unwrap();

        assert_ne!(first.handle.id, second.handle.id);
        assert!(recv(&mut first.outbound).await.is_none());
        assert_eq!(hub.connected_devices(&user("u1")), vec![device("phone")]);
    }

    #[tokio::test]
    async fn unregister_of_replaced_connection_keeps_successor() {
        let hub = Hub::spawn(&SyncConfig::default());
        let first = hub.register(user("u1"), device("phone")).await.unwrap();
        let mut second = hub.register(user("u1"), device("phone")).await.unwrap();

        hub.unregister(&first.handle);
        hub.broadcast(message("u1", "web", 0.5)).unwrap();

        assert_eq!(recv(&mut second.outbound).await.unwrap().progress, 0.5);
        assert_eq!(hub.connected_devices(&user("u1")), vec![device("phone")]);
    }

    #[tokio::test]
    async fn unregister_drops_empty_user_entry() {
        let hub = Hub::spawn(&SyncConfig::default());
        let mut phone = hub.register(user("u1"), device("phone")).await.unwrap();
        hub.unregister(&phone.handle);

        assert!(recv(&mut phone.outbound).await.is_none());
        assert!(hub.connected_devices(&user("u1")).is_empty());
        assert_eq!(hub.connected_users(), 0);
    }

    #[tokio::test]
    async fn broadcast_skips_the_origin_device() {
        let hub = Hub::spawn(&SyncConfig::default());
        let mut phone = hub.register(user("u1"), device("phone")).await.unwrap();
        let mut tablet = hub.register(user("u1"), device("tablet")).await.unwrap();
        let mut web = hub.register(user("u1"), device("web")).await.unwrap();
        let mut stranger = hub.register(user("u2"), device("tablet")).await.unwrap();

        hub.broadcast(message("u1", "phone", 0.4)).unwrap();

        assert_eq!(recv(&mut tablet.outbound).await.unwrap().progress, 0.4);
        assert_eq!(recv(&mut web.outbound).await.unwrap().progress, 0.4);
        assert!(matches!(phone.outbound.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(
            stranger.outbound.try_recv(),
            Err(TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn broadcast_preserves_order_per_target() {
        let hub = Hub::spawn(&SyncConfig::default());
        let mut tablet = hub.register(user("u1"), device("tablet")).await.unwrap();
        for step in 1..=5 {
            hub.broadcast(message("u1", "phone", f64::from(step) / 10.0))
                .unwrap();
        }
        for step in 1..=5 {
            assert_eq!(
                recv(&mut tablet.outbound).await.unwrap().progress,
                f64::from(step) / 10.0
            );
        }
    }

    #[tokio::test]
    async fn full_queue_evicts_slow_consumer() {
        let config = SyncConfig {
            queue_capacity: 2,
            ..SyncConfig::default()
        };
        let hub = Hub::spawn(&config);
        let mut slow = hub.register(user("u1"), device("slow")).await.unwrap();
        let mut fast = hub.register(user("u1"), device("fast")).await.unwrap();

        for step in 1..=3 {
            hub.broadcast(message("u1", "phone", f64::from(step) / 10.0))
                .unwrap();
            // Keep the healthy device drained.
            assert!(recv(&mut fast.outbound).await.is_some());
        }

        assert_eq!(recv(&mut slow.outbound).await.unwrap().progress, 0.1);
        assert_eq!(recv(&mut slow.outbound).await.unwrap().progress, 0.2);
        assert!(recv(&mut slow.outbound).await.is_none());
        assert_eq!(hub.connected_devices(&user("u1")), vec![device("fast")]);
    }

    #[tokio::test]
    async fn drop_message_policy_keeps_slow_consumer() {
        let config = SyncConfig {
            queue_capacity: 1,
            slow_consumer_policy: SlowConsumerPolicy::DropMessage,
            ..SyncConfig::default()
        };
        let hub = Hub::spawn(&config);
        let mut slow = hub.register(user("u1"), device("slow")).await.unwrap();

        hub.broadcast(message("u1", "phone", 0.1)).unwrap();
        hub.broadcast(message("u1", "phone", 0.2)).unwrap();
        hub.broadcast(message("u1", "phone", 0.3)).unwrap();
        let _barrier = hub.register(user("u2"), device("web")).await.unwrap();

        assert_eq!(recv(&mut slow.outbound).await.unwrap().progress, 0.1);
        hub.broadcast(message("u1", "phone", 0.4)).unwrap();
        assert_eq!(recv(&mut slow.outbound).await.unwrap().progress, 0.4);
        assert_eq!(hub.connected_devices(&user("u1")), vec![device("slow")]);
    }

    #[tokio::test]
    async fn closed_receiver_is_cleaned_up_on_broadcast() {
        let hub = Hub::spawn(&SyncConfig::default());
        let gone = hub.register(user("u1"), device("gone")).await.unwrap();
        drop(gone);

        hub.broadcast(message("u1", "phone", 0.5)).unwrap();
        // Commands are processed in order, so this registration observes the cleanup.
        let _web = hub.register(user("u1"), device("web")).await.unwrap();

        assert_eq!(hub.connected_devices(&user("u1")), vec![device("web")]);
    }

    #[tokio::test]
    async fn status_for_unknown_user_is_empty() {
        let hub = Hub::spawn(&SyncConfig::default());
        assert!(hub.connected_devices(&user("nobody")).is_empty());
    }
}
