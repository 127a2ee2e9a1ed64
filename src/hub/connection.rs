// Inbound/outbound pumps bridging one device socket to the hub

use std::{fmt::Display, time::Duration};

use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use poem::web::websocket::Message;
use tokio::{
    sync::mpsc,
    time::{Instant, interval_at, timeout},
};

use super::{ConnectionHandle, Hub, Registration};
use crate::{
    config::SyncConfig,
    domain::{DeviceId, MessageKind, SyncMessage, UserId},
    error::{SyncError, SyncResult},
    sync::SyncCoordinator,
};

/// Lifecycle of a device connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Handshake done, registration with the hub pending.
    Connecting,
    Registered,
    /// Pumps running.
    Active,
    Unregistering,
    Closed,
}

pub struct Connection {
    handle: ConnectionHandle,
    hub: Hub,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Registers the device with the hub. The returned receiver is the connection's outbound queue.
    pub async fn open(
        hub: &Hub,
        user_id: UserId,
        device_id: DeviceId,
    ) -> SyncResult<(Self, mpsc::Receiver<SyncMessage>)> {
        let state = Mutex::new(ConnectionState::Connecting);
        let Registration { handle, outbound } = hub.register(user_id, device_id).await?;
        let connection = Self {
            handle,
            hub: hub.clone(),
            state,
        };
        connection.advance(ConnectionState::Registered);
        Ok((connection, outbound))
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if next > *state {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Tears the connection down. Safe to call from either pump; only the first call unregisters.
    pub fn close(&self) -> bool {
        if !self.advance(ConnectionState::Unregistering) {
            return false;
        }
        self.hub.unregister(&self.handle);
        self.advance(ConnectionState::Closed);
        true
    }

    async fn handle_frame(&self, payload: &[u8], coordinator: &SyncCoordinator, max_bytes: usize) {
        let ConnectionHandle {
            user_id, device_id, ..
        } = &self.handle;
        if payload.len() > max_bytes {
            tracing::debug!(%user_id, %device_id, len = payload.len(), "dropping oversized frame");
            return;
        }
        let message: SyncMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(%user_id, %device_id, error = %e, "dropping malformed frame");
                return;
            }
        };
        // Frames claiming another user are dropped without any reply.
        if message.user_id != user_id.as_str() {
            return;
        }
        if message.kind != MessageKind::Sync {
            tracing::debug!(%user_id, %device_id, kind = ?message.kind, "ignoring reserved message kind");
            return;
        }
        if let Err(e) = coordinator
            .sync_progress(
                user_id.as_str(),
                &message.book_id,
                &message.chapter_id,
                device_id.as_str(),
                message.progress,
                Utc::now(),
            )
            .await
        {
            tracing::warn!(%user_id, %device_id, book_id = %message.book_id, error = %e, "dropping live progress update");
        }
    }
}

/// Runs both pumps until either finishes, then closes the connection.
pub async fn serve<S, E, K>(
    connection: Connection,
    outbound: mpsc::Receiver<SyncMessage>,
    stream: S,
    sink: K,
    coordinator: &SyncCoordinator,
    config: &SyncConfig,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    connection.advance(ConnectionState::Active);
    let ConnectionHandle {
        id,
        user_id,
        device_id,
    } = connection.handle().clone();
    tracing::info!(%user_id, %device_id, connection_id = id, "device connected");

    let (pump, result) = tokio::select! {
        result = read_pump(&connection, stream, coordinator, config) => ("inbound", result),
        result = write_pump(sink, outbound, config) => ("outbound", result),
    };
    match result {
        Ok(()) => tracing::debug!(%user_id, %device_id, pump, "connection pump finished"),
        Err(e) => tracing::debug!(%user_id, %device_id, pump, error = %e, "connection pump failed"),
    }

    connection.close();
    tracing::info!(%user_id, %device_id, connection_id = id, "device disconnected");
}

async fn read_pump<S, E>(
    connection: &Connection,
    mut stream: S,
    coordinator: &SyncCoordinator,
    config: &SyncConfig,
) -> SyncResult<()>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        // Any frame, pongs included, refreshes the deadline.
        let frame = match timeout(config.read_timeout, stream.next()).await {
            Err(_) => return Err(SyncError::Transport("read deadline exceeded".into())),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(SyncError::Transport(e.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => {
                connection
                    .handle_frame(text.as_bytes(), coordinator, config.max_message_bytes)
                    .await
            }
            Message::Binary(bytes) => {
                connection
                    .handle_frame(&bytes, coordinator, config.max_message_bytes)
                    .await
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
}

async fn write_pump<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<SyncMessage>,
    config: &SyncConfig,
) -> SyncResult<()>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => {
                    let text = serde_json::to_string(&message)
                        .map_err(|e| SyncError::Transport(e.to_string()))?;
                    send(&mut sink, Message::Text(text), config.write_timeout).await?;
                }
                None => {
                    // Queue closed by the hub: replaced, evicted or unregistered.
                    send(&mut sink, Message::Close(None), config.write_timeout).await?;
                    return Ok(());
                }
            },
            _ = ping.tick() => {
                send(&mut sink, Message::Ping(Vec::new()), config.write_timeout).await?;
            }
        }
    }
}

async fn send<K>(sink: &mut K, frame: Message, deadline: Duration) -> SyncResult<()>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    match timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SyncError::Transport(e.to_string())),
        Err(_) => Err(SyncError::Transport("write deadline exceeded".into())),
    }
}
