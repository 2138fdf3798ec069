//! Application-layer socket handle.

use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;

use crate::error::Result;
use crate::manager::SocketIOManager;
use crate::protocol::EnginePacket;
use crate::transport::EngineSocket;

/// Thin per-connection handle bound to a transport socket.
///
/// The user id starts empty; the connect hook is expected to fill it in via
/// [`Socket::set_user_id`] so the engine can route per-user emissions.
pub struct Socket {
    user_id: RwLock<String>,
    engine_socket: Arc<EngineSocket>,
    manager: Weak<SocketIOManager>,
}

impl Socket {
    pub(crate) fn new(engine_socket: Arc<EngineSocket>, manager: Weak<SocketIOManager>) -> Self {
        Self {
            user_id: RwLock::new(String::new()),
            engine_socket,
            manager,
        }
    }

    /// Logical user this connection belongs to; empty until the connect
    /// hook assigns one.
    pub fn user_id(&self) -> String {
        self.user_id.read().unwrap().clone()
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        *self.user_id.write().unwrap() = user_id.into();
    }

    /// The engine this socket is registered with, if it is still alive.
    pub fn server(&self) -> Option<Arc<SocketIOManager>> {
        self.manager.upgrade()
    }

    /// Send an EVENT packet `["<event>", <data>]` to this connection at the
    /// default namespace. Delivery is best-effort: a full outbound queue
    /// drops the packet.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };

        let value = serde_json::to_value(data)?;
        let encoded = manager.codec().marshal(&value)?;
        let packet = manager.event_packet(event, &encoded)?;

        self.engine_socket
            .write(EnginePacket::message(packet.encode()));
        Ok(())
    }

    /// Disconnect this socket: removed from the engine's indexes, transport
    /// torn down, disconnect hook invoked. Safe to call more than once.
    pub async fn close(&self) {
        self.engine_socket.clone().close().await;
    }

    pub(crate) fn engine_socket(&self) -> &Arc<EngineSocket> {
        &self.engine_socket
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("user_id", &self.user_id())
            .field("engine_socket", &self.engine_socket)
            .finish()
    }
}
