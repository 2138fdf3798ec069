//! Transport engine: factory for transport sockets and the OPEN handshake.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::to_json_bytes;
use crate::config::Config;
use crate::metrics::SocketIOMetrics;
use crate::protocol::{EnginePacket, EnginePacketType, OpenPacket};
use crate::transport::EngineSocket;

/// Session id advertised in the OPEN handshake and the namespace CONNECT
/// reply. Reconnection identity is not modeled, so a fixed id suffices;
/// nothing else keys on it.
pub const SOCKET_ID: &str = "9Cx9Ds4C";

/// Upward interface of the transport layer: decoded MESSAGE frames and
/// disconnect notifications, both delivered from the socket's reader task.
#[async_trait]
pub(crate) trait EngineHandler: Send + Sync {
    async fn handle_packet(&self, socket: &Arc<EngineSocket>, packet: EnginePacket);
    async fn handle_disconnect(&self, socket: &Arc<EngineSocket>);
}

/// Factory and configuration holder for transport sockets.
pub struct EngineIo {
    ping_interval: Duration,
    ping_timeout: Duration,
    read_buffer_size: usize,
    max_payload: usize,
    handler: OnceLock<Weak<dyn EngineHandler>>,
    metrics: Arc<SocketIOMetrics>,
    next_socket_id: AtomicU64,
    weak_self: Weak<EngineIo>,
}

impl EngineIo {
    pub(crate) fn new(config: &Config, metrics: Arc<SocketIOMetrics>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            read_buffer_size: config.read_buffer_size,
            max_payload: config.max_payload,
            handler: OnceLock::new(),
            metrics,
            next_socket_id: AtomicU64::new(1),
            weak_self: weak_self.clone(),
        })
    }

    /// Wire the upper layer in. Must happen before the first client is
    /// accepted; later calls are ignored.
    pub(crate) fn bind_handler(&self, handler: Weak<dyn EngineHandler>) {
        let _ = self.handler.set(handler);
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn EngineHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    /// Accept an established duplex connection: start both workers and
    /// immediately enqueue the OPEN handshake.
    pub fn new_client<S>(&self, conn: S) -> Arc<EngineSocket>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let socket = EngineSocket::spawn(
            self.weak_self.clone(),
            self.next_socket_id.fetch_add(1, Ordering::Relaxed),
            conn,
            self.read_buffer_size,
            self.ping_interval,
            self.ping_timeout,
        );
        self.metrics.record_client_connected();
        self.send_open_packet(&socket);
        socket
    }

    /// Synchronous enqueue onto the socket's outbound queue.
    pub fn send(&self, socket: &EngineSocket, packet: EnginePacket) {
        socket.write(packet);
    }

    fn send_open_packet(&self, socket: &EngineSocket) {
        let open = OpenPacket {
            sid: SOCKET_ID.to_string(),
            upgrades: Vec::new(),
            ping_interval: self.ping_interval.as_millis() as u64,
            ping_timeout: self.ping_timeout.as_millis() as u64,
            max_payload: self.max_payload,
        };

        socket.write(EnginePacket::new(
            EnginePacketType::Open,
            to_json_bytes(&open),
        ));
    }

    pub(crate) fn metrics(&self) -> &SocketIOMetrics {
        &self.metrics
    }
}
