//! Server core for a two-layer real-time messaging protocol.
//!
//! The lower transport layer frames packets with a single type digit,
//! keeps connections alive with PING/PONG deadlines and runs exactly two
//! workers per connection over a bounded outbound queue. The upper
//! application layer dispatches framed events to registered handlers,
//! answers acknowledgement requests and fans events out to all sockets or
//! all sockets of one logical user. An optional Redis adapter extends the
//! fan-out across nodes.
//!
//! The crate consumes already-established duplex byte connections (anything
//! `AsyncRead + AsyncWrite`); performing the HTTP/WebSocket upgrade that
//! yields such a connection is the embedder's job.
//!
//! ```no_run
//! use talkio::{Config, Error, SocketIOManager};
//!
//! # async fn accept(conn: tokio::net::TcpStream) {
//! let manager = SocketIOManager::new(Config::default());
//! manager.on("hello", |_socket, _event, _data| async {
//!     Ok::<_, Error>(serde_json::json!({"ok": true}))
//! });
//! manager.add_client(conn);
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod redis_adapter;
pub mod socket;
pub mod transport;

pub use codec::{DataCodec, JsonCodec};
pub use config::{Config, DEFAULT_EVENTS_CHANNEL};
pub use engine::{EngineIo, SOCKET_ID};
pub use error::{Error, Result};
pub use manager::{EventHandler, SocketIOManager, CATCH_ALL_EVENT};
pub use metrics::SocketIOMetrics;
pub use protocol::{
    EnginePacket, EnginePacketType, ErrorData, OpenPacket, SocketPacket, SocketPacketType,
    DEFAULT_NAMESPACE, PACKET_SEPARATOR,
};
pub use redis_adapter::{AdapterReceiver, AdapterSender, PushData, RedisAdapter};
pub use socket::Socket;
pub use transport::EngineSocket;
