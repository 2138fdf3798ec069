//! Application engine: handler registry, connection indexes and dispatch.
//!
//! This is the hub both layers meet at. Inbound MESSAGE frames are decoded
//! into application packets and dispatched to registered handlers; outbound
//! fan-out enqueues the same encoded packet onto every targeted transport
//! socket. Two indexes are maintained under one reader/writer lock: the
//! transport-socket map and the user-id map. Holding the lock across a
//! fan-out is safe because enqueueing never blocks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{to_json_bytes, DataCodec, JsonCodec};
use crate::config::Config;
use crate::engine::{EngineHandler, EngineIo, SOCKET_ID};
use crate::error::Result;
use crate::metrics::SocketIOMetrics;
use crate::protocol::{EnginePacket, ErrorData, SocketPacket, SocketPacketType, DEFAULT_NAMESPACE};
use crate::redis_adapter::AdapterReceiver;
use crate::socket::Socket;
use crate::transport::EngineSocket;

/// Reserved handler key matched when no exact event handler exists.
pub const CATCH_ALL_EVENT: &str = "*";

/// Shape shared by event handlers and the connect/disconnect hooks.
///
/// Handlers receive the socket, the event name and the raw payload bytes of
/// the event's data element. The returned value becomes the ack payload
/// when the client asked for one.
pub type EventHandler =
    Arc<dyn Fn(Arc<Socket>, String, Bytes) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;

fn boxed<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(Arc<Socket>, String, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue>> + Send + 'static,
{
    Arc::new(
        move |socket, event, data| -> BoxFuture<'static, Result<JsonValue>> {
            Box::pin(handler(socket, event, data))
        },
    )
}

fn noop_handler() -> EventHandler {
    Arc::new(
        |_socket, _event, _data| -> BoxFuture<'static, Result<JsonValue>> {
            Box::pin(async { Ok(JsonValue::Null) })
        },
    )
}

#[derive(Default)]
struct Registry {
    engine_to_socket: HashMap<u64, Arc<Socket>>,
    user_to_sockets: HashMap<String, Vec<Arc<Socket>>>,
}

/// The dispatch core tying transport sockets to application semantics.
pub struct SocketIOManager {
    engine: Arc<EngineIo>,
    codec: Arc<dyn DataCodec>,

    registry: RwLock<Registry>,
    handlers: RwLock<HashMap<String, EventHandler>>,

    connect_handler: RwLock<EventHandler>,
    disconnect_handler: RwLock<EventHandler>,

    metrics: Arc<SocketIOMetrics>,
    weak_self: Weak<SocketIOManager>,
}

impl SocketIOManager {
    /// Build an engine with the default JSON codec.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_codec(config, Arc::new(JsonCodec))
    }

    pub fn with_codec(config: Config, codec: Arc<dyn DataCodec>) -> Arc<Self> {
        let metrics = Arc::new(SocketIOMetrics::new());
        let engine = EngineIo::new(&config, metrics.clone());

        let manager = Arc::new_cyclic(|weak_self: &Weak<SocketIOManager>| Self {
            engine,
            codec,
            registry: RwLock::new(Registry::default()),
            handlers: RwLock::new(HashMap::new()),
            connect_handler: RwLock::new(noop_handler()),
            disconnect_handler: RwLock::new(noop_handler()),
            metrics,
            weak_self: weak_self.clone(),
        });

        let handler: Weak<dyn EngineHandler> = manager.weak_self.clone();
        manager.engine.bind_handler(handler);

        manager
    }

    pub fn codec(&self) -> &Arc<dyn DataCodec> {
        &self.codec
    }

    pub fn metrics(&self) -> &SocketIOMetrics {
        &self.metrics
    }

    /// Accept an established duplex connection and register its socket.
    pub fn add_client<S>(&self, conn: S) -> Arc<Socket>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let engine_socket = self.engine.new_client(conn);
        let socket = Arc::new(Socket::new(engine_socket.clone(), self.weak_self.clone()));

        self.registry
            .write()
            .unwrap()
            .engine_to_socket
            .insert(engine_socket.id(), socket.clone());
        self.metrics.record_socket_added();

        tracing::info!(socket = engine_socket.id(), "client connected");
        socket
    }

    /// Register `handler` for `event`, replacing any previous registration.
    ///
    /// Register under [`CATCH_ALL_EVENT`] to receive events no exact
    /// handler matches.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Socket>, String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue>> + Send + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .insert(event.into(), boxed(handler));
    }

    /// Hook invoked on every CONNECT packet, before namespace acceptance.
    /// Assign the socket's user id here to enable per-user emission.
    pub fn on_connect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Socket>, String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue>> + Send + 'static,
    {
        *self.connect_handler.write().unwrap() = boxed(handler);
    }

    /// Hook invoked exactly once per socket when it disconnects.
    pub fn on_disconnect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Socket>, String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue>> + Send + 'static,
    {
        *self.disconnect_handler.write().unwrap() = boxed(handler);
    }

    /// Emit `["<event>", <data>]` to every connected socket. Best-effort:
    /// per-socket queue overflow drops silently.
    pub fn broadcast<T: Serialize>(&self, event: &str, data: &T) -> Result<()> {
        let value = serde_json::to_value(data)?;
        let encoded = self.codec.marshal(&value)?;
        self.broadcast_raw(event, &encoded)
    }

    /// Emit to every socket of one logical user. A user with no connected
    /// sockets is a no-op.
    pub fn emit_for_user<T: Serialize>(&self, user_id: &str, event: &str, data: &T) -> Result<()> {
        let value = serde_json::to_value(data)?;
        let encoded = self.codec.marshal(&value)?;
        self.emit_raw_for_user(user_id, event, &encoded)
    }

    /// Re-entry point for the cluster adapter. Routes to the local
    /// [`Self::emit_for_user`] or [`Self::broadcast`] equivalent and never
    /// publishes back through an adapter.
    pub fn received_new(&self, user_id: &str, event: &str, data: &RawValue) {
        let data_json = data.get().as_bytes();
        let result = if user_id.is_empty() {
            self.broadcast_raw(event, data_json)
        } else {
            self.emit_raw_for_user(user_id, event, data_json)
        };

        if let Err(err) = result {
            tracing::debug!(event, "dropping cluster event: {err}");
        }
    }

    /// Disconnect every registered socket.
    pub async fn shutdown(&self) {
        let sockets: Vec<Arc<Socket>> = self
            .registry
            .read()
            .unwrap()
            .engine_to_socket
            .values()
            .cloned()
            .collect();

        for socket in sockets {
            socket.close().await;
        }
    }

    fn broadcast_raw(&self, event: &str, data_json: &[u8]) -> Result<()> {
        let registry = self.registry.read().unwrap();
        if registry.engine_to_socket.is_empty() {
            return Ok(());
        }

        let packet = self.event_packet(event, data_json)?;
        for socket in registry.engine_to_socket.values() {
            self.write_to_client(socket, &packet);
        }

        Ok(())
    }

    fn emit_raw_for_user(&self, user_id: &str, event: &str, data_json: &[u8]) -> Result<()> {
        self.metrics.record_emit();

        let registry = self.registry.read().unwrap();
        let Some(sockets) = registry.user_to_sockets.get(user_id) else {
            return Ok(());
        };

        let packet = self.event_packet(event, data_json)?;
        for socket in sockets {
            self.write_to_client(socket, &packet);
        }

        Ok(())
    }

    /// Build an EVENT packet whose payload splices the pre-encoded data
    /// element in verbatim.
    pub(crate) fn event_packet(&self, event: &str, data_json: &[u8]) -> Result<SocketPacket> {
        let raw: &RawValue = serde_json::from_slice(data_json)?;
        let payload = serde_json::to_vec(&(event, raw))?;
        Ok(SocketPacket::new(SocketPacketType::Event).with_data(payload))
    }

    fn write_to_client(&self, socket: &Socket, packet: &SocketPacket) {
        self.engine
            .send(socket.engine_socket(), EnginePacket::message(packet.encode()));
    }

    async fn handle_connect(&self, socket: Arc<Socket>, packet: SocketPacket) {
        let hook = self.connect_handler.read().unwrap().clone();
        if let Err(err) = hook(socket.clone(), String::new(), packet.data.clone()).await {
            let reply = SocketPacket::new(SocketPacketType::ConnectError)
                .with_namespace(packet.namespace.clone())
                .with_data(to_json_bytes(&ErrorData {
                    error: err.to_string(),
                }));
            self.write_to_client(&socket, &reply);
        }

        let user_id = socket.user_id();
        if !user_id.is_empty() {
            self.registry
                .write()
                .unwrap()
                .user_to_sockets
                .entry(user_id)
                .or_default()
                .push(socket.clone());
        }

        self.add_to_namespace(&socket, &packet.namespace);
    }

    fn add_to_namespace(&self, socket: &Arc<Socket>, namespace: &str) {
        if namespace != DEFAULT_NAMESPACE {
            let reply = SocketPacket::new(SocketPacketType::ConnectError)
                .with_namespace(namespace.to_string())
                .with_data(to_json_bytes(&ErrorData {
                    error: "only default namespace is supported".to_string(),
                }));
            self.write_to_client(socket, &reply);
            return;
        }

        #[derive(Serialize)]
        struct ConnectData<'a> {
            sid: &'a str,
        }

        let reply = SocketPacket::new(SocketPacketType::Connect)
            .with_data(to_json_bytes(&ConnectData { sid: SOCKET_ID }));
        self.write_to_client(socket, &reply);
    }

    async fn handle_event(&self, socket: Arc<Socket>, packet: SocketPacket) {
        let (event, data): (String, Box<RawValue>) = match serde_json::from_slice(&packet.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("dropping malformed event payload: {err}");
                return;
            }
        };

        let handler = {
            let handlers = self.handlers.read().unwrap();
            handlers
                .get(&event)
                .or_else(|| handlers.get(CATCH_ALL_EVENT))
                .cloned()
        };
        let Some(handler) = handler else {
            tracing::debug!(%event, "no handler registered, dropping event");
            return;
        };

        let data_bytes = Bytes::copy_from_slice(data.get().as_bytes());
        let result = handler(socket.clone(), event, data_bytes).await;

        if let Some(ack_id) = packet.ack_id {
            let payload = match result {
                Ok(value) => to_json_bytes(&[value]),
                Err(err) => to_json_bytes(&[ErrorData {
                    error: err.to_string(),
                }]),
            };

            let ack = SocketPacket::new(SocketPacketType::Ack)
                .with_namespace(packet.namespace)
                .with_ack_id(ack_id)
                .with_data(payload);
            self.write_to_client(&socket, &ack);
        }
    }
}

#[async_trait]
impl EngineHandler for SocketIOManager {
    async fn handle_packet(&self, engine_socket: &Arc<EngineSocket>, packet: EnginePacket) {
        let packet = match SocketPacket::decode(&packet.data) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(socket = engine_socket.id(), "dropping malformed packet: {err}");
                return;
            }
        };

        let socket = {
            self.registry
                .read()
                .unwrap()
                .engine_to_socket
                .get(&engine_socket.id())
                .cloned()
        };
        let Some(socket) = socket else {
            tracing::debug!(socket = engine_socket.id(), "packet for unregistered socket");
            return;
        };

        match packet.packet_type {
            SocketPacketType::Connect => self.handle_connect(socket, packet).await,
            SocketPacketType::Disconnect => engine_socket.clone().close().await,
            SocketPacketType::Event => self.handle_event(socket, packet).await,
            _ => {}
        }
    }

    async fn handle_disconnect(&self, engine_socket: &Arc<EngineSocket>) {
        let socket = {
            let mut registry = self.registry.write().unwrap();
            let Some(socket) = registry.engine_to_socket.remove(&engine_socket.id()) else {
                return;
            };

            let user_id = socket.user_id();
            if !user_id.is_empty() {
                if let Some(sockets) = registry.user_to_sockets.get_mut(&user_id) {
                    sockets.retain(|s| !Arc::ptr_eq(s, &socket));
                    if sockets.is_empty() {
                        registry.user_to_sockets.remove(&user_id);
                    }
                }
            }

            socket
        };

        self.metrics.record_socket_removed();
        tracing::info!(socket = engine_socket.id(), "client disconnected");

        let hook = self.disconnect_handler.read().unwrap().clone();
        if let Err(err) = hook(socket, String::new(), Bytes::new()).await {
            tracing::debug!("disconnect hook failed: {err}");
        }
    }
}

#[async_trait]
impl AdapterReceiver for SocketIOManager {
    async fn received_new(&self, user_id: &str, event: &str, data: &RawValue) {
        SocketIOManager::received_new(self, user_id, event, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::{sleep, timeout, Instant};

    fn test_config() -> Config {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        Config {
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(60),
            ..Config::default()
        }
    }

    async fn read_frame(reader: &mut ReadHalf<DuplexStream>) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let n = timeout(Duration::from_secs(2), reader.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        buf.truncate(n);
        buf
    }

    async fn assert_no_frame(reader: &mut ReadHalf<DuplexStream>) {
        let mut buf = vec![0u8; 64];
        let res = timeout(Duration::from_millis(200), reader.read(&mut buf)).await;
        assert!(res.is_err(), "unexpected frame: {:?}", &buf);
    }

    /// Run the OPEN + CONNECT handshake for a fresh client, returning the
    /// client-side halves and the registered application socket.
    async fn connect(
        manager: &Arc<SocketIOManager>,
        connect_payload: &[u8],
    ) -> (
        ReadHalf<DuplexStream>,
        WriteHalf<DuplexStream>,
        Arc<Socket>,
    ) {
        let (client, server) = duplex(1024);
        let socket = manager.add_client(server);
        let (mut reader, mut writer) = split(client);

        let open = read_frame(&mut reader).await;
        assert_eq!(open[0], b'0', "expected OPEN, got {:?}", open);

        let mut frame = b"40".to_vec();
        frame.extend_from_slice(connect_payload);
        writer.write_all(&frame).await.unwrap();

        let reply = read_frame(&mut reader).await;
        assert_eq!(reply, b"40{\"sid\":\"9Cx9Ds4C\"}");

        (reader, writer, socket)
    }

    #[tokio::test]
    async fn open_handshake_advertises_timings() {
        let manager = SocketIOManager::new(test_config());
        let (client, server) = duplex(1024);
        let _socket = manager.add_client(server);
        let (mut reader, _writer) = split(client);

        let open = read_frame(&mut reader).await;
        assert_eq!(open[0], b'0');

        let body: JsonValue = serde_json::from_slice(&open[1..]).unwrap();
        assert_eq!(body["sid"], "9Cx9Ds4C");
        assert_eq!(body["upgrades"], json!([]));
        assert_eq!(body["pingInterval"], 60_000);
        assert_eq!(body["pingTimeout"], 60_000);
        assert_eq!(body["maxPayload"], 1_000_000);
    }

    #[tokio::test]
    async fn connect_replies_with_session_id() {
        let manager = SocketIOManager::new(test_config());
        let _client = connect(&manager, b"").await;
    }

    #[tokio::test]
    async fn connect_rejects_other_namespace() {
        let manager = SocketIOManager::new(test_config());
        let (client, server) = duplex(1024);
        let _socket = manager.add_client(server);
        let (mut reader, mut writer) = split(client);

        let open = read_frame(&mut reader).await;
        assert_eq!(open[0], b'0');

        writer.write_all(b"40/chat,").await.unwrap();

        let reply = read_frame(&mut reader).await;
        assert_eq!(
            reply,
            b"44/chat,{\"error\":\"only default namespace is supported\"}"
        );
    }

    #[tokio::test]
    async fn event_with_ack_round_trip() {
        let manager = SocketIOManager::new(test_config());
        manager.on("hello", |_socket, _event, _data| async {
            Ok::<_, Error>(json!({"ok": true}))
        });

        let (mut reader, mut writer, _socket) = connect(&manager, b"").await;

        writer.write_all(b"42217[\"hello\",{}]").await.unwrap();

        let ack = read_frame(&mut reader).await;
        assert_eq!(ack, b"43217[{\"ok\":true}]");
    }

    #[tokio::test]
    async fn handler_failure_becomes_ack_error() {
        let manager = SocketIOManager::new(test_config());
        manager.on("boom", |_socket, _event, _data| async {
            Err::<JsonValue, _>(Error::handler("kaput"))
        });

        let (mut reader, mut writer, _socket) = connect(&manager, b"").await;

        writer.write_all(b"429[\"boom\",{}]").await.unwrap();

        let ack = read_frame(&mut reader).await;
        assert!(ack.starts_with(b"439[{\"error\":"), "ack: {:?}", ack);
        assert!(String::from_utf8_lossy(&ack).contains("kaput"));
    }

    #[tokio::test]
    async fn event_without_ack_stays_silent() {
        let manager = SocketIOManager::new(test_config());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        manager.on("fire", move |_socket, _event, _data| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(JsonValue::Null)
            }
        });

        let (mut reader, mut writer, _socket) = connect(&manager, b"").await;

        writer.write_all(b"42[\"fire\",{}]").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_no_frame(&mut reader).await;
    }

    #[tokio::test]
    async fn catch_all_receives_unmatched_events() {
        let manager = SocketIOManager::new(test_config());
        manager.on(CATCH_ALL_EVENT, |_socket, event, data| async move {
            Ok::<_, Error>(json!({
                "event": event,
                "data": String::from_utf8_lossy(&data),
            }))
        });

        let (mut reader, mut writer, _socket) = connect(&manager, b"").await;

        writer.write_all(b"4255[\"unknown\",{\"a\":1}]").await.unwrap();

        let ack = read_frame(&mut reader).await;
        assert!(ack.starts_with(b"4355["), "ack: {:?}", ack);

        let body: Vec<JsonValue> = serde_json::from_slice(&ack[4..]).unwrap();
        assert_eq!(body[0]["event"], "unknown");
        assert_eq!(body[0]["data"], "{\"a\":1}");
    }

    #[tokio::test]
    async fn unhandled_event_is_dropped() {
        let manager = SocketIOManager::new(test_config());
        let (mut reader, mut writer, _socket) = connect(&manager, b"").await;

        writer.write_all(b"427[\"nobody\",{}]").await.unwrap();
        assert_no_frame(&mut reader).await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let manager = SocketIOManager::new(test_config());
        let (mut r1, _w1, _s1) = connect(&manager, b"").await;
        let (mut r2, _w2, _s2) = connect(&manager, b"").await;

        manager.broadcast("x", &json!(1)).unwrap();

        assert_eq!(read_frame(&mut r1).await, b"42[\"x\",1]");
        assert_eq!(read_frame(&mut r2).await, b"42[\"x\",1]");
    }

    fn index_users_on_connect(manager: &Arc<SocketIOManager>) {
        manager.on_connect(|socket, _event, data| async move {
            if let Ok(body) = serde_json::from_slice::<JsonValue>(&data) {
                if let Some(user) = body.get("user").and_then(JsonValue::as_str) {
                    socket.set_user_id(user);
                }
            }
            Ok::<_, Error>(JsonValue::Null)
        });
    }

    #[tokio::test]
    async fn emit_for_user_reaches_all_user_sockets() {
        let manager = SocketIOManager::new(test_config());
        index_users_on_connect(&manager);

        let (mut r1, _w1, _s1) = connect(&manager, b"{\"user\":\"u1\"}").await;
        let (mut r2, _w2, _s2) = connect(&manager, b"{\"user\":\"u1\"}").await;
        let (mut r3, _w3, _s3) = connect(&manager, b"{\"user\":\"u2\"}").await;

        manager.emit_for_user("u1", "ping", &json!({})).unwrap();

        assert_eq!(read_frame(&mut r1).await, b"42[\"ping\",{}]");
        assert_eq!(read_frame(&mut r2).await, b"42[\"ping\",{}]");
        assert_no_frame(&mut r3).await;

        assert_eq!(manager.metrics().emits_total(), 1);
    }

    #[tokio::test]
    async fn emit_for_unknown_user_is_noop() {
        let manager = SocketIOManager::new(test_config());
        let (mut reader, _writer, _socket) = connect(&manager, b"").await;

        manager.emit_for_user("ghost", "ping", &json!({})).unwrap();
        assert_no_frame(&mut reader).await;
    }

    #[tokio::test]
    async fn disconnect_removes_socket_from_user_index() {
        let manager = SocketIOManager::new(test_config());
        index_users_on_connect(&manager);

        let (mut r1, _w1, s1) = connect(&manager, b"{\"user\":\"u1\"}").await;
        let (mut r2, _w2, _s2) = connect(&manager, b"{\"user\":\"u1\"}").await;

        s1.close().await;
        // Drain whatever the teardown wrote to the closing client.
        let _ = read_frame(&mut r1).await;

        manager.emit_for_user("u1", "ping", &json!({})).unwrap();
        assert_eq!(read_frame(&mut r2).await, b"42[\"ping\",{}]");
    }

    #[tokio::test]
    async fn disconnect_hook_fires_exactly_once() {
        let manager = SocketIOManager::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.on_disconnect(move |_socket, _event, _data| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(JsonValue::Null)
            }
        });

        let (_reader, _writer, socket) = connect(&manager, b"").await;

        socket.close().await;
        socket.close().await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.metrics().total_sockets(), 0);
        assert_eq!(manager.metrics().current_clients(), 0);
    }

    #[tokio::test]
    async fn disconnect_packet_triggers_hook_once() {
        let manager = SocketIOManager::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.on_disconnect(move |_socket, _event, _data| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(JsonValue::Null)
            }
        });

        let (mut reader, mut writer, socket) = connect(&manager, b"").await;

        writer.write_all(b"41").await.unwrap();
        // The writer flushes a CLOSE frame on its way out.
        let close = read_frame(&mut reader).await;
        assert_eq!(close, b"1");

        socket.close().await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn received_new_without_user_broadcasts_locally() {
        let manager = SocketIOManager::new(test_config());
        let (mut reader, _writer, _socket) = connect(&manager, b"").await;

        let data = RawValue::from_string("1".to_string()).unwrap();
        manager.received_new("", "x", &data);

        assert_eq!(read_frame(&mut reader).await, b"42[\"x\",1]");
    }

    #[tokio::test]
    async fn received_new_with_user_targets_that_user() {
        let manager = SocketIOManager::new(test_config());
        index_users_on_connect(&manager);

        let (mut r1, _w1, _s1) = connect(&manager, b"{\"user\":\"u1\"}").await;
        let (mut r2, _w2, _s2) = connect(&manager, b"{\"user\":\"u2\"}").await;

        let data = RawValue::from_string("{\"k\":2}".to_string()).unwrap();
        manager.received_new("u2", "y", &data);

        assert_eq!(read_frame(&mut r2).await, b"42[\"y\",{\"k\":2}]");
        assert_no_frame(&mut r1).await;
    }

    #[tokio::test]
    async fn socket_emit_writes_event_packet() {
        let manager = SocketIOManager::new(test_config());
        let (mut reader, _writer, socket) = connect(&manager, b"").await;

        socket.emit("direct", &json!({"n": 2})).unwrap();

        assert_eq!(read_frame(&mut reader).await, b"42[\"direct\",{\"n\":2}]");
    }

    #[tokio::test]
    async fn full_outbound_queue_never_blocks_broadcast() {
        let manager = SocketIOManager::new(test_config());
        let (client, server) = duplex(16);
        let _socket = manager.add_client(server);

        // Nobody reads the client side, so the writer wedges and the
        // outbound queue fills up.
        let payload = json!("x".repeat(512));
        let started = Instant::now();
        for _ in 0..64 {
            manager.broadcast("spam", &payload).unwrap();
        }

        assert!(started.elapsed() < Duration::from_secs(1));
        drop(client);
    }

    #[tokio::test]
    async fn replacing_a_handler_overwrites_the_previous_one() {
        let manager = SocketIOManager::new(test_config());
        manager.on("ev", |_socket, _event, _data| async {
            Ok::<_, Error>(json!("first"))
        });
        manager.on("ev", |_socket, _event, _data| async {
            Ok::<_, Error>(json!("second"))
        });

        let (mut reader, mut writer, _socket) = connect(&manager, b"").await;

        writer.write_all(b"421[\"ev\",null]").await.unwrap();
        assert_eq!(read_frame(&mut reader).await, b"431[\"second\"]");
    }

    #[tokio::test]
    async fn shutdown_disconnects_every_socket() {
        let manager = SocketIOManager::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.on_disconnect(move |_socket, _event, _data| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(JsonValue::Null)
            }
        });

        let (_r1, _w1, _s1) = connect(&manager, b"").await;
        let (_r2, _w2, _s2) = connect(&manager, b"").await;

        manager.shutdown().await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.metrics().current_clients(), 0);
    }
}
