//! Per-connection transport socket and its two workers.
//!
//! Every accepted connection gets exactly two tasks: a reader that blocks on
//! the byte stream and forwards decoded MESSAGE frames upward, and a writer
//! that drains the bounded outbound queue and keeps the connection alive
//! with periodic PINGs. The workers communicate only through the queue and
//! the shared shutdown token.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::engine::EngineIo;
use crate::error::{Error, Result};
use crate::protocol::{EnginePacket, EnginePacketType, CLOSE_FRAME, PING_FRAME};

/// Outbound queue depth per socket. When the queue is full the packet is
/// dropped so a wedged connection never slows the dispatch path.
pub(crate) const OUTBOUND_QUEUE_CAPACITY: usize = 16;

/// One live transport connection.
///
/// Producers enqueue packets through [`EngineSocket::write`]; the writer
/// worker owns the byte stream. Teardown is a one-shot transition no matter
/// which side initiates it.
pub struct EngineSocket {
    id: u64,
    outbound: mpsc::Sender<EnginePacket>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    engine: Weak<EngineIo>,
}

impl EngineSocket {
    /// Create the socket and start its reader and writer workers.
    pub(crate) fn spawn<S>(
        engine: Weak<EngineIo>,
        id: u64,
        conn: S,
        read_buffer_size: usize,
        ping_interval: Duration,
        ping_timeout: Duration,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let socket = Arc::new(Self {
            id,
            outbound: tx,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            engine,
        });

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(read_loop(
            socket.clone(),
            reader,
            read_buffer_size,
            ping_timeout,
        ));
        tokio::spawn(write_loop(
            socket.clone(),
            writer,
            rx,
            ping_interval,
            ping_timeout,
        ));

        socket
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Non-blocking enqueue. Packets sent to a full queue or a closed
    /// socket are dropped without error.
    pub fn write(&self, packet: EnginePacket) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.outbound.try_send(packet).is_err() {
            tracing::debug!(socket = self.id, "outbound queue unavailable, dropping packet");
        }
    }

    /// Tear the connection down. Idempotent: the first call wins, every
    /// later call is a no-op.
    pub async fn close(self: Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();

        if let Some(engine) = self.engine.upgrade() {
            engine.metrics().record_client_disconnected();
            if let Some(handler) = engine.handler() {
                handler.handle_disconnect(&self).await;
            }
        }
    }
}

impl std::fmt::Debug for EngineSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSocket")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Read one chunk per iteration under the liveness deadline. Every
/// successful read pushes the deadline forward by `ping_timeout`, so a
/// client that answers PINGs stays alive indefinitely.
async fn read_loop<R>(
    socket: Arc<EngineSocket>,
    mut reader: R,
    read_buffer_size: usize,
    ping_timeout: Duration,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; read_buffer_size];

    loop {
        tokio::select! {
            _ = socket.shutdown.cancelled() => break,
            res = timeout(ping_timeout, reader.read(&mut buf)) => {
                let n = match res {
                    Err(_) => {
                        tracing::debug!(socket = socket.id, "liveness deadline expired");
                        break;
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(socket = socket.id, "read failed: {err}");
                        break;
                    }
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => n,
                };

                let packet = match EnginePacket::decode(&buf[..n]) {
                    Ok(packet) => packet,
                    Err(err) => {
                        tracing::warn!(socket = socket.id, "dropping malformed transport packet: {err}");
                        continue;
                    }
                };

                match packet.packet_type {
                    EnginePacketType::Pong => {}
                    EnginePacketType::Message => {
                        let handler = socket.engine.upgrade().and_then(|engine| engine.handler());
                        if let Some(handler) = handler {
                            handler.handle_packet(&socket, packet).await;
                        }
                    }
                    EnginePacketType::Close => break,
                    _ => {}
                }
            }
        }
    }

    socket.close().await;
}

/// Drain the outbound queue and the PING ticker. On shutdown, flush what
/// was already queued and say goodbye with a CLOSE frame.
async fn write_loop<W>(
    socket: Arc<EngineSocket>,
    mut writer: W,
    mut outbound: mpsc::Receiver<EnginePacket>,
    ping_interval: Duration,
    ping_timeout: Duration,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            _ = socket.shutdown.cancelled() => {
                while let Ok(packet) = outbound.try_recv() {
                    if write_frame(&mut writer, &packet.encode(), ping_timeout).await.is_err() {
                        break;
                    }
                }
                let _ = write_frame(&mut writer, CLOSE_FRAME, ping_timeout).await;
                break;
            }
            maybe = outbound.recv() => {
                match maybe {
                    Some(packet) => {
                        if let Err(err) = write_frame(&mut writer, &packet.encode(), ping_timeout).await {
                            tracing::debug!(socket = socket.id, "write failed: {err}");
                            break;
                        }
                    }
                    None => {
                        let _ = write_frame(&mut writer, CLOSE_FRAME, ping_timeout).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = write_frame(&mut writer, PING_FRAME, ping_timeout).await {
                    tracing::debug!(socket = socket.id, "ping write failed: {err}");
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    socket.close().await;
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8], deadline: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    match timeout(deadline, writer.write_all(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Transport(err)),
        Err(_) => Err(Error::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}
