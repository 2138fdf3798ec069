use std::time::Duration;

/// Default Redis channel for cross-node event fan-out.
pub const DEFAULT_EVENTS_CHANNEL: &str = "events:websocket";

/// Tuning knobs for the server core.
///
/// The defaults match the reference Engine.IO timings: a PING every 25
/// seconds with 20 seconds for the client to answer.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the writer sends a PING packet.
    pub ping_interval: Duration,
    /// How long a connection may stay silent before it is considered dead.
    /// Refreshed on every inbound packet.
    pub ping_timeout: Duration,
    /// Pub/sub channel used by the cluster adapter.
    pub events_channel: String,
    /// Upper bound for a single read off the byte connection.
    pub read_buffer_size: usize,
    /// Advisory maximum payload advertised in the OPEN handshake.
    pub max_payload: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(20),
            events_channel: DEFAULT_EVENTS_CHANNEL.to_string(),
            read_buffer_size: 1024,
            max_payload: 1_000_000,
        }
    }
}
