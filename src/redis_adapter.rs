//! Cluster fan-out over Redis pub/sub.
//!
//! One shared channel carries every cross-node event. Publishing happens on
//! the sender side of [`RedisAdapter`]; a single long-lived subscriber per
//! adapter re-injects received envelopes into the local engine through
//! [`AdapterReceiver::received_new`]. The receive path never publishes, so
//! envelopes cannot loop between nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::codec::{DataCodec, JsonCodec};
use crate::config::{Config, DEFAULT_EVENTS_CHANNEL};
use crate::error::{Error, Result};

/// Delay before the subscriber retries after a transport failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Outbound half of the cluster bridge.
#[async_trait]
pub trait AdapterSender: Send + Sync {
    /// Publish an event for every socket on every node.
    async fn broadcast(&self, event: &str, data: &JsonValue) -> Result<()>;

    /// Publish an event for all sockets of one logical user, cluster-wide.
    async fn emit_for_user(&self, user_id: &str, event: &str, data: &JsonValue) -> Result<()>;
}

/// Inbound half of the cluster bridge, implemented by the local engine.
///
/// `user_id` is empty for broadcast envelopes. Envelopes are delivered
/// at-least-once and in no particular cross-publisher order, so the
/// implementation must tolerate repeats.
#[async_trait]
pub trait AdapterReceiver: Send + Sync {
    async fn received_new(&self, user_id: &str, event: &str, data: &RawValue);
}

/// Envelope published for every cross-node event. The field names are part
/// of the wire contract between nodes.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushData {
    #[serde(rename = "UserID", default)]
    pub user_id: String,
    #[serde(rename = "Event")]
    pub event: String,
    #[serde(rename = "Data")]
    pub data: Box<RawValue>,
}

/// Pub/sub bridge between engines on different nodes, backed by a single
/// Redis channel.
pub struct RedisAdapter {
    client: redis::Client,
    receiver: Arc<dyn AdapterReceiver>,
    codec: Arc<dyn DataCodec>,
    events_channel: String,
}

impl RedisAdapter {
    /// Build an adapter with the default JSON codec and channel name.
    pub fn new(client: redis::Client, receiver: Arc<dyn AdapterReceiver>) -> Self {
        Self::with_config(client, receiver, Arc::new(JsonCodec), DEFAULT_EVENTS_CHANNEL)
    }

    /// Build an adapter publishing on the channel named in `config`.
    pub fn from_config(
        client: redis::Client,
        receiver: Arc<dyn AdapterReceiver>,
        codec: Arc<dyn DataCodec>,
        config: &Config,
    ) -> Self {
        Self::with_config(client, receiver, codec, config.events_channel.clone())
    }

    pub fn with_config(
        client: redis::Client,
        receiver: Arc<dyn AdapterReceiver>,
        codec: Arc<dyn DataCodec>,
        events_channel: impl Into<String>,
    ) -> Self {
        Self {
            client,
            receiver,
            codec,
            events_channel: events_channel.into(),
        }
    }

    pub fn events_channel(&self) -> &str {
        &self.events_channel
    }

    /// Spawn the long-lived subscriber. It reconnects with a delay after
    /// transport failures and exits when `shutdown` is cancelled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let adapter = self.clone();
        tokio::spawn(async move { adapter.listen(shutdown).await })
    }

    async fn listen(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.consume(&shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    tracing::error!(
                        channel = %self.events_channel,
                        "subscription failed: {err}, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn consume(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| Error::Adapter(format!("connect subscriber: {err}")))?;
        pubsub
            .subscribe(&self.events_channel)
            .await
            .map_err(|err| Error::Adapter(format!("subscribe {}: {err}", self.events_channel)))?;

        tracing::info!(channel = %self.events_channel, "subscribed to event channel");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(Error::Adapter("subscription stream closed".to_string()));
                    };

                    match serde_json::from_slice::<PushData>(msg.get_payload_bytes()) {
                        Ok(push) => {
                            self.receiver
                                .received_new(&push.user_id, &push.event, &push.data)
                                .await;
                        }
                        Err(err) => tracing::debug!("skipping malformed envelope: {err}"),
                    }
                }
            }
        }
    }

    async fn send(&self, push: PushData) -> std::result::Result<(), String> {
        let payload = serde_json::to_vec(&push).map_err(|err| err.to_string())?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| format!("connect to redis: {err}"))?;
        conn.publish::<_, _, ()>(&self.events_channel, payload)
            .await
            .map_err(|err| format!("send websocket event from adapter: {err}"))?;

        Ok(())
    }

    fn encode_data(&self, data: &JsonValue) -> Result<Box<RawValue>> {
        let bytes = self.codec.marshal(data)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl AdapterSender for RedisAdapter {
    async fn broadcast(&self, event: &str, data: &JsonValue) -> Result<()> {
        let data = self.encode_data(data)?;
        self.send(PushData {
            user_id: String::new(),
            event: event.to_string(),
            data,
        })
        .await
        .map_err(|err| Error::Adapter(format!("broadcast: {err}")))
    }

    async fn emit_for_user(&self, user_id: &str, event: &str, data: &JsonValue) -> Result<()> {
        let data = self.encode_data(data)?;
        self.send(PushData {
            user_id: user_id.to_string(),
            event: event.to_string(),
            data,
        })
        .await
        .map_err(|err| Error::Adapter(format!("emit for user: {err}")))
    }
}
