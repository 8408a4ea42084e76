//! Publish/subscribe transport for event ingestion and fan-out.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

pub const METADATA_TENANT_ID: &str = "tenant_id";
pub const METADATA_ENVIRONMENT_ID: &str = "environment_id";
pub const METADATA_PARTITION_KEY: &str = "partition_key";
pub const METADATA_RETRY_COUNT: &str = "retry_count";

/// A transport message: opaque payload plus string metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub uuid: String,
    pub metadata: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
            payload,
        }
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Delivery attempts already made for this message.
    pub fn retry_count(&self) -> u32 {
        self.metadata_value(METADATA_RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), AppError>;

    /// Messages published to `topic` after the call returns.
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Message>, AppError>;
}

// ===== In-memory transport =====

const IN_MEMORY_CAPACITY: usize = 1024;

/// Broadcast-channel transport that also records every published message.
#[derive(Clone, Default)]
pub struct InMemoryPubSub {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>,
    published: Arc<Mutex<Vec<(String, Message)>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<Message>, AppError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("pubsub topic lock poisoned")))?;
        Ok(topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(IN_MEMORY_CAPACITY).0)
            .clone())
    }

    /// Messages published to `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.published
            .lock()
            .map(|published| {
                published
                    .iter()
                    .filter(|(t, _)| t == topic)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), AppError> {
        if let Ok(mut published) = self.published.lock() {
            published.push((topic.to_string(), message.clone()));
        }
        // No subscribers is not an error.
        let _ = self.sender(topic)?.send(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Message>, AppError> {
        let receiver = self.sender(topic)?.subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "In-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ===== Redis transport =====

/// Wire form of [`Message`] on a Redis channel.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    uuid: String,
    metadata: HashMap<String, String>,
    payload: String,
}

impl Envelope {
    fn encode(message: &Message) -> Result<String, AppError> {
        let envelope = Envelope {
            uuid: message.uuid.clone(),
            metadata: message.metadata.clone(),
            payload: hex::encode(&message.payload),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    fn decode(raw: &[u8]) -> Option<Message> {
        let envelope: Envelope = serde_json::from_slice(raw).ok()?;
        Some(Message {
            uuid: envelope.uuid,
            metadata: envelope.metadata,
            payload: hex::decode(envelope.payload).ok()?,
        })
    }
}

/// Redis PUBLISH/SUBSCRIBE transport.
#[derive(Clone)]
pub struct RedisPubSub {
    client: Client,
    manager: ConnectionManager,
}

impl RedisPubSub {
    pub async fn new(url: &str) -> Result<Self, AppError> {
        info!("Connecting to Redis");
        let client = Client::open(url)?;
        // ConnectionManager reconnects automatically
        let manager = client.get_connection_manager().await?;
        info!("Successfully connected to Redis");
        Ok(Self { client, manager })
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let body = Envelope::encode(&message)?;
        let _: i64 = conn.publish(topic, body).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Message>, AppError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        info!(topic = %topic, "Subscribed to Redis channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: Vec<u8> = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to read Redis message payload");
                    return None;
                }
            };
            let message = Envelope::decode(&payload);
            if message.is_none() {
                warn!(channel = %msg.get_channel_name(), "Dropping undecodable Redis message");
            }
            message
        });
        Ok(stream.boxed())
    }
}
