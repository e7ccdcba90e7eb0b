use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

use crate::backoff::BackoffError;

pub mod mqtt;

pub use mqtt::{MqttSettings, MqttTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT client rejected the request: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("transport is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("broker refused the connection: {0}")]
    Refused(String),

    #[error("could not reach the broker after {attempts} attempt(s); last error: {last}")]
    Exhausted {
        attempts: u32,
        last: String,
        #[source]
        source: BackoffError,
    },

    #[error("failed to subscribe to topic '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Outbound side of the pub/sub channel.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
}

/// Receives every message delivered on the subscribed topic.
///
/// Called from the transport's background task; implementations must not
/// block.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Handler for clients that only publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreInbound;

impl InboundHandler for IgnoreInbound {
    fn on_message(&self, _topic: &str, _payload: &[u8]) {}
}
