//! The outbound publishing channel shared by both consumers.

use crate::error::WorkerError;
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::FieldTable,
    BasicProperties, Channel,
};
use tokio::sync::Mutex;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Option<FieldTable>,
    pub persistent: bool,
}

impl Outbound {
    fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default();
        if let Some(headers) = &self.headers {
            properties = properties.with_headers(headers.clone());
        }
        if self.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        properties
    }
}

/// Capability to publish a message and wait until the broker has taken it.
#[async_trait]
pub trait Publish: Send + Sync {
    /// Returns only once the broker confirmed the message.
    async fn publish(&self, outbound: &Outbound) -> Result<(), WorkerError>;
}

/// Publishes through one channel in confirm mode.
///
/// Publishes are serialized so that concurrent handlers never interleave writes
/// or confirmations on the channel.
pub struct ChannelPublisher {
    channel: Channel,
    lock: Mutex<()>,
}

impl ChannelPublisher {
    /// Switches `channel` to confirm mode and wraps it.
    pub async fn new(channel: Channel) -> Result<Self, WorkerError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        log::debug!("Publisher confirms enabled on channel {}", channel.id());
        Ok(Self {
            channel,
            lock: Mutex::new(()),
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl Publish for ChannelPublisher {
    async fn publish(&self, outbound: &Outbound) -> Result<(), WorkerError> {
        let _guard = self.lock.lock().await;

        let confirmation = self
            .channel
            .basic_publish(
                &outbound.exchange,
                &outbound.routing_key,
                BasicPublishOptions::default(),
                &outbound.payload,
                outbound.properties(),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(WorkerError::PublishNotConfirmed {
                exchange: outbound.exchange.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::AMQPValue;

    #[test]
    fn persistent_message_carries_delivery_mode_and_headers() {
        let mut headers = FieldTable::default();
        headers.insert("retry-count".into(), AMQPValue::LongLongInt(1));
        let outbound = Outbound {
            exchange: "retry".to_string(),
            routing_key: String::new(),
            payload: b"{}".to_vec(),
            headers: Some(headers.clone()),
            persistent: true,
        };

        let properties = outbound.properties();
        assert_eq!(properties.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(properties.headers(), &Some(headers));
    }

    #[test]
    fn plain_message_has_no_properties() {
        let outbound = Outbound {
            exchange: "retry".to_string(),
            routing_key: String::new(),
            payload: b"{}".to_vec(),
            headers: None,
            persistent: false,
        };

        let properties = outbound.properties();
        assert_eq!(properties.delivery_mode(), &None);
        assert_eq!(properties.headers(), &None);
    }
}
