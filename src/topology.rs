//! Exchange, queue and binding declarations loaded from configuration.

use crate::error::WorkerError;
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, ShortString},
    Channel, ExchangeKind,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An exchange to declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExchangeConfig {
    #[serde(default)]
    pub name: String,
    /// `direct`, `fanout`, `topic`, `headers` or a plugin type such as `x-delayed-message`.
    #[serde(default, rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

impl ExchangeConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            durable: false,
            auto_delete: false,
            arguments: BTreeMap::new(),
        }
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        match self.kind.to_ascii_lowercase().as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            _ => ExchangeKind::Custom(self.kind.clone()),
        }
    }
}

/// A queue to declare and bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    /// Inactive entries are left out of provisioning.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            routing_key: String::new(),
            arguments: BTreeMap::new(),
            active: true,
        }
    }
}

/// One exchange, one queue and the binding between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BindingConfig {
    #[serde(default)]
    pub exchange: Option<ExchangeConfig>,
    #[serde(default)]
    pub queue: Option<QueueConfig>,
}

impl BindingConfig {
    pub fn new(exchange: ExchangeConfig, queue: QueueConfig) -> Self {
        Self {
            exchange: Some(exchange),
            queue: Some(queue),
        }
    }

    pub fn is_active(&self) -> bool {
        self.queue.as_ref().map_or(true, |queue| queue.active)
    }

    /// Returns both halves of the declaration, or why it cannot be declared.
    pub fn validate(&self) -> Result<(&ExchangeConfig, &QueueConfig), WorkerError> {
        let exchange = self
            .exchange
            .as_ref()
            .ok_or_else(|| WorkerError::invalid_topology("binding has no exchange"))?;
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| WorkerError::invalid_topology("binding has no queue"))?;

        if exchange.name.trim().is_empty() {
            return Err(WorkerError::invalid_topology(format!(
                "exchange for queue '{}' has no name",
                queue.name
            )));
        }
        if exchange.kind.trim().is_empty() {
            return Err(WorkerError::invalid_topology(format!(
                "exchange '{}' has no type",
                exchange.name
            )));
        }
        if queue.name.trim().is_empty() {
            return Err(WorkerError::invalid_topology(format!(
                "queue bound to exchange '{}' has no name",
                exchange.name
            )));
        }
        Ok((exchange, queue))
    }
}

/// Broker operations needed to set up the topology.
///
/// Every operation must be a no-op when the entity already exists with the same
/// definition.
#[async_trait]
pub trait TopologyDeclarer: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<(), WorkerError>;
    async fn declare_queue(&self, queue: &QueueConfig) -> Result<(), WorkerError>;
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), WorkerError>;
}

#[async_trait]
impl TopologyDeclarer for Channel {
    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<(), WorkerError> {
        self.exchange_declare(
            &exchange.name,
            exchange.exchange_kind(),
            ExchangeDeclareOptions {
                durable: exchange.durable,
                auto_delete: exchange.auto_delete,
                ..Default::default()
            },
            to_field_table(&exchange.arguments),
        )
        .await
        .map_err(|e| {
            log::error!(
                "Failed to declare exchange '{}' of type '{}': {}",
                exchange.name,
                exchange.kind,
                e
            );
            e
        })?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<(), WorkerError> {
        self.queue_declare(
            &queue.name,
            QueueDeclareOptions {
                durable: queue.durable,
                exclusive: queue.exclusive,
                auto_delete: queue.auto_delete,
                ..Default::default()
            },
            to_field_table(&queue.arguments),
        )
        .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), WorkerError> {
        self.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }
}

/// Declares every active binding.
///
/// All entries are validated before anything is declared, so a malformed entry
/// never leaves a half-provisioned topology behind.
pub async fn provision<D>(declarer: &D, configs: &[BindingConfig]) -> Result<usize, WorkerError>
where
    D: TopologyDeclarer + ?Sized,
{
    let mut pending = Vec::with_capacity(configs.len());
    for config in configs {
        if !config.is_active() {
            log::debug!("Skipping inactive binding {:?}", config.queue.as_ref().map(|q| &q.name));
            continue;
        }
        pending.push(config.validate()?);
    }

    for (exchange, queue) in &pending {
        declarer.declare_exchange(exchange).await?;
        declarer.declare_queue(queue).await?;
        declarer
            .bind_queue(&queue.name, &exchange.name, &queue.routing_key)
            .await?;
        log::info!(
            "Queue '{}' bound to exchange '{}' ({}) with routing key '{}'",
            queue.name,
            exchange.name,
            exchange.kind,
            queue.routing_key
        );
    }

    Ok(pending.len())
}

/// Converts string arguments to AMQP values. Integer and boolean literals keep
/// their type so that arguments like `x-message-ttl` are accepted by the broker.
pub fn to_field_table(arguments: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = if let Ok(number) = value.parse::<i64>() {
            AMQPValue::LongLongInt(number)
        } else if let Ok(flag) = value.parse::<bool>() {
            AMQPValue::Boolean(flag)
        } else {
            AMQPValue::LongString(value.clone().into())
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}
