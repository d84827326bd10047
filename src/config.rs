//! Worker settings: broker connection, topology and consumer parameters.
//!
//! Settings are read once at startup from a JSON file shaped like
//!
//! ```json
//! {
//!   "RabbitMQ": { "HostName": "localhost", "Port": 5672, "UserName": "guest" },
//!   "RabbitMQConfigs": [
//!     { "Exchange": { "Name": "medical_reports.created", "Type": "fanout" },
//!       "Queue": { "Name": "medical_reports.created.xpto", "Durable": true } }
//!   ],
//!   "Worker": { "MaxRetries": 3, "RetryDelayMs": 20000 }
//! }
//! ```
//!
//! Broker values can be overridden with `RABBITMQ_HOST`, `RABBITMQ_PORT`,
//! `RABBITMQ_USER`, `RABBITMQ_PASSWORD` and `RABBITMQ_VHOST`.

use crate::consumer::ConsumerPolicy;
use crate::error::WorkerError;
use crate::message::RETRY_MARKER;
use crate::retry::RetryPolicy;
use crate::topology::BindingConfig;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the settings file.
pub const CONFIG_PATH_ENV: &str = "WORKER_CONFIG";
/// Settings file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "appsettings.json";

/// Connection parameters for the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BrokerConfig {
    pub host_name: String,
    pub port: u16,
    pub user_name: String,
    pub password: String,
    pub virtual_host: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            port: 5672,
            user_name: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user_name.clone(),
                    password: self.password.clone(),
                },
                host: self.host_name.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            ..Default::default()
        }
    }

    /// `host:port/vhost`, without credentials, for logs.
    pub fn display_address(&self) -> String {
        format!(
            "{}:{}/{}",
            self.host_name,
            self.port,
            self.virtual_host.trim_start_matches('/')
        )
    }
}

/// Queue names and retry parameters of the two consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConsumerSettings {
    /// Queue fed by the application exchange.
    pub primary_queue: String,
    /// Queue behind the delayed retry exchange.
    pub retry_queue: String,
    /// Exchange both consumers publish failed messages to.
    pub retry_exchange: String,
    pub retry_routing_key: String,
    /// Text that makes a message fail on the primary queue.
    pub failure_text: String,
    /// Appended to the text of a failed message before it is rerouted.
    pub retry_marker: String,
    /// Highest `retry-count` a message may be republished with.
    pub max_retries: u32,
    /// Written to `x-delay` when a retried message has none.
    pub retry_delay_ms: u64,
    /// Prefetch count, and the number of deliveries each consumer handles at once.
    pub prefetch_count: u16,
    /// Interval of the "still running" log line.
    pub heartbeat_secs: u64,
    /// Pause before the binary reconnects after a lost connection.
    pub reconnect_delay_secs: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            primary_queue: "medical_reports.created.xpto".to_string(),
            retry_queue: "medical_reports.retry.xpto".to_string(),
            retry_exchange: "medical_reports.retry.exchange".to_string(),
            retry_routing_key: String::new(),
            failure_text: "error".to_string(),
            retry_marker: RETRY_MARKER.to_string(),
            max_retries: 3,
            retry_delay_ms: 20_000,
            prefetch_count: 10,
            heartbeat_secs: 60,
            reconnect_delay_secs: 5,
        }
    }
}

impl ConsumerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn primary_consumer_policy(&self) -> ConsumerPolicy {
        ConsumerPolicy::primary(
            &self.failure_text,
            &self.retry_marker,
            &self.retry_exchange,
            &self.retry_routing_key,
        )
    }

    /// The retry queue fails on the text the primary consumer produces.
    pub fn retry_consumer_policy(&self) -> ConsumerPolicy {
        ConsumerPolicy::retry(
            &format!("{}{}", self.failure_text, self.retry_marker),
            &self.retry_exchange,
            &self.retry_routing_key,
            self.retry_policy(),
        )
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(rename = "RabbitMQ", default)]
    pub broker: BrokerConfig,
    #[serde(rename = "RabbitMQConfigs", default)]
    pub bindings: Vec<BindingConfig>,
    #[serde(rename = "Worker", default)]
    pub consumers: ConsumerSettings,
}

impl WorkerConfig {
    /// Creates a `WorkerConfigBuilder` for configuring the worker in code.
    ///
    /// # Arguments
    /// * `primary_queue` - The queue the application publishes to.
    /// * `retry_queue` - The queue behind the delayed retry exchange.
    pub fn builder(primary_queue: String, retry_queue: String) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(primary_queue, retry_queue)
    }

    pub fn from_json(json: &str) -> Result<Self, WorkerError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, WorkerError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reads the settings file named by `WORKER_CONFIG` (default `appsettings.json`)
    /// and applies environment overrides.
    pub fn load() -> Result<Self, WorkerError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        log::info!("Loading worker settings from '{}'", path);
        let mut config = Self::from_path(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Replaces broker values with those returned by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("RABBITMQ_HOST") {
            self.broker.host_name = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT") {
            self.broker.port = port.parse().map_err(|_| {
                WorkerError::Config(format!("RABBITMQ_PORT is not a port: '{port}'"))
            })?;
        }
        if let Some(user) = lookup("RABBITMQ_USER") {
            self.broker.user_name = user;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            self.broker.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            self.broker.virtual_host = vhost;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        let consumers = &self.consumers;
        if self.broker.host_name.trim().is_empty() {
            return Err("broker host name is empty".into());
        }
        if consumers.primary_queue.trim().is_empty() || consumers.retry_queue.trim().is_empty() {
            return Err("primary and retry queue names are required".into());
        }
        if consumers.primary_queue == consumers.retry_queue {
            return Err("primary and retry queues must differ".into());
        }
        if consumers.retry_exchange.trim().is_empty() {
            return Err("retry exchange name is required".into());
        }
        if consumers.retry_marker.is_empty() {
            return Err("retry marker must not be empty".into());
        }
        if consumers.prefetch_count == 0 {
            return Err("prefetch count must be at least 1".into());
        }
        if consumers.heartbeat_secs == 0 {
            return Err("heartbeat interval must be at least one second".into());
        }
        Ok(())
    }
}

/// A builder for creating `WorkerConfig` instances without a settings file.
pub struct WorkerConfigBuilder {
    primary_queue: String,
    retry_queue: String,
    broker: Option<BrokerConfig>,
    bindings: Vec<BindingConfig>,
    retry_exchange: Option<String>,
    failure_text: Option<String>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    prefetch_count: Option<u16>,
}

impl WorkerConfigBuilder {
    fn new(primary_queue: String, retry_queue: String) -> Self {
        Self {
            primary_queue,
            retry_queue,
            broker: None,
            bindings: Vec::new(),
            retry_exchange: None,
            failure_text: None,
            max_retries: None,
            retry_delay: None,
            prefetch_count: None,
        }
    }

    /// Sets the broker connection.
    /// Defaults to `guest@localhost:5672/`.
    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Adds an exchange/queue pair to provision at startup.
    pub fn binding(mut self, binding: BindingConfig) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Sets the exchange failed messages are published to.
    /// Defaults to `medical_reports.retry.exchange`.
    pub fn retry_exchange(mut self, exchange: String) -> Self {
        self.retry_exchange = Some(exchange);
        self
    }

    /// Sets the text that makes a message fail. Defaults to `error`.
    pub fn failure_text(mut self, text: String) -> Self {
        self.failure_text = Some(text);
        self
    }

    /// Sets the retry bound. Defaults to 3.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the delay written to `x-delay`. Defaults to 20 seconds.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets the prefetch count (QoS).
    /// Defaults to 10.
    ///
    /// Each consumer handles up to this many deliveries at once.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Builds the `WorkerConfig`, applying defaults for unset options, and
    /// validates it.
    pub fn build(self) -> Result<WorkerConfig, WorkerError> {
        let defaults = ConsumerSettings::default();
        let retry_delay_ms = self
            .retry_delay
            .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(defaults.retry_delay_ms);
        let config = WorkerConfig {
            broker: self.broker.unwrap_or_default(),
            bindings: self.bindings,
            consumers: ConsumerSettings {
                primary_queue: self.primary_queue,
                retry_queue: self.retry_queue,
                retry_exchange: self.retry_exchange.unwrap_or(defaults.retry_exchange),
                failure_text: self.failure_text.unwrap_or(defaults.failure_text),
                max_retries: self.max_retries.unwrap_or(defaults.max_retries),
                retry_delay_ms,
                prefetch_count: self.prefetch_count.unwrap_or(defaults.prefetch_count),
                ..defaults
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FailurePredicate;
    use crate::message::Message;
    use crate::topology::{ExchangeConfig, QueueConfig};
    use std::collections::HashMap;

    const SETTINGS: &str = r#"{
        "RabbitMQ": {
            "HostName": "rabbit", "Port": 5673, "UserName": "worker", "Password": "s3cret"
        },
        "RabbitMQConfigs": [
            {
                "Exchange": { "Name": "medical_reports.created", "Type": "fanout" },
                "Queue": {
                    "Name": "medical_reports.created.xpto", "Durable": true, "RoutingKey": ""
                }
            },
            {
                "Exchange": {
                    "Name": "medical_reports.retry.exchange",
                    "Type": "x-delayed-message",
                    "Arguments": { "x-delayed-type": "fanout" }
                },
                "Queue": { "Name": "medical_reports.retry.xpto", "Durable": true }
            }
        ],
        "Worker": { "MaxRetries": 5, "PrefetchCount": 2 }
    }"#;

    #[test]
    fn parses_settings_with_defaults() {
        let config = WorkerConfig::from_json(SETTINGS).unwrap();

        assert_eq!(config.broker.host_name, "rabbit");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.broker.virtual_host, "/");
        assert_eq!(config.bindings.len(), 2);
        assert_eq!(config.consumers.max_retries, 5);
        assert_eq!(config.consumers.prefetch_count, 2);
        assert_eq!(config.consumers.failure_text, "error");
        assert_eq!(config.consumers.retry_exchange, "medical_reports.retry.exchange");
        assert_eq!(
            config.consumers.retry_policy(),
            RetryPolicy::new(5, Duration::from_secs(20))
        );
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = WorkerConfig::from_json("{}").unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert!(config.bindings.is_empty());
    }

    #[test]
    fn environment_overrides_broker() {
        let mut config = WorkerConfig::from_json(SETTINGS).unwrap();
        let env: HashMap<&str, &str> = [
            ("RABBITMQ_HOST", "broker.internal"),
            ("RABBITMQ_PORT", "5680"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.broker.host_name, "broker.internal");
        assert_eq!(config.broker.port, 5680);
        assert_eq!(config.broker.user_name, "worker");
    }

    #[test]
    fn invalid_port_override_is_rejected() {
        let mut config = WorkerConfig::default();
        let err = config
            .apply_overrides(|key| (key == "RABBITMQ_PORT").then(|| "amqp".to_string()))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn rejects_inconsistent_consumers() {
        let same_queue = r#"{ "Worker": { "PrimaryQueue": "q", "RetryQueue": "q" } }"#;
        assert!(WorkerConfig::from_json(same_queue).is_err());

        let no_prefetch = r#"{ "Worker": { "PrefetchCount": 0 } }"#;
        assert!(WorkerConfig::from_json(no_prefetch).is_err());
    }

    #[test]
    fn uri_carries_credentials_and_vhost() {
        let broker = BrokerConfig {
            virtual_host: "reports".to_string(),
            ..BrokerConfig::default()
        };
        let uri = broker.uri();
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.vhost, "reports");
        assert_eq!(broker.display_address(), "localhost:5672/reports");
    }

    #[test]
    fn retry_consumer_matches_marked_text() {
        let settings = ConsumerSettings::default();
        let policy = settings.retry_consumer_policy();
        assert!(policy.predicate.is_failure(&Message::new("error retry")));
        assert!(!policy.predicate.is_failure(&Message::new("error")));
    }

    #[test]
    fn sample_settings_declare_transient_exchanges() {
        let config = WorkerConfig::from_json(include_str!("../appsettings.json")).unwrap();

        assert_eq!(config.bindings.len(), 2);
        for binding in &config.bindings {
            let exchange = binding.exchange.as_ref().unwrap();
            assert!(!exchange.durable, "exchange '{}' is durable", exchange.name);
            assert!(binding.queue.as_ref().unwrap().durable);
        }
    }

    #[test]
    fn test_worker_config_builder_defaults() {
        let config = WorkerConfig::builder("orders".to_string(), "orders.retry".to_string())
            .build()
            .unwrap();

        assert_eq!(config.broker, BrokerConfig::default());
        assert!(config.bindings.is_empty());
        assert_eq!(config.consumers.primary_queue, "orders");
        assert_eq!(config.consumers.retry_queue, "orders.retry");
        assert_eq!(config.consumers.retry_exchange, "medical_reports.retry.exchange");
        assert_eq!(config.consumers.failure_text, "error");
        assert_eq!(config.consumers.retry_policy(), RetryPolicy::default());
        assert_eq!(config.consumers.prefetch_count, 10);
    }

    #[test]
    fn test_worker_config_builder_custom() {
        let broker = BrokerConfig {
            host_name: "rabbit".to_string(),
            ..BrokerConfig::default()
        };
        let config = WorkerConfig::builder("orders".to_string(), "orders.retry".to_string())
            .broker(broker.clone())
            .binding(BindingConfig::new(
                ExchangeConfig::new("orders", "fanout"),
                QueueConfig::new("orders"),
            ))
            .retry_exchange("orders.delayed".to_string())
            .failure_text("fail".to_string())
            .max_retries(5)
            .retry_delay(Duration::from_secs(2))
            .prefetch_count(4)
            .build()
            .unwrap();

        assert_eq!(config.broker, broker);
        assert_eq!(config.bindings.len(), 1);
        assert_eq!(config.consumers.retry_exchange, "orders.delayed");
        assert_eq!(config.consumers.retry_delay_ms, 2_000);
        assert_eq!(
            config.consumers.retry_policy(),
            RetryPolicy::new(5, Duration::from_secs(2))
        );
        assert_eq!(config.consumers.prefetch_count, 4);
        let retry = config.consumers.retry_consumer_policy();
        assert!(retry.predicate.is_failure(&Message::new("fail retry")));
    }

    #[test]
    fn test_worker_config_builder_validates() {
        let same_queue = WorkerConfig::builder("orders".to_string(), "orders".to_string()).build();
        assert!(same_queue.is_err());

        let no_prefetch = WorkerConfig::builder("orders".to_string(), "orders.retry".to_string())
            .prefetch_count(0)
            .build();
        assert!(matches!(no_prefetch, Err(WorkerError::Config(_))));
    }
}
