//! # RabbitMQ Retry Worker
//! Consumes a primary queue and a delayed retry queue, republishing failed messages
//! a bounded number of times before rejecting them for good.

pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod observer;
pub mod publisher;
pub mod retry;
pub mod shutdown;
pub mod topology;
pub mod worker;

// Re-export key components for easy access
pub use config::{BrokerConfig, ConsumerSettings, WorkerConfig, WorkerConfigBuilder};
pub use consumer::{
    apply, lapin_deliveries, Acknowledger, Consumer, ConsumerPolicy, Decision, DeliveryContext,
    FailureAction, Outcome, Settlement, Verdict,
};
pub use error::WorkerError;
pub use handler::{FailurePredicate, TextEquals};
pub use message::{Message, RETRY_MARKER};
pub use observer::{LogObserver, Observer};
pub use publisher::{ChannelPublisher, Outbound, Publish};
pub use retry::{RetryPolicy, RetryState};
pub use shutdown::{ShutdownCoordinator, ShutdownToken};
pub use topology::{provision, BindingConfig, ExchangeConfig, QueueConfig, TopologyDeclarer};
pub use worker::RetryWorker;
