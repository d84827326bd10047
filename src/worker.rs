//! Runs the primary and the retry consumer against one broker connection.

use crate::config::WorkerConfig;
use crate::consumer::{lapin_deliveries, Consumer};
use crate::error::WorkerError;
use crate::observer::LogObserver;
use crate::publisher::{ChannelPublisher, Publish};
use crate::shutdown::{ShutdownCoordinator, ShutdownToken};
use crate::topology;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};

const PRIMARY: &str = "primary";
const RETRY: &str = "retry";

/// Reply code sent when closing channels and the connection.
const REPLY_SUCCESS: u16 = 200;

/// The worker: provisions the topology, then consumes the primary and the retry
/// queue until shutdown.
pub struct RetryWorker {
    config: WorkerConfig,
}

impl RetryWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn primary_consumer(&self) -> Consumer {
        let settings = &self.config.consumers;
        Consumer::new(
            PRIMARY,
            settings.primary_queue.clone(),
            settings.primary_consumer_policy(),
            LogObserver::shared("retry_worker::primary"),
        )
    }

    pub fn retry_consumer(&self) -> Consumer {
        let settings = &self.config.consumers;
        Consumer::new(
            RETRY,
            settings.retry_queue.clone(),
            settings.retry_consumer_policy(),
            LogObserver::shared("retry_worker::retry"),
        )
    }

    /// Connects, provisions the topology and consumes until `shutdown` is triggered.
    ///
    /// Returns an error when startup fails or when a subscription ends on its own,
    /// for example because the connection was lost.
    pub async fn run(&self, shutdown: &ShutdownCoordinator) -> Result<(), WorkerError> {
        let broker = &self.config.broker;
        log::info!("Connecting to RabbitMQ at {}...", broker.display_address());
        let connection =
            Connection::connect_uri(broker.uri(), ConnectionProperties::default()).await?;

        let topology_channel = connection.create_channel().await?;
        let declared = topology::provision(&topology_channel, &self.config.bindings).await?;
        log::info!("Topology ready: {} binding(s) declared", declared);

        let publisher = Arc::new(ChannelPublisher::new(connection.create_channel().await?).await?);

        let consume_channel = connection.create_channel().await?;
        let prefetch = self.config.consumers.prefetch_count;
        consume_channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        log::info!("QoS prefetch count set to {}", prefetch);

        // Ends the subscriptions of this run only; the caller's coordinator stays untouched.
        let run_stop = ShutdownCoordinator::new();

        let mut primary = self
            .spawn_consumer(
                self.primary_consumer(),
                &consume_channel,
                publisher.clone(),
                shutdown.token(),
                run_stop.token(),
            )
            .await?;
        let mut retry = self
            .spawn_consumer(
                self.retry_consumer(),
                &consume_channel,
                publisher.clone(),
                shutdown.token(),
                run_stop.token(),
            )
            .await?;

        let first_exit = tokio::select! {
            _ = shutdown.hold() => None,
            joined = &mut primary => Some((PRIMARY, joined)),
            joined = &mut retry => Some((RETRY, joined)),
        };
        run_stop.trigger();

        let result = match first_exit {
            None => {
                log::info!("Waiting for in-flight deliveries to finish...");
                let (primary_result, retry_result) = tokio::join!(primary, retry);
                consumer_result(PRIMARY, primary_result).and(consumer_result(RETRY, retry_result))
            }
            Some((name, joined)) => {
                let other_name = if name == PRIMARY { RETRY } else { PRIMARY };
                let other = if name == PRIMARY { retry.await } else { primary.await };
                let first_result = consumer_result(name, joined);
                let other_result = consumer_result(other_name, other);
                if shutdown.is_triggered() {
                    first_result.and(other_result)
                } else {
                    if let Err(e) = other_result {
                        log::error!("{}", e);
                    }
                    Err(first_result.err().unwrap_or_else(|| WorkerError::ConsumerStopped {
                        consumer: name.to_string(),
                        reason: "subscription ended unexpectedly".to_string(),
                    }))
                }
            }
        };

        for channel in [&consume_channel, publisher.channel(), &topology_channel] {
            close_channel(channel).await;
        }
        if let Err(e) = connection.close(REPLY_SUCCESS, "worker stopped").await {
            log::warn!("Failed to close connection cleanly: {}", e);
        }
        log::info!("Disconnected from RabbitMQ");

        result
    }

    async fn spawn_consumer(
        &self,
        consumer: Consumer,
        channel: &Channel,
        publisher: Arc<ChannelPublisher>,
        global: ShutdownToken,
        local: ShutdownToken,
    ) -> Result<JoinHandle<Result<(), WorkerError>>, WorkerError> {
        let tag = format!("{}_{}_consumer", consumer.queue(), consumer.name());
        let deliveries = channel
            .basic_consume(
                consumer.queue(),
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        log::info!(
            "Consumer started with tag '{}' on queue '{}'",
            deliveries.tag().as_str(),
            consumer.queue()
        );

        let concurrency = usize::from(self.config.consumers.prefetch_count);
        let publisher: Arc<dyn Publish> = publisher;
        let stop = stop_signal(global, local);
        Ok(tokio::spawn(Arc::new(consumer).run(
            lapin_deliveries(deliveries),
            publisher,
            concurrency,
            stop,
        )))
    }
}

async fn stop_signal(mut global: ShutdownToken, mut local: ShutdownToken) {
    tokio::select! {
        _ = global.cancelled() => {}
        _ = local.cancelled() => {}
    }
}

fn consumer_result(
    name: &str,
    joined: Result<Result<(), WorkerError>, JoinError>,
) -> Result<(), WorkerError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(WorkerError::ConsumerStopped {
            consumer: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

async fn close_channel(channel: &Channel) {
    if let Err(e) = channel.close(REPLY_SUCCESS, "worker stopped").await {
        log::warn!("Failed to close channel {}: {}", channel.id(), e);
    }
}
