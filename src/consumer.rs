//! The delivery state machine shared by the primary and the retry queue.
//!
//! A [`Consumer`] turns each delivery into a [`Decision`] without touching the
//! broker; [`apply`] then carries the decision out. The two queues differ only in
//! their [`ConsumerPolicy`].

use crate::error::WorkerError;
use crate::handler::{FailurePredicate, TextEquals};
use crate::message::Message;
use crate::observer::Observer;
use crate::publisher::{Outbound, Publish};
use crate::retry::{initialize_headers, RetryPolicy, RetryState};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt, TryStreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::FieldTable,
};
use std::future::Future;
use std::sync::Arc;

/// Final answer for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// What to do with a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ack,
    Nack { requeue: bool },
    /// Publish first, settle the original only once the broker confirmed it.
    Republish { outbound: Outbound, then: Settlement },
}

/// What happened to a delivery, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// Failed on the primary queue and handed to the retry exchange.
    Rerouted,
    RetryScheduled { attempt: u32 },
    Exhausted { attempt: u32 },
    Malformed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    pub outcome: Outcome,
}

impl Verdict {
    fn new(decision: Decision, outcome: Outcome) -> Self {
        Self { decision, outcome }
    }
}

/// Broker metadata and payload of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryContext {
    pub delivery_tag: u64,
    pub headers: Option<FieldTable>,
    pub redelivered: bool,
    pub payload: Vec<u8>,
}

impl DeliveryContext {
    pub fn new(delivery_tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            headers: None,
            redelivered: false,
            payload: payload.into(),
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Separates the data from the handle used to settle the delivery.
    pub fn split(delivery: Delivery) -> (Self, Acker) {
        let Delivery {
            delivery_tag,
            redelivered,
            properties,
            data,
            acker,
            ..
        } = delivery;
        let context = Self {
            delivery_tag,
            headers: properties.headers().clone(),
            redelivered,
            payload: data,
        };
        (context, acker)
    }
}

/// Adapts a lapin subscription to the stream [`Consumer::run`] takes.
pub fn lapin_deliveries(
    consumer: lapin::Consumer,
) -> impl Stream<Item = Result<(DeliveryContext, Acker), WorkerError>> + Send {
    consumer
        .map_ok(DeliveryContext::split)
        .map_err(WorkerError::from)
}

/// Settles a delivery. Taking `self` by value makes a second settlement of the
/// same delivery impossible.
#[async_trait]
pub trait Acknowledger: Send + Sized {
    async fn ack(self) -> Result<(), WorkerError>;
    async fn nack(self, requeue: bool) -> Result<(), WorkerError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(self) -> Result<(), WorkerError> {
        Acker::ack(&self, BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn nack(self, requeue: bool) -> Result<(), WorkerError> {
        Acker::nack(
            &self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await?;
        Ok(())
    }
}

async fn settle<A: Acknowledger>(settlement: Settlement, acker: A) -> Result<(), WorkerError> {
    match settlement {
        Settlement::Ack => acker.ack().await,
        Settlement::Nack { requeue } => acker.nack(requeue).await,
    }
}

/// Carries out a decision.
///
/// When the republish fails the original is returned to its queue, so the message
/// is never lost between the two steps.
pub async fn apply<A: Acknowledger>(
    decision: Decision,
    acker: A,
    publisher: &dyn Publish,
) -> Result<(), WorkerError> {
    match decision {
        Decision::Ack => settle(Settlement::Ack, acker).await,
        Decision::Nack { requeue } => settle(Settlement::Nack { requeue }, acker).await,
        Decision::Republish { outbound, then } => {
            if let Err(e) = publisher.publish(&outbound).await {
                if let Err(nack_err) = acker.nack(true).await {
                    log::error!("Failed to requeue delivery after publish error: {}", nack_err);
                }
                return Err(e);
            }
            settle(then, acker).await
        }
    }
}

/// What a consumer does with a message its predicate flags as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Mark the text, publish the re-encoded message, drop the original.
    Reroute {
        exchange: String,
        routing_key: String,
        marker: String,
    },
    /// Republish the original bytes with an incremented `retry-count` until the
    /// bound is passed, then reject.
    Retry {
        exchange: String,
        routing_key: String,
        policy: RetryPolicy,
    },
}

/// Parameters that make a consumer a primary or a retry consumer.
#[derive(Clone)]
pub struct ConsumerPolicy {
    pub predicate: Arc<dyn FailurePredicate>,
    pub on_failure: FailureAction,
}

impl ConsumerPolicy {
    pub fn new(predicate: Arc<dyn FailurePredicate>, on_failure: FailureAction) -> Self {
        Self {
            predicate,
            on_failure,
        }
    }

    /// Messages whose text is `failure_text` go to `retry_exchange` with `marker`
    /// appended.
    pub fn primary(
        failure_text: &str,
        marker: &str,
        retry_exchange: &str,
        routing_key: &str,
    ) -> Self {
        Self::new(
            Arc::new(TextEquals::new(failure_text)),
            FailureAction::Reroute {
                exchange: retry_exchange.to_string(),
                routing_key: routing_key.to_string(),
                marker: marker.to_string(),
            },
        )
    }

    /// Messages whose text is `failure_text` are retried through `retry_exchange`.
    pub fn retry(
        failure_text: &str,
        retry_exchange: &str,
        routing_key: &str,
        policy: RetryPolicy,
    ) -> Self {
        Self::new(
            Arc::new(TextEquals::new(failure_text)),
            FailureAction::Retry {
                exchange: retry_exchange.to_string(),
                routing_key: routing_key.to_string(),
                policy,
            },
        )
    }
}

/// One subscription: decides, applies and reports.
pub struct Consumer {
    name: String,
    queue: String,
    policy: ConsumerPolicy,
    observer: Arc<dyn Observer>,
}

impl Consumer {
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        policy: ConsumerPolicy,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            policy,
            observer,
        }
    }

    /// Short name used in consumer tags and log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue this consumer subscribes to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    /// Computes the decision for one delivery. Pure: no broker call is made.
    pub fn decide(&self, context: &DeliveryContext) -> Verdict {
        let mut message = match Message::decode(&context.payload) {
            Ok(message) => message,
            Err(e) => {
                return Verdict::new(
                    Decision::Nack { requeue: false },
                    Outcome::Malformed {
                        reason: e.to_string(),
                    },
                )
            }
        };

        match &self.policy.on_failure {
            FailureAction::Reroute {
                exchange,
                routing_key,
                marker,
            } => {
                if !self.policy.predicate.is_failure(&message) {
                    return Verdict::new(Decision::Ack, Outcome::Processed);
                }
                message.mark(marker);
                match message.encode() {
                    Ok(payload) => Verdict::new(
                        Decision::Republish {
                            outbound: Outbound {
                                exchange: exchange.clone(),
                                routing_key: routing_key.clone(),
                                payload,
                                headers: None,
                                persistent: false,
                            },
                            then: Settlement::Nack { requeue: false },
                        },
                        Outcome::Rerouted,
                    ),
                    Err(e) => Verdict::new(
                        Decision::Nack { requeue: false },
                        Outcome::Malformed {
                            reason: e.to_string(),
                        },
                    ),
                }
            }
            FailureAction::Retry {
                exchange,
                routing_key,
                policy,
            } => {
                let mut headers = initialize_headers(context.headers.as_ref(), policy);
                if !self.policy.predicate.is_failure(&message) {
                    return Verdict::new(Decision::Ack, Outcome::Processed);
                }

                let next = RetryState::from_headers(&headers).on_failure();
                if !policy.should_retry(next) {
                    return Verdict::new(
                        Decision::Nack { requeue: false },
                        Outcome::Exhausted { attempt: next.count },
                    );
                }

                next.write_to(&mut headers);
                Verdict::new(
                    Decision::Republish {
                        outbound: Outbound {
                            exchange: exchange.clone(),
                            routing_key: routing_key.clone(),
                            payload: context.payload.clone(),
                            headers: Some(headers),
                            persistent: true,
                        },
                        then: Settlement::Ack,
                    },
                    Outcome::RetryScheduled { attempt: next.count },
                )
            }
        }
    }

    /// Decides, settles the delivery and reports the outcome.
    pub async fn handle<A: Acknowledger>(
        &self,
        context: &DeliveryContext,
        acker: A,
        publisher: &dyn Publish,
    ) -> Result<Outcome, WorkerError> {
        let verdict = self.decide(context);
        apply(verdict.decision, acker, publisher).await?;
        self.report(context, &verdict.outcome);
        Ok(verdict.outcome)
    }

    fn report(&self, context: &DeliveryContext, outcome: &Outcome) {
        let tag = context.delivery_tag;
        match outcome {
            Outcome::Processed => self.observer.info(&format!(
                "Message processed successfully. Tag: {}, redelivered: {}",
                tag, context.redelivered
            )),
            Outcome::Rerouted => self.observer.warn(&format!(
                "Message failed ({}), sent to the retry exchange. Tag: {}",
                self.policy.predicate.name(),
                tag
            )),
            Outcome::RetryScheduled { attempt } => self.observer.warn(&format!(
                "Message failed again, republished for retry. Attempt: {}, Tag: {}",
                attempt, tag
            )),
            Outcome::Exhausted { attempt } => self.observer.error(&format!(
                "Message rejected after exceeding retry attempts. Attempt: {}, Tag: {}",
                attempt, tag
            )),
            Outcome::Malformed { reason } => self.observer.error(&format!(
                "Rejected unreadable message. Tag: {}, Error: {}",
                tag, reason
            )),
        }
    }

    async fn process<A: Acknowledger>(
        &self,
        context: DeliveryContext,
        acker: A,
        publisher: &dyn Publish,
    ) {
        if let Err(e) = self.handle(&context, acker, publisher).await {
            self.observer.error(&format!(
                "Failed to settle delivery. Tag: {}, Error: {}",
                context.delivery_tag, e
            ));
        }
    }

    /// Handles deliveries until `stop` resolves or the subscription fails.
    ///
    /// Up to `concurrency` deliveries are handled at once. After `stop` no new
    /// delivery is taken and the ones in flight are finished before returning.
    /// Deliveries still queued in `deliveries` are left unsettled.
    pub async fn run<S, A, F>(
        self: Arc<Self>,
        deliveries: S,
        publisher: Arc<dyn Publish>,
        concurrency: usize,
        stop: F,
    ) -> Result<(), WorkerError>
    where
        S: Stream<Item = Result<(DeliveryContext, A), WorkerError>> + Send,
        A: Acknowledger,
        F: Future<Output = ()> + Send,
    {
        log::info!(
            "Consumer '{}' waiting for messages on queue '{}'",
            self.name,
            self.queue
        );

        deliveries
            .take_until(stop)
            .try_for_each_concurrent(concurrency.max(1), |(context, acker)| {
                let consumer = Arc::clone(&self);
                let publisher = Arc::clone(&publisher);
                async move {
                    consumer.process(context, acker, publisher.as_ref()).await;
                    Ok(())
                }
            })
            .await?;

        log::info!("Consumer '{}' stopped", self.name);
        Ok(())
    }
}
