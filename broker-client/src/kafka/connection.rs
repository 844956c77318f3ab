use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::kafka::rebalance_listener::{
    rebalance_channel, RebalanceEvent, RebalanceEventReceiver, RebalanceEventSender,
};
use crate::kafka::types::{PartitionKey, Record};
use crate::metrics_consts::POLL_ERRORS;

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Conditions a consumer connection reports to its consumption loop.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The coordinator rejected a commit because group membership changed
    #[error("commit rejected, group membership changed: {0}")]
    CommitConflict(String),
    #[error("consumer group rebalance in progress")]
    RebalanceInProgress,
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// The client was woken up or cancelled, normally on shutdown
    #[error("consumer was woken up")]
    Wakeup,
    #[error("kafka error: {0}")]
    Kafka(KafkaError),
}

impl ConnectionError {
    /// Classify an error returned by a synchronous commit.
    pub fn from_commit_error(e: KafkaError) -> Self {
        match &e {
            KafkaError::ConsumerCommit(code) => match code {
                RDKafkaErrorCode::RebalanceInProgress
                | RDKafkaErrorCode::IllegalGeneration
                | RDKafkaErrorCode::UnknownMemberId
                | RDKafkaErrorCode::FencedInstanceId
                | RDKafkaErrorCode::AssignmentLost => ConnectionError::CommitConflict(code.to_string()),
                RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut => {
                    ConnectionError::Timeout(code.to_string())
                }
                _ => ConnectionError::Kafka(e),
            },
            KafkaError::Canceled => ConnectionError::Wakeup,
            _ => ConnectionError::Kafka(e),
        }
    }
}

/// One consumer-group membership with a topic subscription.
///
/// Not safe for concurrent use; each consumption loop owns exactly one.
#[async_trait]
pub trait ConsumerConnection: Send {
    /// Wait up to `timeout` for at most `max_records` records. An empty batch is not an error.
    async fn poll_batch(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, ConnectionError>;

    /// Synchronously commit the given next-offsets-to-consume for the group.
    fn commit_sync(&mut self, next_offsets: &[(PartitionKey, i64)]) -> Result<(), ConnectionError>;

    /// Move the read cursor of a partition so the next poll starts at `offset`.
    fn seek(&mut self, partition: &PartitionKey, offset: i64) -> Result<(), ConnectionError>;

    /// Leave the group and release the connection.
    fn close(&mut self);
}

/// Forwards coordinator callbacks to the consumption loop as `RebalanceEvent`s.
///
/// Callbacks run inside librdkafka's poll, so this only logs and sends;
/// all bookkeeping happens on the loop's task.
pub struct LoopConsumerContext {
    rebalance_tx: RebalanceEventSender,
}

impl LoopConsumerContext {
    pub fn new(rebalance_tx: RebalanceEventSender) -> Self {
        Self { rebalance_tx }
    }

    fn forward(&self, event: RebalanceEvent) {
        if let Err(e) = self.rebalance_tx.send(event) {
            error!("Failed to forward rebalance event to consumption loop: {}", e);
        }
    }
}

fn partition_keys(partitions: &TopicPartitionList) -> Vec<PartitionKey> {
    partitions
        .elements()
        .into_iter()
        .map(PartitionKey::from)
        .collect()
}

impl ClientContext for LoopConsumerContext {}

impl ConsumerContext for LoopConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Pre-rebalance: revoking {} partitions", partitions.count());
                self.forward(RebalanceEvent::Revoke(partition_keys(partitions)));
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!("Post-rebalance: assigned {} partitions", partitions.count());
                self.forward(RebalanceEvent::Assign(partition_keys(partitions)));
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Offset commit callback reported failure: {}", e);
            }
        }
    }
}

/// rdkafka-backed consumer connection, subscribed to a single topic.
pub struct KafkaConnection {
    consumer: StreamConsumer<LoopConsumerContext>,
    topic: String,
    closed: bool,
    // terminal error held back so the records polled before it could be returned
    pending_error: Option<ConnectionError>,
}

impl KafkaConnection {
    /// Create the consumer and subscribe. The returned receiver carries the
    /// rebalance notifications for this membership.
    pub fn connect(config: &ClientConfig, topic: &str) -> Result<(Self, RebalanceEventReceiver)> {
        let (tx, rx) = rebalance_channel();

        info!(topic = topic, "Connecting consumer to Kafka");
        let consumer: StreamConsumer<LoopConsumerContext> = config
            .create_with_context(LoopConsumerContext::new(tx))
            .context("Failed to create Kafka consumer")?;

        let err_msg = format!("Failed to subscribe to topic: {topic}");
        consumer.subscribe(&[topic]).context(err_msg)?;

        Ok((
            Self {
                consumer,
                topic: topic.to_string(),
                closed: false,
                pending_error: None,
            },
            rx,
        ))
    }

    /// Log and count a poll error. Transient errors back off and return None;
    /// terminal ones are returned for the loop to act on.
    async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<ConnectionError> {
        match &e {
            KafkaError::MessageConsumption(code) => match code {
                RDKafkaErrorCode::PartitionEOF => {
                    metrics::counter!(POLL_ERRORS, &[("level", "info"), ("error", "partition_eof")])
                        .increment(1);
                    None
                }
                RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut => {
                    warn!("Poll timed out: {code:?}");
                    metrics::counter!(POLL_ERRORS, &[("level", "fatal"), ("error", "timeout")])
                        .increment(1);
                    Some(ConnectionError::Timeout(code.to_string()))
                }
                RDKafkaErrorCode::RebalanceInProgress => {
                    warn!("Rebalance in progress reported while polling");
                    metrics::counter!(
                        POLL_ERRORS,
                        &[("level", "warn"), ("error", "rebalance_in_progress")]
                    )
                    .increment(1);
                    Some(ConnectionError::RebalanceInProgress)
                }
                _ => {
                    warn!("Kafka consumer error: {code:?}");
                    metrics::counter!(POLL_ERRORS, &[("level", "warn"), ("error", "consumer")])
                        .increment(1);
                    sleep(Duration::from_millis(100 * current_count.min(10))).await;
                    None
                }
            },

            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                metrics::counter!(POLL_ERRORS, &[("level", "fatal"), ("error", "consumer")])
                    .increment(1);
                Some(ConnectionError::Kafka(e))
            }

            // Connection issues
            KafkaError::Global(code) => match code {
                RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure => {
                    warn!("Broker connection lost: {code:?} - waiting for reconnect");
                    metrics::counter!(POLL_ERRORS, &[("level", "warn"), ("error", "transport")])
                        .increment(1);
                    sleep(Duration::from_secs(current_count.min(5))).await;
                    None
                }
                RDKafkaErrorCode::Authentication => {
                    error!("Authentication failed: {code:?}");
                    metrics::counter!(
                        POLL_ERRORS,
                        &[("level", "fatal"), ("error", "authentication")]
                    )
                    .increment(1);
                    Some(ConnectionError::Kafka(e))
                }
                _ => {
                    warn!("Global Kafka error: {code:?}");
                    metrics::counter!(POLL_ERRORS, &[("level", "warn"), ("error", "global")])
                        .increment(1);
                    sleep(Duration::from_millis(500 * current_count.min(6))).await;
                    None
                }
            },

            // Shutdown signal
            KafkaError::Canceled => {
                info!("Consumer canceled - shutting down");
                metrics::counter!(POLL_ERRORS, &[("level", "info"), ("error", "canceled")])
                    .increment(1);
                Some(ConnectionError::Wakeup)
            }

            _ => {
                error!("Unexpected error: {:?}", e);
                metrics::counter!(POLL_ERRORS, &[("level", "warn"), ("error", "unexpected")])
                    .increment(1);
                sleep(Duration::from_millis(100 * current_count.min(10))).await;
                None
            }
        }
    }
}

/// Collect records until the batch is full or the deadline passes.
///
/// A terminal error ends the batch early. Records collected before it are
/// returned and the error is parked in `pending` for the next call, since
/// they are already off the client's queue and would otherwise be lost.
async fn fill_batch<F, Fut>(
    mut next: F,
    max_records: usize,
    deadline: Instant,
    pending: &mut Option<ConnectionError>,
) -> Result<Vec<Record>, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KafkaResult<Record>>,
{
    if let Some(e) = pending.take() {
        return Err(e);
    }

    let mut batch = Vec::with_capacity(max_records.min(1024));
    let mut kafka_error_count = 0;

    while batch.len() < max_records {
        let e = match timeout_at(deadline, next()).await {
            // Batch window closed before the batch filled up
            Err(_) => break,
            Ok(Ok(record)) => {
                batch.push(record);
                kafka_error_count = 0;
                continue;
            }
            Ok(Err(e)) => e,
        };

        kafka_error_count += 1;
        if let Some(terminal) = KafkaConnection::handle_kafka_error(e, kafka_error_count).await {
            if batch.is_empty() {
                return Err(terminal);
            }
            warn!(
                records = batch.len(),
                "Returning partial batch, reporting {terminal} on the next poll"
            );
            *pending = Some(terminal);
            break;
        }
    }

    Ok(batch)
}

#[async_trait]
impl ConsumerConnection for KafkaConnection {
    async fn poll_batch(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, ConnectionError> {
        let consumer = &self.consumer;
        fill_batch(
            move || async move {
                consumer
                    .recv()
                    .await
                    .map(|message| Record::from_borrowed_message(&message))
            },
            max_records,
            Instant::now() + timeout,
            &mut self.pending_error,
        )
        .await
    }

    fn commit_sync(&mut self, next_offsets: &[(PartitionKey, i64)]) -> Result<(), ConnectionError> {
        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in next_offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition(),
                Offset::Offset(*next_offset),
            )
            .map_err(ConnectionError::Kafka)?;
        }

        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(ConnectionError::from_commit_error)
    }

    fn seek(&mut self, partition: &PartitionKey, offset: i64) -> Result<(), ConnectionError> {
        self.consumer
            .seek(
                partition.topic(),
                partition.partition(),
                Offset::Offset(offset),
                SEEK_TIMEOUT,
            )
            .map_err(ConnectionError::Kafka)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.consumer.unsubscribe();
        self.closed = true;
        info!(topic = self.topic.as_str(), "Consumer connection closed");
    }
}
