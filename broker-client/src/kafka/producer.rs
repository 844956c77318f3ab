use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{DeliveryResult, Message};
use rdkafka::producer::{BaseRecord, Producer, ProducerContext, ThreadedProducer};
use rdkafka::ClientContext;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::{KafkaConfig, ProducerConfig};
use crate::kafka::config::ProducerConfigBuilder;
use crate::metrics_consts::{PRODUCER_BUFFER_FULL, PRODUCER_SENDS};

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_BUFFER_FULL_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Error)]
pub enum ProduceError {
    #[error("send buffer is full")]
    BufferFull,
    #[error("kafka error: {0}")]
    Kafka(KafkaError),
    #[error("delivery confirmation was dropped before it ran")]
    Canceled,
}

impl ProduceError {
    pub fn from_enqueue_error(e: KafkaError) -> Self {
        match e {
            KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => ProduceError::BufferFull,
            _ => ProduceError::Kafka(e),
        }
    }
}

/// Where the broker wrote a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReceipt {
    /// Synchronous send: the broker confirmed the write
    Delivered(Delivery),
    /// Asynchronous send: the record is buffered, confirmation comes later
    Enqueued,
}

/// Callback run once with the broker's verdict on one enqueued record.
pub struct DeliveryHandler(Box<dyn FnOnce(Result<Delivery, ProduceError>) + Send + Sync>);

impl DeliveryHandler {
    pub fn new(f: impl FnOnce(Result<Delivery, ProduceError>) + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn complete(self, result: Result<Delivery, ProduceError>) {
        (self.0)(result)
    }
}

/// The enqueue seam of a producer connection.
///
/// `enqueue` must not block. When the send buffer has no room it hands the
/// handler back with [`ProduceError::BufferFull`] so the caller can retry.
/// Handlers of accepted records run on a thread or task owned by the
/// connection, never on the caller's.
pub trait SendConnection: Send + Sync {
    fn enqueue(
        &self,
        topic: &str,
        payload: &str,
        handler: DeliveryHandler,
    ) -> Result<(), (ProduceError, DeliveryHandler)>;

    fn flush(&self, timeout: Duration) -> Result<(), ProduceError>;
}

/// Routes librdkafka delivery reports to the handler registered with each record.
pub struct KafkaDeliveryContext;

impl ClientContext for KafkaDeliveryContext {}

impl ProducerContext for KafkaDeliveryContext {
    type DeliveryOpaque = Box<DeliveryHandler>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, handler: Self::DeliveryOpaque) {
        let result = match delivery_result {
            Ok(message) => Ok(Delivery {
                partition: message.partition(),
                offset: message.offset(),
            }),
            Err((e, _)) => Err(ProduceError::Kafka(e.clone())),
        };
        handler.complete(result);
    }
}

impl SendConnection for ThreadedProducer<KafkaDeliveryContext> {
    fn enqueue(
        &self,
        topic: &str,
        payload: &str,
        handler: DeliveryHandler,
    ) -> Result<(), (ProduceError, DeliveryHandler)> {
        let record: BaseRecord<'_, (), str, Box<DeliveryHandler>> =
            BaseRecord::with_opaque_to(topic, Box::new(handler)).payload(payload);

        self.send(record).map_err(|(e, record)| {
            (
                ProduceError::from_enqueue_error(e),
                *record.delivery_opaque,
            )
        })
    }

    fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        Producer::flush(self, timeout).map_err(ProduceError::Kafka)
    }
}

#[derive(Debug, Default)]
pub struct ProducerStats {
    enqueued: AtomicU64,
    confirmed: AtomicU64,
    failed: AtomicU64,
}

impl ProducerStats {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Sends string payloads to one topic.
///
/// Batching, linger and acknowledgments are properties of the connection. The
/// client decides whether a caller waits for the broker's confirmation
/// (synchronous) or only for the record to be buffered (asynchronous). In
/// both modes a full buffer makes `send` wait for space rather than fail.
pub struct ProducerClient<S: SendConnection = ThreadedProducer<KafkaDeliveryContext>> {
    connection: S,
    topic: String,
    async_calls: bool,
    buffer_full_backoff: Duration,
    stats: Arc<ProducerStats>,
}

impl ProducerClient {
    pub fn connect(
        kafka_config: &KafkaConfig,
        producer_config: &ProducerConfig,
        topic: &str,
    ) -> anyhow::Result<Self> {
        let client_config = ProducerConfigBuilder::new(&kafka_config.kafka_hosts)
            .with_acks(producer_config.kafka_producer_acks)
            .with_batch_size(producer_config.kafka_producer_batch_size)
            .with_linger_ms(producer_config.kafka_producer_linger_ms)
            .with_buffer_bytes(producer_config.kafka_producer_buffer_bytes)
            .with_retries(producer_config.kafka_producer_retries)
            .with_message_timeout_ms(producer_config.kafka_message_timeout_ms)
            .with_tls(kafka_config.kafka_tls)
            .build();

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: ThreadedProducer<KafkaDeliveryContext> = client_config
            .create_with_context(KafkaDeliveryContext)
            .context("failed to create Kafka producer")?;

        // Ping the cluster to make sure we can reach brokers
        info!("Connecting to Kafka brokers at {}...", kafka_config.kafka_hosts);
        match producer
            .client()
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
        {
            Ok(metadata) => info!(
                brokers = metadata.brokers().len(),
                "Connected to Kafka brokers"
            ),
            Err(e) => warn!(
                "Could not fetch metadata for {topic}, sends will wait for the cluster: {e}"
            ),
        }

        Ok(Self::new(
            producer,
            topic,
            producer_config.kafka_producer_async_calls,
        ))
    }
}

impl<S: SendConnection> ProducerClient<S> {
    pub fn new(connection: S, topic: &str, async_calls: bool) -> Self {
        Self {
            connection,
            topic: topic.to_string(),
            async_calls,
            buffer_full_backoff: DEFAULT_BUFFER_FULL_BACKOFF,
            stats: Arc::new(ProducerStats::default()),
        }
    }

    /// How long to wait before retrying an enqueue rejected for lack of buffer space.
    pub fn with_buffer_full_backoff(mut self, backoff: Duration) -> Self {
        self.buffer_full_backoff = backoff;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_async(&self) -> bool {
        self.async_calls
    }

    pub fn stats(&self) -> Arc<ProducerStats> {
        self.stats.clone()
    }

    /// Enqueue one message on the topic.
    ///
    /// Synchronous clients return once the confirmation handler has run, with
    /// the record's partition and offset or the delivery error. Asynchronous
    /// clients return [`SendReceipt::Enqueued`] as soon as the record is
    /// buffered; the handler logs the outcome later.
    pub async fn send(&self, message: &str) -> Result<SendReceipt, ProduceError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_waiting_for_space(message, self.confirmation_handler(tx))
            .await?;
        self.stats.enqueued.fetch_add(1, Ordering::SeqCst);

        if self.async_calls {
            return Ok(SendReceipt::Enqueued);
        }

        match rx.await {
            Ok(Ok(delivery)) => Ok(SendReceipt::Delivered(delivery)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProduceError::Canceled),
        }
    }

    /// Wait for every buffered record to be confirmed, then drop the connection.
    pub fn close(self, timeout: Duration) -> Result<(), ProduceError> {
        info!(
            topic = self.topic.as_str(),
            enqueued = self.stats.enqueued(),
            "Flushing producer before close"
        );
        self.connection.flush(timeout)?;
        info!(
            topic = self.topic.as_str(),
            confirmed = self.stats.confirmed(),
            failed = self.stats.failed(),
            "Producer closed"
        );
        Ok(())
    }

    fn confirmation_handler(
        &self,
        tx: oneshot::Sender<Result<Delivery, ProduceError>>,
    ) -> DeliveryHandler {
        let topic = self.topic.clone();
        let stats = self.stats.clone();

        DeliveryHandler::new(move |result| {
            match &result {
                Ok(delivery) => {
                    stats.confirmed.fetch_add(1, Ordering::SeqCst);
                    metrics::counter!(PRODUCER_SENDS, "outcome" => "delivered").increment(1);
                    info!(
                        topic = topic.as_str(),
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "Message delivered"
                    );
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::SeqCst);
                    metrics::counter!(PRODUCER_SENDS, "outcome" => "failed").increment(1);
                    error!(topic = topic.as_str(), "Failed to deliver message: {e}");
                }
            }

            // Asynchronous callers are not waiting
            if tx.send(result).is_err() {
                debug!(topic = topic.as_str(), "No caller waiting for confirmation");
            }
        })
    }

    async fn enqueue_waiting_for_space(
        &self,
        message: &str,
        mut handler: DeliveryHandler,
    ) -> Result<(), ProduceError> {
        let mut waited = false;

        loop {
            match self.connection.enqueue(&self.topic, message, handler) {
                Ok(()) => {
                    if waited {
                        debug!(topic = self.topic.as_str(), "Send buffer has room again");
                    }
                    return Ok(());
                }
                Err((ProduceError::BufferFull, returned)) => {
                    if !waited {
                        warn!(
                            topic = self.topic.as_str(),
                            "Send buffer full, waiting for space"
                        );
                        waited = true;
                    }
                    metrics::counter!(PRODUCER_BUFFER_FULL).increment(1);
                    handler = returned;
                    tokio::time::sleep(self.buffer_full_backoff).await;
                }
                Err((e, _)) => {
                    metrics::counter!(PRODUCER_SENDS, "outcome" => "rejected").increment(1);
                    error!(
                        topic = self.topic.as_str(),
                        "Failed to enqueue message: {e}"
                    );
                    return Err(e);
                }
            }
        }
    }
}
