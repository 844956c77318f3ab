//! In-memory stand-ins for the broker connections, used by the unit tests and
//! the tests/ directory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::oneshot;

use crate::kafka::connection::{ConnectionError, ConsumerConnection};
use crate::kafka::producer::{Delivery, DeliveryHandler, ProduceError, SendConnection};
use crate::kafka::rebalance_listener::{
    rebalance_channel, RebalanceEvent, RebalanceEventReceiver, RebalanceEventSender,
    RebalanceListener,
};
use crate::kafka::types::{PartitionKey, Record};
use crate::sink::DeliverySink;

/// Records `message-{offset}` for each offset on one partition.
pub fn records(topic: &str, partition: i32, offsets: impl IntoIterator<Item = i64>) -> Vec<Record> {
    offsets
        .into_iter()
        .map(|offset| {
            Record::new(
                topic,
                partition,
                offset,
                Some(format!("key-{offset}")),
                format!("message-{offset}"),
            )
        })
        .collect()
}

/// One scripted answer to `poll_batch`.
#[derive(Debug, Clone)]
pub enum PollStep {
    Batch(Vec<Record>),
    Error(ConnectionError),
    /// Rebalance callbacks fire during the poll, then the records are returned
    Rebalance(Vec<RebalanceEvent>, Vec<Record>),
}

#[derive(Debug, Default)]
struct MockConsumerState {
    polls: usize,
    commits: Vec<Vec<(PartitionKey, i64)>>,
    seeks: Vec<(PartitionKey, i64)>,
    polls_before_seeks: Vec<usize>,
    closed: bool,
}

/// Observes what a consumption loop did to its [`MockConnection`].
#[derive(Debug, Clone)]
pub struct MockConnectionHandle {
    state: Arc<Mutex<MockConsumerState>>,
}

impl MockConnectionHandle {
    pub fn commits(&self) -> Vec<Vec<(PartitionKey, i64)>> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn seeks(&self) -> Vec<(PartitionKey, i64)> {
        self.state.lock().unwrap().seeks.clone()
    }

    /// How many polls had happened when each seek was issued
    pub fn polls_before_seeks(&self) -> Vec<usize> {
        self.state.lock().unwrap().polls_before_seeks.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().unwrap().polls
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

/// Consumer connection that plays back a script of poll results.
///
/// Once the script runs out it returns empty batches, first firing the
/// shutdown sender registered with [`MockConnection::shutdown_when_drained`].
pub struct MockConnection {
    steps: VecDeque<PollStep>,
    commit_results: VecDeque<Result<(), ConnectionError>>,
    rebalance_tx: RebalanceEventSender,
    shutdown_tx: Option<oneshot::Sender<()>>,
    state: Arc<Mutex<MockConsumerState>>,
}

impl MockConnection {
    pub fn new() -> (Self, MockConnectionHandle, RebalanceEventReceiver) {
        let (rebalance_tx, rebalance_rx) = rebalance_channel();
        let state = Arc::new(Mutex::new(MockConsumerState::default()));
        let connection = Self {
            steps: VecDeque::new(),
            commit_results: VecDeque::new(),
            rebalance_tx,
            shutdown_tx: None,
            state: state.clone(),
        };
        (connection, MockConnectionHandle { state }, rebalance_rx)
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = PollStep>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Results for successive commits; commits beyond the list succeed.
    pub fn with_commit_results(
        mut self,
        results: impl IntoIterator<Item = Result<(), ConnectionError>>,
    ) -> Self {
        self.commit_results.extend(results);
        self
    }

    pub fn shutdown_when_drained(mut self, shutdown_tx: oneshot::Sender<()>) -> Self {
        self.shutdown_tx = Some(shutdown_tx);
        self
    }
}

#[async_trait]
impl ConsumerConnection for MockConnection {
    async fn poll_batch(
        &mut self,
        _max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, ConnectionError> {
        self.state.lock().unwrap().polls += 1;

        match self.steps.pop_front() {
            Some(PollStep::Batch(records)) => Ok(records),
            Some(PollStep::Error(e)) => Err(e),
            Some(PollStep::Rebalance(events, records)) => {
                for event in events {
                    self.rebalance_tx.send(event).unwrap();
                }
                Ok(records)
            }
            None => {
                if let Some(shutdown_tx) = self.shutdown_tx.take() {
                    shutdown_tx.send(()).unwrap();
                }
                tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
                Ok(vec![])
            }
        }
    }

    fn commit_sync(&mut self, next_offsets: &[(PartitionKey, i64)]) -> Result<(), ConnectionError> {
        self.state
            .lock()
            .unwrap()
            .commits
            .push(next_offsets.to_vec());
        self.commit_results.pop_front().unwrap_or(Ok(()))
    }

    fn seek(&mut self, partition: &PartitionKey, offset: i64) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();
        let polls = state.polls;
        state.seeks.push((partition.clone(), offset));
        state.polls_before_seeks.push(polls);
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Delivery sink that remembers every payload it accepted.
#[derive(Debug, Default)]
pub struct RecordingSink {
    received: Mutex<Vec<String>>,
    failing: Vec<String>,
    failing_once: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject this payload instead of recording it
    pub fn failing_on(mut self, payload: &str) -> Self {
        self.failing.push(payload.to_string());
        self
    }

    /// Reject this payload the first time it arrives, accept it afterwards
    pub fn failing_once_on(self, payload: &str) -> Self {
        self.failing_once.lock().unwrap().push(payload.to_string());
        self
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn receive(&self, payload: &str) -> Result<()> {
        if self.failing.iter().any(|p| p == payload) {
            bail!("sink rejected {payload}");
        }
        {
            let mut failing_once = self.failing_once.lock().unwrap();
            if let Some(index) = failing_once.iter().position(|p| p == payload) {
                failing_once.remove(index);
                bail!("sink rejected {payload} once");
            }
        }
        self.received.lock().unwrap().push(payload.to_string());
        Ok(())
    }
}

/// Rebalance listener that remembers every partition it was told about.
#[derive(Debug, Default)]
pub struct RecordingListener {
    revoked: Mutex<Vec<PartitionKey>>,
    assigned: Mutex<Vec<PartitionKey>>,
}

impl RecordingListener {
    pub fn revoked(&self) -> Vec<PartitionKey> {
        self.revoked.lock().unwrap().clone()
    }

    pub fn assigned(&self) -> Vec<PartitionKey> {
        self.assigned.lock().unwrap().clone()
    }
}

impl RebalanceListener for RecordingListener {
    fn on_partitions_revoked(&self, partitions: &[PartitionKey]) {
        self.revoked.lock().unwrap().extend_from_slice(partitions);
    }

    fn on_partitions_assigned(&self, partitions: &[PartitionKey]) {
        self.assigned.lock().unwrap().extend_from_slice(partitions);
    }
}

#[derive(Debug)]
struct MockSendState {
    capacity_bytes: usize,
    ack_delay: Duration,
    buffered_bytes: Mutex<usize>,
    next_offset: AtomicI64,
    buffer_full_rejections: AtomicU64,
    sent: Mutex<Vec<String>>,
    enqueue_error: Option<ProduceError>,
    delivery_error: Option<ProduceError>,
}

/// Producer connection with a byte-bounded buffer whose records are
/// acknowledged on a background thread after a fixed delay.
#[derive(Debug, Clone)]
pub struct MockSendConnection {
    inner: Arc<MockSendState>,
}

impl MockSendConnection {
    pub fn new(capacity_bytes: usize, ack_delay: Duration) -> Self {
        Self {
            inner: Arc::new(MockSendState {
                capacity_bytes,
                ack_delay,
                buffered_bytes: Mutex::new(0),
                next_offset: AtomicI64::new(0),
                buffer_full_rejections: AtomicU64::new(0),
                sent: Mutex::new(vec![]),
                enqueue_error: None,
                delivery_error: None,
            }),
        }
    }

    /// Reject every enqueue with this error
    pub fn failing_enqueue(capacity_bytes: usize, error: ProduceError) -> Self {
        let mut connection = Self::new(capacity_bytes, Duration::ZERO);
        if let Some(state) = Arc::get_mut(&mut connection.inner) {
            state.enqueue_error = Some(error);
        }
        connection
    }

    /// Accept every record but report this error to its handler
    pub fn failing_delivery(ack_delay: Duration, error: ProduceError) -> Self {
        let mut connection = Self::new(usize::MAX, ack_delay);
        if let Some(state) = Arc::get_mut(&mut connection.inner) {
            state.delivery_error = Some(error);
        }
        connection
    }

    pub fn sent(&self) -> Vec<String> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn buffered_bytes(&self) -> usize {
        *self.inner.buffered_bytes.lock().unwrap()
    }

    pub fn buffer_full_rejections(&self) -> u64 {
        self.inner.buffer_full_rejections.load(Ordering::SeqCst)
    }
}

impl SendConnection for MockSendConnection {
    fn enqueue(
        &self,
        _topic: &str,
        payload: &str,
        handler: DeliveryHandler,
    ) -> Result<(), (ProduceError, DeliveryHandler)> {
        if let Some(e) = &self.inner.enqueue_error {
            return Err((e.clone(), handler));
        }

        let len = payload.len();
        {
            let mut buffered = self.inner.buffered_bytes.lock().unwrap();
            if buffered.saturating_add(len) > self.inner.capacity_bytes {
                self.inner
                    .buffer_full_rejections
                    .fetch_add(1, Ordering::SeqCst);
                return Err((ProduceError::BufferFull, handler));
            }
            *buffered += len;
        }
        self.inner.sent.lock().unwrap().push(payload.to_string());
        let offset = self.inner.next_offset.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.clone();
        std::thread::spawn(move || {
            std::thread::sleep(inner.ack_delay);
            let result = match &inner.delivery_error {
                Some(e) => Err(e.clone()),
                None => Ok(Delivery {
                    partition: 0,
                    offset,
                }),
            };
            handler.complete(result);
            *inner.buffered_bytes.lock().unwrap() -= len;
        });

        Ok(())
    }

    fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        let deadline = Instant::now() + timeout;
        while self.buffered_bytes() > 0 {
            if Instant::now() >= deadline {
                return Err(ProduceError::Kafka(KafkaError::Flush(
                    RDKafkaErrorCode::OperationTimedOut,
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}
