use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConsumerConfig, KafkaConfig, RebalanceSignalPolicy};
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::connection::{ConnectionError, ConsumerConnection, KafkaConnection};
use crate::kafka::offset_store::OffsetStore;
use crate::kafka::rebalance_listener::{
    LoggingRebalanceListener, RebalanceEvent, RebalanceEventReceiver, RebalanceListener,
};
use crate::kafka::types::{PartitionKey, Record};
use crate::metrics_consts::{
    BATCH_SIZE, OFFSET_COMMITS, REBALANCE_EVENTS, RECORDS_DELIVERED, RECORDS_SKIPPED,
    RECORD_DELIVERY_FAILURES, SEEK_RECOVERIES,
};
use crate::sink::DeliverySink;

/// Where a consumption loop is in its cycle.
///
/// ```text
/// Idle ─► Polling ─► Delivering ─► Committing ─► Polling ...
///                                      │
///                                      └─► SeekRecovery ─► Polling   (commit conflict)
///
/// revoke ─► Paused ─► assign (or max pause) ─► Polling
/// any state ─► Terminated                                          (unrecoverable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    /// Between a revoke and the following assign: polling continues, committing does not
    Paused,
    Delivering,
    Committing,
    SeekRecovery,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub topic: String,

    // if enabled the client library owns offset commits and the loop never commits
    pub auto_commit: bool,

    // batch configs - how big should batches get
    // and how long to wait for one to fill
    pub batch_size: usize,
    pub batch_timeout: Duration,

    pub max_pause: Duration,
    pub rebalance_signal_policy: RebalanceSignalPolicy,
}

impl LoopSettings {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            auto_commit: false,
            batch_size: 500,
            batch_timeout: Duration::from_secs(1),
            max_pause: Duration::from_secs(30),
            rebalance_signal_policy: RebalanceSignalPolicy::Resume,
        }
    }

    pub fn from_config(topic: &str, config: &ConsumerConfig) -> Self {
        Self {
            topic: topic.to_string(),
            auto_commit: config.kafka_consumer_auto_commit,
            batch_size: config.kafka_consumer_batch_size.max(1),
            batch_timeout: config.batch_timeout(),
            max_pause: config.max_pause(),
            rebalance_signal_policy: config.kafka_consumer_rebalance_signal_policy,
        }
    }
}

/// Counters for one loop's lifetime, returned when it stops cleanly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub batches: u64,
    pub records_delivered: u64,
    pub delivery_failures: u64,
    pub records_skipped: u64,
    pub commits: u64,
    pub commit_conflicts: u64,
    pub seeks: u64,
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("consumption loop terminated while {state:?}: {source}")]
    Terminated {
        state: LoopState,
        source: ConnectionError,
    },
}

/// Polls one subscription, hands every record to a delivery sink, tracks the
/// processed offset per partition and commits it.
///
/// When the coordinator rejects a commit because the group changed underneath
/// it, every partition in the offset store is rewound to its stored offset
/// before polling resumes. Records this loop already delivered are skipped
/// when they come back; peers that picked up a partition in the meantime may
/// see them again.
pub struct ConsumptionLoop<C: ConsumerConnection = KafkaConnection> {
    connection: C,
    rebalance_rx: RebalanceEventReceiver,
    sink: Arc<dyn DeliverySink>,
    listener: Arc<dyn RebalanceListener>,
    offsets: Arc<OffsetStore>,
    settings: LoopSettings,

    // shutdown signal from the parent process, which we assume
    // runs each loop on its own spawned task
    shutdown_rx: oneshot::Receiver<()>,

    state: LoopState,
    paused_since: Option<Instant>,
    // partitions revoked since the current batch was polled
    revoked_in_cycle: HashSet<PartitionKey>,
    // offsets changed since the last successful commit
    dirty: bool,
    summary: LoopSummary,
}

impl ConsumptionLoop<KafkaConnection> {
    /// Create the Kafka connection, join the group and subscribe.
    pub fn connect(
        kafka_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        topic: &str,
        sink: Arc<dyn DeliverySink>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> anyhow::Result<Self> {
        let client_config = ConsumerConfigBuilder::new(
            &kafka_config.kafka_hosts,
            &consumer_config.kafka_consumer_group,
        )
        .with_auto_commit(consumer_config.kafka_consumer_auto_commit)
        .with_offset_reset(&consumer_config.kafka_consumer_offset_reset)
        .with_tls(kafka_config.kafka_tls)
        .build();

        let (connection, rebalance_rx) = KafkaConnection::connect(&client_config, topic)?;

        Ok(Self::new(
            connection,
            rebalance_rx,
            sink,
            LoopSettings::from_config(topic, consumer_config),
            shutdown_rx,
        ))
    }
}

impl<C: ConsumerConnection> ConsumptionLoop<C> {
    pub fn new(
        connection: C,
        rebalance_rx: RebalanceEventReceiver,
        sink: Arc<dyn DeliverySink>,
        settings: LoopSettings,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            connection,
            rebalance_rx,
            sink,
            listener: Arc::new(LoggingRebalanceListener),
            offsets: Arc::new(OffsetStore::new()),
            settings,
            shutdown_rx,
            state: LoopState::Idle,
            paused_since: None,
            revoked_in_cycle: HashSet::new(),
            dirty: false,
            summary: LoopSummary::default(),
        }
    }

    /// Share an offset store with other loops instead of owning one.
    pub fn with_offset_store(mut self, offsets: Arc<OffsetStore>) -> Self {
        self.offsets = offsets;
        self
    }

    pub fn with_rebalance_listener(mut self, listener: Arc<dyn RebalanceListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn offset_store(&self) -> Arc<OffsetStore> {
        self.offsets.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until shutdown or an unrecoverable connection error. The connection
    /// is closed either way; restarting is up to the caller.
    pub async fn run(self) -> Result<LoopSummary, ConsumeError> {
        let span = info_span!(
            "consumption_loop",
            loop_id = %Uuid::new_v4(),
            topic = %self.settings.topic
        );
        self.run_cycles().instrument(span).await
    }

    async fn run_cycles(mut self) -> Result<LoopSummary, ConsumeError> {
        info!("Starting consumption loop");

        let outcome = loop {
            self.apply_rebalance_events();
            self.check_pause_expiry();
            self.state = if self.paused_since.is_some() {
                LoopState::Paused
            } else {
                LoopState::Polling
            };

            let polled = tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received, stopping consumption loop");
                    break Ok(());
                }

                polled = self.connection.poll_batch(
                    self.settings.batch_size,
                    self.settings.batch_timeout,
                ) => polled,
            };

            match polled {
                Ok(batch) => self.run_cycle(batch).await,
                Err(e) => {
                    if let Some(terminal) = self.handle_poll_error(e) {
                        break Err(terminal);
                    }
                }
            }
        };

        let last_state = self.state;
        self.state = LoopState::Terminated;
        self.connection.close();

        match outcome {
            Ok(()) => {
                info!(
                    delivered = self.summary.records_delivered,
                    commits = self.summary.commits,
                    recoveries = self.summary.commit_conflicts,
                    "Consumption loop stopped"
                );
                Ok(self.summary)
            }
            Err(source) => {
                error!(
                    state = ?last_state,
                    delivered = self.summary.records_delivered,
                    "Consumption loop terminated: {source}"
                );
                Err(ConsumeError::Terminated {
                    state: last_state,
                    source,
                })
            }
        }
    }

    async fn run_cycle(&mut self, batch: Vec<Record>) {
        // Rebalance callbacks fire while polling, so pick up what arrived
        // during the poll before touching the batch
        self.apply_rebalance_events();

        if !batch.is_empty() {
            self.summary.batches += 1;
            metrics::histogram!(BATCH_SIZE).record(batch.len() as f64);
            self.deliver(batch).await;
        }

        if self.should_commit() {
            self.commit_offsets();
        }

        self.revoked_in_cycle.clear();
    }

    fn apply_rebalance_events(&mut self) {
        while let Ok(event) = self.rebalance_rx.try_recv() {
            self.apply_rebalance_event(event);
        }
    }

    fn apply_rebalance_event(&mut self, event: RebalanceEvent) {
        metrics::counter!(REBALANCE_EVENTS, "event_type" => event.event_type()).increment(1);

        match event {
            RebalanceEvent::Revoke(partitions) => {
                // Cooperative rebalancing sends empty revokes when nothing moves
                if partitions.is_empty() {
                    debug!("Skipping empty revoke");
                    return;
                }

                for partition in &partitions {
                    self.offsets.clear_partition(partition);
                    self.revoked_in_cycle.insert(partition.clone());
                }
                if self.paused_since.is_none() {
                    self.paused_since = Some(Instant::now());
                }
                self.state = LoopState::Paused;
                info!(
                    revoked = partitions.len(),
                    "Partitions revoked, pausing commits until reassignment"
                );

                self.listener.on_partitions_revoked(&partitions);
            }
            RebalanceEvent::Assign(partitions) => {
                for partition in &partitions {
                    self.revoked_in_cycle.remove(partition);
                }
                if self.paused_since.take().is_some() {
                    info!(
                        assigned = partitions.len(),
                        "Rebalance complete, resuming commits"
                    );
                }
                self.state = LoopState::Polling;

                self.listener.on_partitions_assigned(&partitions);
            }
        }
    }

    fn check_pause_expiry(&mut self) {
        if let Some(since) = self.paused_since {
            if since.elapsed() >= self.settings.max_pause {
                warn!(
                    paused_ms = since.elapsed().as_millis() as u64,
                    "No assignment arrived after revoke, resuming anyway"
                );
                self.paused_since = None;
            }
        }
    }

    async fn deliver(&mut self, batch: Vec<Record>) {
        self.state = LoopState::Delivering;
        let mut delivered = 0u64;
        // first offset the sink rejected, per partition
        let mut failed: BTreeMap<PartitionKey, i64> = BTreeMap::new();

        for record in batch {
            let partition = record.partition_key();

            if failed.contains_key(&partition) {
                debug!(
                    topic = record.topic.as_str(),
                    partition = record.partition,
                    offset = record.offset,
                    "Holding back record behind a failed delivery"
                );
                self.record_skip("after_failure");
                continue;
            }

            if self.revoked_in_cycle.contains(&partition) {
                debug!(
                    topic = record.topic.as_str(),
                    partition = record.partition,
                    offset = record.offset,
                    "Dropping record from revoked partition"
                );
                self.record_skip("revoked");
                continue;
            }

            if self.offsets.is_processed(&partition, record.offset) {
                debug!(
                    topic = record.topic.as_str(),
                    partition = record.partition,
                    offset = record.offset,
                    "Skipping record already delivered by this loop"
                );
                self.record_skip("already_delivered");
                continue;
            }

            debug!(
                topic = record.topic.as_str(),
                partition = record.partition,
                offset = record.offset,
                key = ?record.key,
                "Delivering record"
            );

            match self.sink.receive(&record.value).await {
                Ok(()) => {
                    self.offsets.mark_processed(&partition, record.offset);
                    self.dirty = true;
                    delivered += 1;
                    self.summary.records_delivered += 1;
                    metrics::counter!(RECORDS_DELIVERED).increment(1);
                }
                Err(e) => {
                    error!(
                        topic = record.topic.as_str(),
                        partition = record.partition,
                        offset = record.offset,
                        "Delivery sink failed to process record, it will be delivered again: {e:#}"
                    );
                    self.summary.delivery_failures += 1;
                    metrics::counter!(RECORD_DELIVERY_FAILURES).increment(1);
                    failed.insert(partition, record.offset);
                }
            }
        }

        info!(delivered = delivered, "Processed batch");

        // The next poll of a failed partition starts at the rejected record,
        // and the stored offset never passes it
        for (partition, offset) in &failed {
            self.rewind(partition, *offset, "delivery_failure");
        }
    }

    fn record_skip(&mut self, reason: &'static str) {
        self.summary.records_skipped += 1;
        metrics::counter!(RECORDS_SKIPPED, "reason" => reason).increment(1);
    }

    fn should_commit(&self) -> bool {
        !self.settings.auto_commit && self.paused_since.is_none() && self.dirty
    }

    fn commit_offsets(&mut self) {
        self.state = LoopState::Committing;

        let snapshot = self.offsets.snapshot();
        if snapshot.is_empty() {
            // everything we had was revoked
            self.dirty = false;
            return;
        }

        // Committed offsets name the next record to read
        let next_offsets: Vec<(PartitionKey, i64)> = snapshot
            .iter()
            .map(|(partition, offset)| (partition.clone(), offset + 1))
            .collect();

        match self.connection.commit_sync(&next_offsets) {
            Ok(()) => {
                debug!(partitions = snapshot.len(), "Committed offsets");
                self.dirty = false;
                self.summary.commits += 1;
                metrics::counter!(OFFSET_COMMITS, "outcome" => "success").increment(1);
            }
            Err(ConnectionError::CommitConflict(reason)) => {
                warn!(
                    partitions = snapshot.len(),
                    "Commit rejected ({reason}), rewinding read positions to processed offsets; records may be delivered again"
                );
                self.summary.commit_conflicts += 1;
                metrics::counter!(OFFSET_COMMITS, "outcome" => "conflict").increment(1);
                self.seek_to_processed(&snapshot);
            }
            Err(e) => {
                warn!(
                    partitions = snapshot.len(),
                    "Failed to commit offsets, retrying next cycle: {e}"
                );
                metrics::counter!(OFFSET_COMMITS, "outcome" => "error").increment(1);
            }
        }
    }

    // Offsets stay dirty so the next cycle commits them again
    fn seek_to_processed(&mut self, snapshot: &[(PartitionKey, i64)]) {
        self.state = LoopState::SeekRecovery;

        for (partition, offset) in snapshot {
            self.rewind(partition, *offset, "commit_conflict");
        }
    }

    fn rewind(&mut self, partition: &PartitionKey, offset: i64, reason: &'static str) {
        match self.connection.seek(partition, offset) {
            Ok(()) => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset = offset,
                    reason = reason,
                    "Reset read position"
                );
                self.summary.seeks += 1;
                metrics::counter!(SEEK_RECOVERIES, "reason" => reason).increment(1);
            }
            Err(e) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset = offset,
                    reason = reason,
                    "Failed to reset read position: {e}"
                );
            }
        }
    }

    fn handle_poll_error(&mut self, e: ConnectionError) -> Option<ConnectionError> {
        match e {
            ConnectionError::RebalanceInProgress => match self.settings.rebalance_signal_policy {
                RebalanceSignalPolicy::Resume => {
                    warn!("Rebalance in progress, continuing to poll");
                    None
                }
                RebalanceSignalPolicy::Terminate => {
                    warn!("Rebalance in progress, terminating as configured");
                    Some(e)
                }
            },
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::test_utils::{
        records, MockConnection, PollStep, RecordingListener, RecordingSink,
    };

    const TOPIC: &str = "test-topic";

    fn settings() -> LoopSettings {
        LoopSettings {
            batch_timeout: Duration::from_millis(10),
            ..LoopSettings::new(TOPIC)
        }
    }

    fn p(partition: i32) -> PartitionKey {
        PartitionKey::new(TOPIC, partition)
    }

    fn build(
        connection: MockConnection,
        rebalance_rx: RebalanceEventReceiver,
        sink: Arc<RecordingSink>,
        settings: LoopSettings,
    ) -> (ConsumptionLoop<MockConnection>, oneshot::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink, settings, shutdown_rx);
        (consumption_loop, shutdown_tx)
    }

    #[test]
    fn test_settings_from_config() {
        let config = ConsumerConfig {
            kafka_consumer_group: "group".to_string(),
            kafka_consumer_auto_commit: true,
            kafka_consumer_offset_reset: "latest".to_string(),
            kafka_consumer_batch_size: 0,
            kafka_consumer_batch_timeout_ms: 200,
            kafka_consumer_max_pause_ms: 400,
            kafka_consumer_rebalance_signal_policy: RebalanceSignalPolicy::Terminate,
        };
        let settings = LoopSettings::from_config("orders", &config);

        assert_eq!(settings.topic, "orders");
        assert!(settings.auto_commit);
        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.batch_timeout, Duration::from_millis(200));
        assert_eq!(settings.max_pause, Duration::from_millis(400));
        assert_eq!(
            settings.rebalance_signal_policy,
            RebalanceSignalPolicy::Terminate
        );
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_commits_next_offset() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([PollStep::Batch(records(TOPIC, 0, [10, 11, 12]))])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings(), shutdown_rx);
        let offsets = consumption_loop.offset_store();
        assert_eq!(consumption_loop.state(), LoopState::Idle);

        let summary = consumption_loop.run().await.unwrap();

        assert_eq!(sink.received(), vec!["message-10", "message-11", "message-12"]);
        assert_eq!(offsets.get(&p(0)), Some(12));
        assert_eq!(handle.commits(), vec![vec![(p(0), 13)]]);
        assert!(handle.seeks().is_empty());
        assert!(handle.is_closed());
        assert_eq!(summary.records_delivered, 3);
        assert_eq!(summary.commits, 1);
        assert_eq!(summary.batches, 1);
    }

    #[tokio::test]
    async fn test_commit_conflict_rewinds_without_redelivery() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([
                PollStep::Batch(records(TOPIC, 0, [10, 11, 12])),
                // the broker serves from the rewound position
                PollStep::Batch(records(TOPIC, 0, [12])),
            ])
            .with_commit_results([
                Err(ConnectionError::CommitConflict("IllegalGeneration".to_string())),
                Ok(()),
            ])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings(), shutdown_rx);
        let offsets = consumption_loop.offset_store();

        let summary = consumption_loop.run().await.unwrap();

        // Rewound to exactly the stored offset, before the next poll
        assert_eq!(handle.seeks(), vec![(p(0), 12)]);
        assert_eq!(handle.polls_before_seeks(), vec![1]);

        // Record 12 came back but this loop had already delivered it
        assert_eq!(sink.received(), vec!["message-10", "message-11", "message-12"]);
        assert_eq!(offsets.get(&p(0)), Some(12));

        // The rejected offsets are committed again on the next cycle
        assert_eq!(
            handle.commits(),
            vec![vec![(p(0), 13)], vec![(p(0), 13)]]
        );
        assert_eq!(summary.commit_conflicts, 1);
        assert_eq!(summary.seeks, 1);
        assert_eq!(summary.commits, 1);
        assert_eq!(summary.records_skipped, 1);
    }

    #[tokio::test]
    async fn test_conflict_rewinds_every_stored_partition() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let mut batch = records(TOPIC, 0, [3, 4]);
        batch.extend(records(TOPIC, 1, [40]));
        batch.extend(records(TOPIC, 2, [7, 8, 9]));
        let connection = connection
            .with_steps([PollStep::Batch(batch)])
            .with_commit_results([Err(ConnectionError::CommitConflict("RebalanceInProgress".to_string()))])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink, settings(), shutdown_rx);

        consumption_loop.run().await.unwrap();

        assert_eq!(handle.seeks(), vec![(p(0), 4), (p(1), 40), (p(2), 9)]);
    }

    #[tokio::test]
    async fn test_auto_commit_never_commits() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([
                PollStep::Batch(records(TOPIC, 0, [0, 1])),
                PollStep::Batch(records(TOPIC, 0, [2])),
            ])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let settings = LoopSettings {
            auto_commit: true,
            ..settings()
        };
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings, shutdown_rx);
        let offsets = consumption_loop.offset_store();

        let summary = consumption_loop.run().await.unwrap();

        assert!(handle.commits().is_empty());
        assert_eq!(offsets.get(&p(0)), Some(2));
        assert_eq!(summary.records_delivered, 3);
    }

    #[tokio::test]
    async fn test_offsets_follow_latest_delivery_across_batches() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([
                PollStep::Batch(records(TOPIC, 0, [0, 1, 5])),
                PollStep::Batch(vec![]),
                PollStep::Batch(records(TOPIC, 0, [6, 9])),
            ])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink, settings(), shutdown_rx);
        let offsets = consumption_loop.offset_store();

        consumption_loop.run().await.unwrap();

        assert_eq!(offsets.get(&p(0)), Some(9));
        // Nothing new in the empty cycle, so nothing committed for it
        assert_eq!(
            handle.commits(),
            vec![vec![(p(0), 6)], vec![(p(0), 10)]]
        );
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_advance_offset() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([PollStep::Batch(records(TOPIC, 0, [10, 11]))])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new().failing_on("message-11"));
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings(), shutdown_rx);
        let offsets = consumption_loop.offset_store();

        let summary = consumption_loop.run().await.unwrap();

        assert_eq!(offsets.get(&p(0)), Some(10));
        assert_eq!(handle.commits(), vec![vec![(p(0), 11)]]);
        assert_eq!(handle.seeks(), vec![(p(0), 11)]);
        assert_eq!(summary.records_delivered, 1);
        assert_eq!(summary.delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_sink_failure_first_in_batch_is_never_committed_past() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([PollStep::Batch(records(TOPIC, 0, [10, 11]))])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new().failing_on("message-10"));
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings(), shutdown_rx);
        let offsets = consumption_loop.offset_store();

        let summary = consumption_loop.run().await.unwrap();

        // 11 waits behind 10, and the read position goes back to 10
        assert!(sink.received().is_empty());
        assert_eq!(offsets.get(&p(0)), None);
        assert!(handle.commits().is_empty());
        assert_eq!(handle.seeks(), vec![(p(0), 10)]);
        assert_eq!(summary.delivery_failures, 1);
        assert_eq!(summary.records_skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_record_is_redelivered_before_later_ones() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let mut first = records(TOPIC, 0, [10, 11, 12]);
        first.extend(records(TOPIC, 1, [5]));
        let connection = connection
            .with_steps([
                PollStep::Batch(first),
                // served again from the rewound position
                PollStep::Batch(records(TOPIC, 0, [10, 11, 12])),
            ])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new().failing_once_on("message-10"));
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings(), shutdown_rx);
        let offsets = consumption_loop.offset_store();

        let summary = consumption_loop.run().await.unwrap();

        assert_eq!(
            sink.received(),
            vec!["message-5", "message-10", "message-11", "message-12"]
        );
        assert_eq!(handle.seeks(), vec![(p(0), 10)]);
        assert_eq!(handle.polls_before_seeks(), vec![1]);
        // Partition 1 commits on its own while partition 0 is held back
        assert_eq!(
            handle.commits(),
            vec![vec![(p(1), 6)], vec![(p(0), 13), (p(1), 6)]]
        );
        assert_eq!(offsets.get(&p(0)), Some(12));
        assert_eq!(summary.delivery_failures, 1);
        assert_eq!(summary.records_skipped, 2);
    }

    #[tokio::test]
    async fn test_revoke_clears_offsets_and_pauses_commits() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let mut mixed = records(TOPIC, 0, [3]);
        mixed.extend(records(TOPIC, 1, [5]));
        let connection = connection
            .with_steps([
                PollStep::Batch(records(TOPIC, 0, [1, 2])),
                PollStep::Rebalance(vec![RebalanceEvent::Revoke(vec![p(0)])], mixed),
                PollStep::Rebalance(vec![RebalanceEvent::Assign(vec![p(1)])], vec![]),
            ])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let listener = Arc::new(RecordingListener::default());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings(), shutdown_rx)
                .with_rebalance_listener(listener.clone());
        let offsets = consumption_loop.offset_store();

        consumption_loop.run().await.unwrap();

        // Record 3 arrived after partition 0 moved away; its new owner reads it
        assert_eq!(sink.received(), vec!["message-1", "message-2", "message-5"]);
        assert_eq!(offsets.get(&p(0)), None);
        assert_eq!(offsets.get(&p(1)), Some(5));

        // No commit while paused, partition 1 committed once assigned
        assert_eq!(handle.commits(), vec![vec![(p(0), 3)], vec![(p(1), 6)]]);
        assert_eq!(listener.revoked(), vec![p(0)]);
        assert_eq!(listener.assigned(), vec![p(1)]);
    }

    #[tokio::test]
    async fn test_revoke_then_assign_in_same_poll_keeps_records() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([PollStep::Rebalance(
                vec![
                    RebalanceEvent::Revoke(vec![p(0)]),
                    RebalanceEvent::Assign(vec![p(0)]),
                ],
                records(TOPIC, 0, [7]),
            )])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings(), shutdown_rx);

        consumption_loop.run().await.unwrap();

        assert_eq!(sink.received(), vec!["message-7"]);
        assert_eq!(handle.commits(), vec![vec![(p(0), 8)]]);
    }

    #[tokio::test]
    async fn test_pause_expires_without_assignment() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([
                PollStep::Rebalance(
                    vec![RebalanceEvent::Revoke(vec![p(0)])],
                    records(TOPIC, 1, [1]),
                ),
                PollStep::Batch(records(TOPIC, 1, [2])),
            ])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let settings = LoopSettings {
            max_pause: Duration::ZERO,
            ..settings()
        };
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink, settings, shutdown_rx);

        consumption_loop.run().await.unwrap();

        assert_eq!(handle.commits(), vec![vec![(p(1), 3)]]);
    }

    #[tokio::test]
    async fn test_empty_revoke_does_not_pause() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([PollStep::Rebalance(
                vec![RebalanceEvent::Revoke(vec![])],
                records(TOPIC, 0, [0]),
            )])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink, settings(), shutdown_rx);

        consumption_loop.run().await.unwrap();

        assert_eq!(handle.commits(), vec![vec![(p(0), 1)]]);
    }

    #[tokio::test]
    async fn test_rebalance_signal_resume_policy_keeps_polling() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, _handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([
                PollStep::Error(ConnectionError::RebalanceInProgress),
                PollStep::Batch(records(TOPIC, 0, [4])),
            ])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink.clone(), settings(), shutdown_rx);

        let summary = consumption_loop.run().await.unwrap();

        assert_eq!(summary.records_delivered, 1);
        assert_eq!(sink.received(), vec!["message-4"]);
    }

    #[tokio::test]
    async fn test_rebalance_signal_terminate_policy_exits() {
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection.with_steps([
            PollStep::Error(ConnectionError::RebalanceInProgress),
            PollStep::Batch(records(TOPIC, 0, [4])),
        ]);
        let sink = Arc::new(RecordingSink::new());
        let settings = LoopSettings {
            rebalance_signal_policy: RebalanceSignalPolicy::Terminate,
            ..settings()
        };
        let (consumption_loop, _shutdown_tx) = build(connection, rebalance_rx, sink.clone(), settings);

        let err = consumption_loop.run().await.unwrap_err();

        assert!(matches!(
            err,
            ConsumeError::Terminated {
                state: LoopState::Polling,
                source: ConnectionError::RebalanceInProgress,
            }
        ));
        assert!(sink.received().is_empty());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_poll_timeout_terminates_after_committing_progress() {
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection.with_steps([
            PollStep::Batch(records(TOPIC, 0, [1])),
            PollStep::Error(ConnectionError::Timeout("OperationTimedOut".to_string())),
        ]);
        let sink = Arc::new(RecordingSink::new());
        let (consumption_loop, _shutdown_tx) = build(connection, rebalance_rx, sink, settings());
        let offsets = consumption_loop.offset_store();

        let err = consumption_loop.run().await.unwrap_err();

        assert!(matches!(
            err,
            ConsumeError::Terminated {
                source: ConnectionError::Timeout(_),
                ..
            }
        ));
        assert_eq!(offsets.get(&p(0)), Some(1));
        assert_eq!(handle.commits(), vec![vec![(p(0), 2)]]);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_wakeup_terminates() {
        let (connection, _handle, rebalance_rx) = MockConnection::new();
        let connection = connection.with_steps([PollStep::Error(ConnectionError::Wakeup)]);
        let sink = Arc::new(RecordingSink::new());
        let (consumption_loop, _shutdown_tx) = build(connection, rebalance_rx, sink, settings());

        let err = consumption_loop.run().await.unwrap_err();
        assert!(matches!(
            err,
            ConsumeError::Terminated {
                source: ConnectionError::Wakeup,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_before_first_poll() {
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection.with_steps([PollStep::Batch(records(TOPIC, 0, [1]))]);
        let sink = Arc::new(RecordingSink::new());
        let (consumption_loop, shutdown_tx) = build(connection, rebalance_rx, sink.clone(), settings());

        shutdown_tx.send(()).unwrap();
        let summary = consumption_loop.run().await.unwrap();

        assert_eq!(summary, LoopSummary::default());
        assert_eq!(handle.poll_count(), 0);
        assert!(sink.received().is_empty());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_shared_offset_store() {
        let shared = Arc::new(OffsetStore::new());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (connection, handle, rebalance_rx) = MockConnection::new();
        let connection = connection
            .with_steps([PollStep::Batch(records(TOPIC, 0, [1]))])
            .shutdown_when_drained(shutdown_tx);
        let sink = Arc::new(RecordingSink::new());
        let consumption_loop =
            ConsumptionLoop::new(connection, rebalance_rx, sink, settings(), shutdown_rx)
                .with_offset_store(shared.clone());

        consumption_loop.run().await.unwrap();

        assert_eq!(shared.get(&p(0)), Some(1));
        assert_eq!(handle.commits(), vec![vec![(p(0), 2)]]);
    }

    #[test]
    fn test_state_transitions_on_rebalance_events() {
        let (connection, _handle, rebalance_rx) = MockConnection::new();
        let sink = Arc::new(RecordingSink::new());
        let (mut consumption_loop, _shutdown_tx) = build(connection, rebalance_rx, sink, settings());
        consumption_loop.offsets.mark_processed(&p(0), 4);
        consumption_loop.offsets.mark_processed(&p(1), 8);

        consumption_loop.apply_rebalance_event(RebalanceEvent::Revoke(vec![p(0)]));
        assert_eq!(consumption_loop.state(), LoopState::Paused);
        assert_eq!(consumption_loop.offsets.get(&p(0)), None);
        assert_eq!(consumption_loop.offsets.get(&p(1)), Some(8));
        consumption_loop.dirty = true;
        assert!(!consumption_loop.should_commit());

        consumption_loop.apply_rebalance_event(RebalanceEvent::Assign(vec![p(0), p(1)]));
        assert_eq!(consumption_loop.state(), LoopState::Polling);
        assert!(consumption_loop.should_commit());
    }
}
