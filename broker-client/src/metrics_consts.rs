// ==== Consumption loop metrics ====
/// Counter for records handed to the delivery sink successfully
pub const RECORDS_DELIVERED: &str = "broker_consumer_records_delivered_total";

/// Counter for records the delivery sink failed to process
pub const RECORD_DELIVERY_FAILURES: &str = "broker_consumer_delivery_failures_total";

/// Counter for records skipped without delivery, labelled by reason
pub const RECORDS_SKIPPED: &str = "broker_consumer_records_skipped_total";

/// Histogram for the number of records per polled batch
pub const BATCH_SIZE: &str = "broker_consumer_batch_size";

/// Counter for offset commits, labelled by outcome
pub const OFFSET_COMMITS: &str = "broker_consumer_offset_commits_total";

/// Counter for read cursor resets issued after a commit conflict
pub const SEEK_RECOVERIES: &str = "broker_consumer_seek_recoveries_total";

/// Counter for rebalance notifications, labelled by event type
pub const REBALANCE_EVENTS: &str = "broker_consumer_rebalance_events_total";

/// Counter for errors reported while polling, labelled by level and error
pub const POLL_ERRORS: &str = "broker_consumer_poll_errors_total";

// ==== Producer metrics ====
/// Counter for producer sends, labelled by outcome
pub const PRODUCER_SENDS: &str = "broker_producer_sends_total";

/// Counter for enqueue attempts rejected because the send buffer was full
pub const PRODUCER_BUFFER_FULL: &str = "broker_producer_buffer_full_total";
