// Kafka module - consumption loops with rebalance handling, and the producer client
pub mod config;
pub mod connection;
pub mod consumption_loop;
pub mod offset_store;
pub mod producer;
pub mod rebalance_listener;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use config::{ConsumerConfigBuilder, ProducerConfigBuilder};
pub use connection::{ConnectionError, ConsumerConnection, KafkaConnection};
pub use consumption_loop::{ConsumeError, ConsumptionLoop, LoopSettings, LoopState, LoopSummary};
pub use offset_store::OffsetStore;
pub use producer::{Delivery, ProduceError, ProducerClient, SendConnection, SendReceipt};
pub use rebalance_listener::{LoggingRebalanceListener, RebalanceEvent, RebalanceListener};
pub use types::{PartitionKey, Record};
