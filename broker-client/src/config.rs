use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "MODE", default = "consume")]
    pub mode: Mode,

    #[envconfig(from = "BROKER_TOPIC", default = "karma-sample")]
    pub topic: String,

    // Number of consumption loops to run, one connection each
    #[envconfig(from = "BROKER_PARTITIONS", default = "5")]
    pub partitions: usize,

    #[envconfig(from = "METRICS_PORT", default = "9090")]
    pub metrics_port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub producer: ProducerConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "karma-sample-group")]
    pub kafka_consumer_group: String,

    // When enabled the client library commits on its own schedule and the
    // loop never issues commits or seek recoveries.
    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit: bool,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "500")]
    pub kafka_consumer_batch_size: usize,

    #[envconfig(default = "1000")]
    pub kafka_consumer_batch_timeout_ms: u64,

    // Longest time the loop stays paused after a revoke without a matching assign
    #[envconfig(default = "30000")]
    pub kafka_consumer_max_pause_ms: u64,

    #[envconfig(default = "resume")]
    pub kafka_consumer_rebalance_signal_policy: RebalanceSignalPolicy,
}

impl ConsumerConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_batch_timeout_ms)
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_max_pause_ms)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ProducerConfig {
    #[envconfig(default = "all")]
    pub kafka_producer_acks: Acks,

    // Bytes accumulated per partition before a batch is sent
    #[envconfig(default = "16384")]
    pub kafka_producer_batch_size: u32,

    // Maximum time a batch waits to fill before being sent
    #[envconfig(default = "0")]
    pub kafka_producer_linger_ms: u32,

    // Memory available for buffering; sends block once it is exhausted
    #[envconfig(default = "33554432")]
    pub kafka_producer_buffer_bytes: u64,

    // Return from send right after enqueueing instead of waiting for the ack
    #[envconfig(default = "false")]
    pub kafka_producer_async_calls: bool,

    #[envconfig(default = "0")]
    pub kafka_producer_retries: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Consume,
    Produce,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "consume" => Ok(Mode::Consume),
            "produce" => Ok(Mode::Produce),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// How strongly the broker must confirm a write before the producer sees it as delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acks {
    /// No acknowledgment, fire and forget.
    None,
    /// The partition leader has written the record.
    Leader,
    /// Every in-sync replica has written the record.
    All,
}

impl Acks {
    pub fn as_config_value(&self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

impl FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "0" | "none" => Ok(Acks::None),
            "1" | "leader" => Ok(Acks::Leader),
            "all" | "-1" => Ok(Acks::All),
            other => Err(format!("unknown acks mode: {other}")),
        }
    }
}

/// What a consumption loop does when polling reports the group is mid-rebalance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebalanceSignalPolicy {
    /// Log and keep polling; the coordinator finishes the rebalance on a later poll.
    Resume,
    /// Treat the signal as unrecoverable and exit the loop.
    Terminate,
}

impl FromStr for RebalanceSignalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "resume" => Ok(RebalanceSignalPolicy::Resume),
            "terminate" => Ok(RebalanceSignalPolicy::Terminate),
            other => Err(format!("unknown rebalance signal policy: {other}")),
        }
    }
}
