use rdkafka::ClientConfig;

use crate::config::Acks;

/// Kafka consumer configuration builder for group-based consumption loops.
///
/// Offsets are committed explicitly by the loop unless auto-commit is enabled,
/// in which case the client library stores and commits consumed positions on
/// its own schedule.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Sets: group.id, auto.offset.store=false, auto.commit=false,
    /// partition.eof=false, socket/session/heartbeat timeouts.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000");

        Self { config }
    }

    /// Hand offset management to the client library.
    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        let value = enabled.to_string();
        self.config
            .set("enable.auto.commit", value.as_str())
            .set("enable.auto.offset.store", value.as_str());
        self
    }

    /// Where to start when the group has no committed offset: earliest or latest
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Kafka producer configuration builder.
///
/// The send buffer drains a partition's batch once `batch.size` bytes are
/// queued or `linger.ms` has passed, whichever comes first. The buffer holds
/// at most `buffer_bytes`; beyond that enqueueing is rejected and the
/// producer client waits for space.
pub struct ProducerConfigBuilder {
    config: ClientConfig,
}

impl ProducerConfigBuilder {
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("statistics.interval.ms", "10000")
            .set("acks", Acks::All.as_config_value())
            .set("retries", "0");

        Self { config }
    }

    pub fn with_acks(mut self, acks: Acks) -> Self {
        self.config.set("acks", acks.as_config_value());
        self
    }

    pub fn with_batch_size(mut self, bytes: u32) -> Self {
        self.config.set("batch.size", bytes.to_string());
        self
    }

    pub fn with_linger_ms(mut self, ms: u32) -> Self {
        self.config.set("linger.ms", ms.to_string());
        self
    }

    /// librdkafka sizes the buffer in kilobytes; partial kilobytes round up.
    pub fn with_buffer_bytes(mut self, bytes: u64) -> Self {
        let kbytes = bytes.div_ceil(1024).max(1);
        self.config
            .set("queue.buffering.max.kbytes", kbytes.to_string());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.config.set("retries", retries.to_string());
        self
    }

    pub fn with_message_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("message.timeout.ms", ms.to_string());
        self
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
