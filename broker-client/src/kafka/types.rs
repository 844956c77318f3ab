use std::fmt;

use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;

/// A topic partition, used as the key for offset bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    topic: String,
    partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for PartitionKey {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A record read from the broker, owned so it can outlive the poll that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: String,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            value: value.into(),
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.topic.as_str(), self.partition)
    }

    /// Copies a broker message. Payloads and keys that are not valid UTF-8 are
    /// decoded lossily; a missing payload becomes the empty string.
    pub fn from_borrowed_message(message: &BorrowedMessage<'_>) -> Self {
        let key = message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned());
        let value = message
            .payload()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key,
            value,
        }
    }
}
