use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Receives each consumed payload, once per record, in partition order.
///
/// Returning an error marks the record as not processed. The consumption loop
/// logs it, holds back the partition's later records in the same batch and
/// rewinds the partition to the rejected record, so it is delivered again
/// before anything after it is committed.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn receive(&self, payload: &str) -> Result<()>;
}

/// Sink that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl DeliverySink for LoggingSink {
    async fn receive(&self, payload: &str) -> Result<()> {
        info!(bytes = payload.len(), "Received message: {}", payload);
        Ok(())
    }
}
