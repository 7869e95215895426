//! Fire-and-forget publishing shared by both backends.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::{Publisher, QueueError};
use crate::data::BatchRequest;

/// The single operation a backend must provide to publish: deliver one
/// encoded payload to the topic.
#[async_trait]
pub trait MessageSink: Clone + Send + Sync + 'static {
    async fn send(&self, payload: Vec<u8>) -> Result<(), QueueError>;
}

/// Spawns one send task per publish and joins them all at close.
pub struct TopicPublisher<S: MessageSink> {
    sink: S,
    in_flight: JoinSet<Result<(), QueueError>>,
    total: usize,
    failed: usize,
}

impl<S: MessageSink> TopicPublisher<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            in_flight: JoinSet::new(),
            total: 0,
            failed: 0,
        }
    }
}

#[async_trait]
impl<S: MessageSink> Publisher for TopicPublisher<S> {
    fn publish(&mut self, request: &BatchRequest) -> Result<(), QueueError> {
        let payload = request.encode().map_err(QueueError::Encode)?;
        debug!(
            shard_num = request.shard_num,
            repos = request.repos.len(),
            bytes = payload.len(),
            "Publishing shard"
        );
        let sink = self.sink.clone();
        self.total += 1;
        self.in_flight.spawn(async move { sink.send(payload).await });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        while let Some(joined) = self.in_flight.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Publish send failed");
                    self.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Publish task did not complete");
                    self.failed += 1;
                }
            }
        }
        info!(total = self.total, failed = self.failed, "Publisher closed");
        if self.failed > 0 {
            return Err(QueueError::PublishFailed {
                failed: self.failed,
                total: self.total,
            });
        }
        Ok(())
    }
}
