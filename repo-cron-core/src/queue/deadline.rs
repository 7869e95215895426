//! Ack-deadline extension for a held message.
//!
//! A [`DeadlineExtender`] is created when a message is pulled and owned by
//! the subscriber's held-message slot. `stop` cancels the task and waits for
//! it, so no extension is started after Ack/Nack returns. Cancelling drops an
//! extension that is already in flight at its next await point; for Pub/Sub
//! that `modifyAckDeadline` request may still have reached the broker just
//! before the ack or nack, which only pushes out a deadline the ack or nack
//! then supersedes.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::QueueError;

pub struct DeadlineExtender {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DeadlineExtender {
    /// Call `extend` every `interval` until stopped.
    pub fn spawn<F, Fut>(interval: Duration, extend: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = extend() => match result {
                        Ok(()) => debug!("Extended ack deadline"),
                        Err(e) => warn!(error = %e, "Failed to extend ack deadline"),
                    }
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancel the extension task and wait until it has exited.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "Ack deadline task panicked");
                }
            }
        }
    }
}

impl Drop for DeadlineExtender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
