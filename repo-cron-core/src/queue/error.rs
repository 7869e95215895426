//! Queue Error Types

use crate::auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid queue url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown queue backend `{0}` (expected `pubsub`)")]
    UnknownBackend(String),

    #[error("the memory queue backend only works inside one process; use `repo-cron local`")]
    ProcessLocalBackend,

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("broker responded with {status}: {body}")]
    Api { status: u16, body: String },

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("{failed} of {total} publish sends failed")]
    PublishFailed { failed: usize, total: usize },

    #[error("a message is already held; ack or nack it before pulling again")]
    MessageHeld,

    #[error("no message is currently held")]
    NoMessageHeld,

    #[error("queue is closed")]
    Closed,
}
