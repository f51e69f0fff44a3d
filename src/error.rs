//! Error kinds shared by the correlation engine, the renewal scheduler, and
//! the CBS protocol dispatcher.
//!
//! Foreground operations (`Authenticate`, `SendAsync`) surface a [`CbsError`]
//! to the caller. Background renewal failures are absorbed into
//! [`crate::renewal::RenewalScheduler`]'s `OnError` surface instead of being
//! returned from anywhere — see that module for the split.

/// Top-level error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum CbsError {
    /// Operation attempted on a client or request engine that has already
    /// been closed.
    #[error("operation attempted on a disposed CBS client")]
    Disposed,

    /// A precondition was not met: the connection isn't open yet, or the
    /// caller pre-populated a field (`message-id`, `reply-to`) the engine
    /// owns.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The peer rejected a `put-token` / `set-token` request.
    #[error("amqp:cbs:{condition}: {description}")]
    Amqp {
        condition: String,
        description: String,
    },

    /// Local cancellation fired, or link setup could not proceed because the
    /// client is going away.
    #[error("operation cancelled")]
    Cancelled,

    /// Propagated unchanged from a [`crate::provider::TokenProvider`].
    #[error("token provider error: {0}")]
    Provider(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CbsError {
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        CbsError::InvalidOperation(msg.into())
    }

    pub fn amqp(condition: impl Into<String>, description: impl Into<String>) -> Self {
        CbsError::Amqp {
            condition: condition.into(),
            description: description.into(),
        }
    }

    pub fn provider(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        CbsError::Provider(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CbsError>;
