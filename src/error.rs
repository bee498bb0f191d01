//! Weir error abstractions.

/// Errors of the client protocol.
///
/// The `Display` form of these errors is what travels in the `error` field of
/// wire responses; validation failures never mutate broker state.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ProtoError {
    #[error("weir: malformed publish message envelope")]
    BadPublishMsg,
    #[error("weir: malformed subscription request")]
    BadSubscriptionRequest,
    #[error("weir: invalid subject")]
    InvalidSubject,
    #[error("weir: invalid start sequence")]
    InvalidStartSequence,
    #[error("weir: invalid start time")]
    InvalidStartTime,
    #[error("weir: invalid subscription")]
    InvalidSubscription,
    #[error("weir: invalid connection request")]
    InvalidConnectRequest,
    #[error("weir: client ID already registered")]
    DuplicateClient,
    #[error("weir: invalid close request")]
    InvalidCloseRequest,
    #[error("weir: invalid ack wait time, should be >= 1s")]
    InvalidAckWait,
    #[error("weir: duplicate durable registration")]
    DuplicateDurable,
    #[error("weir: conflicting durable and queue subscription")]
    DurableQueueConflict,
    #[error("weir: durable name can't contain colon")]
    InvalidDurableName,
    #[error("weir: connection closed")]
    ConnectionClosed,
    #[error("weir: connect request timeout")]
    ConnectReqTimeout,
    #[error("weir: close request timeout")]
    CloseReqTimeout,
    #[error("weir: timeout waiting for publish ack")]
    PublishAckTimeout,
    #[error("weir: cannot manually ack in auto-ack mode")]
    ManualAckInAutoMode,
    #[error("weir: nil message")]
    NilMessage,
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
