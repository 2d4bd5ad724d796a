use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, HookError>;

/// Errors surfaced by hooks, handles and the process-group boundary.
///
/// `Clone` because a failed [`AsyncHandle`](crate::future::AsyncHandle)
/// hands the same error to every waiter and continuation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HookError {
    #[error("handle has not completed yet")]
    NotCompleted,

    #[error("handle was already completed")]
    AlreadyCompleted,

    #[error("handle payload was already consumed")]
    AlreadyConsumed,

    #[error("hook contract violated: {reason}")]
    ContractViolation { reason: String },

    #[error("hook returned {actual} tensors for a bucket of {expected}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("tensor {index}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("a communication hook is already registered")]
    HookAlreadyRegistered,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("{operation} timed out after {timeout_ms}ms waiting on rank {rank}")]
    Timeout {
        operation: &'static str,
        rank: Rank,
        timeout_ms: u64,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("external hook '{hook}' failed: {reason}")]
    ExternalHook { hook: String, reason: String },

    #[error("external reference '{0}' was already released")]
    Released(&'static str),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl HookError {
    /// Create a `Transport` error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a `ContractViolation` error.
    pub fn contract(reason: impl Into<String>) -> Self {
        Self::ContractViolation {
            reason: reason.into(),
        }
    }

    /// Create an `ExternalHook` error attributed to the named strategy.
    pub fn external(hook: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExternalHook {
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a caller-side programming error rather than a
    /// failure reported by the transport or an external strategy.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::NotCompleted
                | Self::AlreadyCompleted
                | Self::AlreadyConsumed
                | Self::ContractViolation { .. }
                | Self::CountMismatch { .. }
                | Self::ShapeMismatch { .. }
                | Self::HookAlreadyRegistered
                | Self::InvalidArgument(_)
        )
    }
}
