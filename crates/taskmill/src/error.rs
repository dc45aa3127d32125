//! Error taxonomy and handler outcomes.

use thiserror::Error;

/// Errors surfaced by kernel operations.
///
/// The numeric codes returned by [`code`](KernelError::code) are stable; they
/// appear in trace event arguments and are part of the operator-facing
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Allocation failed; the arena (or the selected sub-allocator) is out
    /// of memory.
    #[error("out of memory")]
    NoMem,
    /// A bounded queue or ring refused the element.
    #[error("queue is full")]
    Full,
    /// A queue or ring had nothing to pop.
    #[error("queue is empty")]
    Empty,
    /// An argument was out of range or referred to a nonexistent object.
    #[error("invalid argument")]
    Invalid,
    /// No handler is registered for the task type.
    #[error("no handler registered for task type")]
    NotFound,
    /// The name or type id is already taken.
    #[error("already exists")]
    Exists,
    /// The kernel is halted or the channel refuses new traffic.
    #[error("closed")]
    Closed,
    /// The task type crossed the failure threshold and is latched off.
    #[error("task type is poisoned")]
    Poisoned,
    /// A yield found both the local queue reserve and the overflow bucket
    /// full.
    #[error("yield overflow: local queue and overflow bucket are full")]
    YieldOverflow,
    /// The task exceeded its yield budget (circuit breaker).
    #[error("yield limit exceeded")]
    YieldLimit,
    /// The emitted task's type does not match the channel's declared type.
    #[error("message type does not match channel type")]
    TypeMismatch,
    /// A P2P channel already has its single subscriber.
    #[error("channel already has a subscriber")]
    AlreadyBound,
}

impl KernelError {
    /// Stable numeric code, used in trace event arguments.
    pub fn code(self) -> u32 {
        match self {
            Self::NoMem => 1,
            Self::Full => 2,
            Self::Empty => 3,
            Self::Invalid => 4,
            Self::NotFound => 5,
            Self::Exists => 6,
            Self::Closed => 7,
            Self::Poisoned => 8,
            Self::YieldOverflow => 9,
            Self::YieldLimit => 10,
            Self::TypeMismatch => 11,
            Self::AlreadyBound => 12,
        }
    }

    /// Returns `true` for transient conditions a producer may retry.
    #[inline]
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Full | Self::Empty)
    }

    /// Returns `true` if the target is permanently unusable without operator
    /// intervention.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Poisoned)
    }
}

/// What a handler did with its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The task completed; the worker releases its payload reference.
    Done,
    /// Re-enqueue the task verbatim. The payload reference stays with it.
    Retry,
    /// The handler re-queued the task itself via a yield; the queued copy
    /// owns the payload reference and the worker must not touch it.
    Yielded,
}

/// Result type returned by task handlers.
pub type HandlerResult = Result<Outcome, KernelError>;

/// Numeric form of a handler result for trace arguments.
pub(crate) fn result_code(result: &HandlerResult) -> u32 {
    match result {
        Ok(Outcome::Done) => 0,
        Ok(Outcome::Retry) => 1,
        Ok(Outcome::Yielded) => 2,
        Err(e) => e.code(),
    }
}
