use thiserror::Error;

/// Errors surfaced by the stack's queue-boundary operations.
///
/// Inside the scheduler nothing propagates: malformed frames and resource
/// shortfalls are absorbed into [`crate::stats::Stats`] counters or
/// reported as failed completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TsaError {
    #[error("queue full")]
    QueueFull,
    #[error("stack not initialised")]
    NotInitialized,
    #[error("frame larger than the network buffer")]
    FrameTooLarge,
}
