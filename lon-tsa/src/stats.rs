/// Error-taxonomy counters, readable by the application.
///
/// Every absorbed error lands in exactly one of these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Deliveries dropped because the application input queue was full.
    pub lost_messages: u32,
    /// Incoming transactions dropped because no receive record was free.
    pub missed_messages: u32,
    /// Originated transactions that exhausted their retries.
    pub transaction_timeouts: u32,
    /// Retries consumed by local out-queue backpressure.
    pub lost_retries: u32,
    /// Acks or responses that matched no current transaction.
    pub late_acks: u32,
    /// Authentication replies whose MAC did not match.
    pub auth_failures: u32,
    /// Malformed or unroutable frames.
    pub protocol_errors: u32,
    /// Application responses naming a request no longer held.
    pub stale_responses: u32,
}
