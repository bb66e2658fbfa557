//! Engine sizing and policy knobs.

use lon_proto::{PduVersion, MAX_APDU};

/// Highest group member index; groups carry at most `MAX_GROUP_MEMBER + 1`
/// nodes.
pub const MAX_GROUP_MEMBER: usize = 63;

/// How long a (destination, TID) pairing is remembered so a late retry of
/// an old transaction cannot be mistaken for a new one.
pub const TID_RETENTION_MS: u32 = 24_000;

/// Number of tail retries routed over the alternate path.
pub const ALT_PATH_COUNT: u8 = 1;

/// Size of the transceiver-parameter block attached to deliveries.
pub const XCVR_BLOCK_LEN: usize = 7;

/// Static configuration of one stack instance. Queue lengths and pool
/// sizes are fixed at reset; per-message timing (retry count, transmit
/// timer) travels with each send request.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub version: PduVersion,
    /// Receive-record pool size.
    pub rr_count: usize,
    /// Remembered past destinations per priority lane.
    pub tid_entries: usize,
    pub net_in_len: usize,
    pub net_out_len: usize,
    /// Per-priority-lane application out-queue length.
    pub app_out_len: usize,
    pub resp_out_len: usize,
    pub app_in_len: usize,
    /// Completion-and-response queue length.
    pub event_len: usize,
    /// Receive-record timer: how long an RR absorbs retries.
    pub rcv_timer_ms: u32,
    /// Send hold-off after reset, letting peers age out our old TIDs.
    pub reset_delay_ms: u32,
    /// `delta_backlog` estimate used for broadcast sends.
    pub bcast_backlog: u8,
    /// Largest APDU the application input buffer accepts.
    pub app_in_buf: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            version: PduVersion::Legacy,
            rr_count: 16,
            tid_entries: 16,
            net_in_len: 8,
            net_out_len: 8,
            app_out_len: 4,
            resp_out_len: 4,
            app_in_len: 8,
            event_len: 8,
            rcv_timer_ms: 768,
            reset_delay_ms: 2_000,
            bcast_backlog: 15,
            app_in_buf: MAX_APDU,
        }
    }
}

impl StackConfig {
    /// A stack cannot run with zero-length queues or an empty RR pool.
    pub fn validate(&self) -> bool {
        self.rr_count > 0
            && self.tid_entries > 0
            && self.net_in_len > 0
            && self.net_out_len > 0
            && self.app_out_len > 0
            && self.resp_out_len > 0
            && self.app_in_len > 0
            && self.event_len > 0
            && self.app_in_buf <= MAX_APDU
    }
}
