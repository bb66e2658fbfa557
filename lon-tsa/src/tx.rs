//! The transmit record: one outgoing transaction per priority lane.

use crate::bitmap::MemberBits;
use crate::tables::{AuthKey, DomainEntry};
use crate::time::Timer;
use crate::ServiceType;
use lon_proto::{Apdu, Destination, PduVersion, TransId};

/// Which layer owns the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TxStatus {
    #[default]
    Unused,
    Transport,
    Session,
}

/// State of one outgoing acknowledged/repeated/request transaction.
#[derive(Debug, Clone)]
pub(crate) struct TxRecord {
    pub status: TxStatus,
    pub service: ServiceType,
    pub tag: u16,
    pub priority: bool,

    pub dest: Destination,
    pub domain: DomainEntry,
    pub version: PduVersion,
    pub tid: TransId,

    /// Members heard from (acks or responses), and how many we need.
    pub acks: MemberBits,
    pub ack_count: u8,
    pub dest_count: u8,

    pub retries_left: u8,
    pub xmit_timer_value: u32,
    pub xmit_timer: Timer,

    pub apdu: Apdu,
    pub auth: bool,
    pub alt_path_requested: bool,
    pub last_retry_delay_ms: u16,
    pub alt_key: Option<AuthKey>,

    /// Broadcast requests: first-N-wins response budget.
    pub max_responses: u8,
    pub responses_delivered: u8,

    /// Termination blocked on a full completion queue; retried each pass.
    pub pending_completion: Option<bool>,
}

impl Default for TxRecord {
    fn default() -> Self {
        Self {
            status: TxStatus::Unused,
            service: ServiceType::Unacked,
            tag: 0,
            priority: false,
            dest: Destination::Broadcast { subnet: 0 },
            domain: DomainEntry::default(),
            version: PduVersion::Legacy,
            tid: TransId(0),
            acks: MemberBits::new(),
            ack_count: 0,
            dest_count: 0,
            retries_left: 0,
            xmit_timer_value: 0,
            xmit_timer: Timer::new(),
            apdu: Apdu::empty(),
            auth: false,
            alt_path_requested: false,
            last_retry_delay_ms: 0,
            alt_key: None,
            max_responses: 0,
            responses_delivered: 0,
            pending_completion: None,
        }
    }
}

impl TxRecord {
    pub fn in_use(&self) -> bool {
        self.status != TxStatus::Unused
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.dest, Destination::Broadcast { .. })
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self.dest, Destination::Group { .. })
    }

    /// Enough peers heard from to call the transaction successful.
    pub fn acks_complete(&self) -> bool {
        match self.service {
            ServiceType::Repeated | ServiceType::Unacked => false,
            ServiceType::Acked => {
                if self.is_broadcast() {
                    self.ack_count >= 1
                } else {
                    self.ack_count == self.dest_count
                }
            }
            ServiceType::Request => {
                if self.is_broadcast() {
                    self.responses_delivered >= 1
                } else {
                    self.ack_count == self.dest_count
                }
            }
        }
    }

    pub fn release(&mut self) {
        *self = TxRecord::default();
    }
}
