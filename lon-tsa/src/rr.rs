//! The receive-record pool.
//!
//! One slot tracks one incoming acknowledged/repeated/request transaction:
//! who sent it, its transaction number, the stored APDU (for duplicate
//! detection and for delayed delivery while authenticating), the cached
//! response, the challenge nonce and the receive timer. A slot is
//! identified by (priority, source, address mode, domain index, plus the
//! group for multicast or the destination subnet for broadcast).

use crate::config::XCVR_BLOCK_LEN;
use crate::time::{Millis, Timer};
use crate::{ReqId, ServiceType};
use lon_proto::{AddrMode, Apdu, PduVersion, SubnetNode, TransId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RrStatus {
    #[default]
    Unused,
    Transport,
    Session,
}

/// Progress of the incoming transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TransState {
    #[default]
    JustReceived,
    /// Challenge sent, awaiting the reply.
    Authenticating,
    /// Reply verified (or refuted); delivery may proceed.
    Authenticated,
    /// Handed to the application.
    Delivered,
    /// Response cached and emitted.
    Responded,
    /// Finished; the slot only absorbs retries until its timer expires.
    Done,
}

/// Identity of a receive record, as derived from an incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RrKey {
    pub priority: bool,
    pub source: SubnetNode,
    pub mode: AddrMode,
    pub domain_index: u8,
    /// Group id for multicast, destination subnet for broadcast, else 0.
    pub scope: u8,
}

#[derive(Debug, Clone)]
pub(crate) struct RrSlot {
    pub status: RrStatus,
    pub key: RrKey,
    /// Our member index within the destination group (2b ack source).
    pub member: u8,
    /// Whether we are a member at all (foreign-group traffic gets no ack).
    pub is_member: bool,

    pub tid: TransId,
    pub version: PduVersion,
    pub req_id: ReqId,
    pub state: TransState,
    pub service: ServiceType,

    pub alt_path: bool,
    pub needs_auth: bool,
    pub auth_ok: bool,

    pub apdu: Apdu,
    pub response: Apdu,
    pub has_response: bool,

    pub random: [u8; 8],
    pub xcvr: [u8; XCVR_BLOCK_LEN],
    pub rcv_timer: Timer,
}

impl Default for RrSlot {
    fn default() -> Self {
        Self {
            status: RrStatus::Unused,
            key: RrKey {
                priority: false,
                source: SubnetNode::default(),
                mode: AddrMode::SubnetNode,
                domain_index: 0,
                scope: 0,
            },
            member: 0,
            is_member: false,
            tid: TransId(0),
            version: PduVersion::Legacy,
            req_id: ReqId::NONE,
            state: TransState::JustReceived,
            service: ServiceType::Unacked,
            alt_path: false,
            needs_auth: false,
            auth_ok: false,
            apdu: Apdu::empty(),
            response: Apdu::empty(),
            has_response: false,
            random: [0; 8],
            xcvr: [0; XCVR_BLOCK_LEN],
            rcv_timer: Timer::new(),
        }
    }
}

impl RrSlot {
    pub fn in_use(&self) -> bool {
        self.status != RrStatus::Unused
    }

    /// A slot that has finished processing its current message and may be
    /// taken over by a new transaction from the same peer.
    pub fn settled(&self) -> bool {
        matches!(
            self.state,
            TransState::Delivered | TransState::Responded | TransState::Done
        )
    }

    pub fn release(&mut self) {
        *self = RrSlot::default();
    }
}

/// Fixed pool of receive records, scanned linearly.
#[derive(Debug)]
pub(crate) struct RrPool {
    slots: Vec<RrSlot>,
}

impl RrPool {
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![RrSlot::default(); count],
        }
    }

    /// Index of the slot matching an incoming frame's identity.
    pub fn find(&self, key: &RrKey) -> Option<usize> {
        self.slots.iter().position(|s| s.in_use() && s.key == *key)
    }

    /// Index of a free slot.
    pub fn alloc(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.in_use())
    }

    pub fn by_req_id(&self, req_id: ReqId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use() && s.req_id == req_id)
    }

    /// Index of the authenticating slot a reply re-identifies: matching
    /// transaction number, source, and group scope (or non-group mode).
    pub fn find_authenticating(
        &self,
        priority: bool,
        source: SubnetNode,
        domain_index: u8,
        tid: TransId,
        group: Option<u8>,
    ) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.in_use()
                && s.state == TransState::Authenticating
                && s.key.priority == priority
                && s.key.source == source
                && s.key.domain_index == domain_index
                && s.tid == tid
                && match group {
                    Some(g) => s.key.mode == AddrMode::Group && s.key.scope == g,
                    None => s.key.mode != AddrMode::Group,
                }
        })
    }

    pub fn slot(&self, idx: usize) -> &RrSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut RrSlot {
        &mut self.slots[idx]
    }

    /// Releases every slot whose receive timer has expired.
    pub fn sweep(&mut self, now: Millis) {
        for slot in &mut self.slots {
            if slot.in_use() && slot.rcv_timer.expired(now) {
                slot.release();
            }
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.release();
        }
    }
}
