//! Transaction Control Sublayer.
//!
//! Assigns transaction numbers per destination, separately for the
//! priority and non-priority lanes, and guarantees a number is not reused
//! against the same destination within the retention window. The table of
//! past destinations exists for exactly one reason: a late retry of an old
//! transaction must never be accepted as part of a new one to the same
//! peer.

use crate::config::TID_RETENTION_MS;
use crate::time::Millis;
use lon_proto::{Destination, DomainId, PduVersion, TransId};

/// Destination identity as the TID table sees it. The unique-id form drops
/// the subnet routing hint; the others keep their addressing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TidKey {
    Broadcast(u8),
    Group(u8),
    Node(u8, u8),
    UniqueId([u8; 6]),
}

impl From<&Destination> for TidKey {
    fn from(dest: &Destination) -> Self {
        match *dest {
            Destination::Broadcast { subnet } => TidKey::Broadcast(subnet),
            Destination::Group { group } => TidKey::Group(group),
            Destination::SubnetNode { subnet, node }
            | Destination::GroupAck { subnet, node, .. } => TidKey::Node(subnet, node),
            Destination::UniqueId { unique_id, .. } => TidKey::UniqueId(unique_id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TidEntry {
    used: bool,
    domain: DomainId,
    key: TidKey,
    last_tid: TransId,
    first_used: Millis,
}

impl Default for TidEntry {
    fn default() -> Self {
        Self {
            used: false,
            domain: DomainId::empty(),
            key: TidKey::Broadcast(0),
            last_tid: TransId(0),
            first_used: Millis(0),
        }
    }
}

#[derive(Debug)]
struct TcsLane {
    current: TransId,
    in_progress: bool,
    table: Vec<TidEntry>,
}

/// Per-lane transaction-number control.
#[derive(Debug)]
pub struct Tcs {
    lanes: [TcsLane; 2],
}

impl Tcs {
    pub fn new(entries_per_lane: usize) -> Self {
        let lane = || TcsLane {
            current: TransId(0),
            in_progress: false,
            table: vec![TidEntry::default(); entries_per_lane],
        };
        Self {
            lanes: [lane(), lane()],
        }
    }

    /// Ages out table entries past the retention window. Run once per
    /// scheduler pass.
    pub fn tick(&mut self, now: Millis) {
        for lane in &mut self.lanes {
            for entry in &mut lane.table {
                if entry.used && now.since(entry.first_used) >= TID_RETENTION_MS as i32 {
                    entry.used = false;
                }
            }
        }
    }

    /// Obtains a transaction number for a new transaction to `dest`.
    /// Returns `None` when every table slot is held by a destination still
    /// inside the retention window (the caller leaves the message queued
    /// and tries again on a later pass).
    pub fn new_trans(
        &mut self,
        priority: bool,
        version: PduVersion,
        domain: &DomainId,
        dest: &Destination,
        now: Millis,
    ) -> Option<TransId> {
        let lane = &mut self.lanes[usize::from(priority)];
        let key = TidKey::from(dest);

        let found = lane
            .table
            .iter()
            .position(|e| e.used && e.domain == *domain && e.key == key);
        let idx = match found {
            Some(i) => i,
            None => {
                let i = lane.table.iter().position(|e| !e.used).or_else(|| {
                    lane.table
                        .iter()
                        .position(|e| now.since(e.first_used) >= TID_RETENTION_MS as i32)
                })?;
                let slot = &mut lane.table[i];
                slot.used = true;
                slot.domain = *domain;
                slot.key = key;
                slot.last_tid = lane.current;
                i
            }
        };
        let slot = &mut lane.table[idx];

        let mut tid = slot.last_tid.next(version);
        if tid == slot.last_tid {
            tid = tid.next(version);
        }
        slot.last_tid = tid;
        slot.first_used = now;

        lane.current = tid;
        lane.in_progress = true;
        Some(tid)
    }

    /// True when `tid` names the lane's transaction in progress.
    pub fn validate(&self, priority: bool, tid: TransId) -> bool {
        let lane = &self.lanes[usize::from(priority)];
        lane.in_progress && lane.current == tid
    }

    /// Marks the lane's transaction finished.
    pub fn trans_done(&mut self, priority: bool) {
        self.lanes[usize::from(priority)].in_progress = false;
    }
}
