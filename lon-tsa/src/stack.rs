//! The stack context and its cooperative scheduler.
//!
//! All protocol state lives in one [`Stack`]; multi-stack deployments run
//! one scheduler per context. [`Stack::service`] performs one bounded
//! pass: TID-table aging, one receive dispatch, one send opportunity per
//! priority lane (priority first), then the receive-record timer sweep.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};

use crate::config::{StackConfig, XCVR_BLOCK_LEN};
use crate::queue::Ring;
use crate::rr::{RrPool, TransState};
use crate::stats::Stats;
use crate::tables::{DomainEntry, Tables};
use crate::tcs::Tcs;
use crate::time::{Millis, Timer};
use crate::tx::TxRecord;
use crate::{
    AppEvent, DomainRef, Indication, IncomingFrame, OutgoingFrame, ReqId, ResponseRequest,
    SendRequest, ServiceType, TsaError,
};
use lon_proto::{Apdu, DomainId, NpduHeader, PduType, MAX_NPDU};

/// One LON upper-layer protocol stack.
pub struct Stack {
    pub(crate) cfg: StackConfig,
    pub(crate) tables: Tables,
    pub(crate) stats: Stats,
    pub(crate) tcs: Tcs,
    /// One transmit record per lane, indexed by the priority flag.
    pub(crate) tx: [TxRecord; 2],
    pub(crate) rrs: RrPool,
    pub(crate) next_req_id: u16,
    pub(crate) prev_challenge: [u8; 8],
    pub(crate) rng: StdRng,
    pub(crate) xcvr_params: [u8; XCVR_BLOCK_LEN],

    pub(crate) net_in: Ring<IncomingFrame>,
    pub(crate) net_out: Ring<OutgoingFrame>,
    /// Application out-queues, indexed by the priority flag.
    pub(crate) app_out: [Ring<SendRequest>; 2],
    pub(crate) resp_out: Ring<ResponseRequest>,
    pub(crate) app_in: Ring<Indication>,
    pub(crate) events: Ring<AppEvent>,

    pub(crate) send_hold: bool,
    pub(crate) reset_timer: Timer,
}

impl Stack {
    /// Builds a stack and performs the power-up reset. Fails when the
    /// configuration cannot support a running stack.
    pub fn new(
        cfg: StackConfig,
        tables: Tables,
        rng: &mut dyn RngCore,
        now: Millis,
    ) -> Result<Self, TsaError> {
        if !cfg.validate() {
            return Err(TsaError::NotInitialized);
        }
        let mut stack = Self {
            tcs: Tcs::new(cfg.tid_entries),
            rrs: RrPool::new(cfg.rr_count),
            net_in: Ring::with_capacity(cfg.net_in_len),
            net_out: Ring::with_capacity(cfg.net_out_len),
            app_out: [
                Ring::with_capacity(cfg.app_out_len),
                Ring::with_capacity(cfg.app_out_len),
            ],
            resp_out: Ring::with_capacity(cfg.resp_out_len),
            app_in: Ring::with_capacity(cfg.app_in_len),
            events: Ring::with_capacity(cfg.event_len),
            cfg,
            tables,
            stats: Stats::default(),
            tx: [TxRecord::default(), TxRecord::default()],
            next_req_id: 0,
            prev_challenge: [0; 8],
            rng: StdRng::seed_from_u64(rng.next_u64()),
            xcvr_params: [0; XCVR_BLOCK_LEN],
            send_hold: false,
            reset_timer: Timer::new(),
        };
        stack.reset(now);
        Ok(stack)
    }

    /// Clears all transaction state and queues, then holds the send
    /// handlers off for the reset delay so peers can age out records that
    /// still reference our old transaction numbers. Reception keeps
    /// running through the hold.
    pub fn reset(&mut self, now: Millis) {
        self.tcs = Tcs::new(self.cfg.tid_entries);
        self.rrs.clear();
        self.tx = [TxRecord::default(), TxRecord::default()];
        self.net_in.clear();
        self.net_out.clear();
        self.app_out[0].clear();
        self.app_out[1].clear();
        self.resp_out.clear();
        self.app_in.clear();
        self.events.clear();
        self.send_hold = self.cfg.reset_delay_ms != 0;
        self.reset_timer.set(now, self.cfg.reset_delay_ms);
    }

    /// Queues an outgoing message.
    pub fn send(&mut self, req: SendRequest) -> Result<(), TsaError> {
        let lane = usize::from(req.priority);
        self.app_out[lane].push(req).map_err(|_| TsaError::QueueFull)
    }

    /// Queues the application's response to a delivered request.
    pub fn respond(&mut self, resp: ResponseRequest) -> Result<(), TsaError> {
        self.resp_out.push(resp).map_err(|_| TsaError::QueueFull)
    }

    /// Hands a received network frame to the stack.
    pub fn push_npdu(&mut self, frame: IncomingFrame) -> Result<(), TsaError> {
        self.net_in.push(frame).map_err(|_| TsaError::QueueFull)
    }

    /// Takes the next frame bound for the network layer.
    pub fn pop_npdu(&mut self) -> Option<OutgoingFrame> {
        self.net_out.pop()
    }

    /// Takes the next message delivery for the application.
    pub fn next_indication(&mut self) -> Option<Indication> {
        self.app_in.pop()
    }

    /// Takes the next completion or response event.
    pub fn next_event(&mut self) -> Option<AppEvent> {
        self.events.pop()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Network management's write window: between scheduler passes only.
    pub fn tables_mut(&mut self) -> &mut Tables {
        &mut self.tables
    }

    /// Installs the transceiver-parameter block appended to
    /// signal-strength responses.
    pub fn set_xcvr_params(&mut self, params: [u8; XCVR_BLOCK_LEN]) {
        self.xcvr_params = params;
    }

    /// One scheduler pass at tick `now`.
    pub fn service(&mut self, now: Millis) {
        self.tcs.tick(now);
        if self.send_hold && self.reset_timer.expired(now) {
            self.send_hold = false;
        }
        if let Some(frame) = self.net_in.pop() {
            self.dispatch(&frame, now);
        }
        if !self.send_hold {
            self.lane_send(true, now);
            self.lane_send(false, now);
        }
        self.rrs.sweep(now);
    }

    /// Routes one received frame to the owning layer.
    fn dispatch(&mut self, frame: &IncomingFrame, now: Millis) {
        let Ok((header, body)) = NpduHeader::decode(frame.as_slice()) else {
            self.stats.protocol_errors += 1;
            return;
        };
        let Some((domain_index, _)) = self.tables.match_domain(&header.domain) else {
            // Not one of our domains; nothing here can own the frame.
            self.stats.protocol_errors += 1;
            return;
        };
        match header.pdu_type {
            PduType::Apdu => self.deliver_unacked(&header, domain_index, body, &frame.xcvr),
            PduType::Tpdu => self.tp_receive(&header, domain_index, body, &frame.xcvr, now),
            PduType::Spdu => self.sn_receive(&header, domain_index, body, &frame.xcvr, now),
            PduType::AuthPdu => self.auth_receive(&header, domain_index, body, now),
        }
    }

    /// A bare APDU: deliver with no record behind it.
    fn deliver_unacked(
        &mut self,
        header: &NpduHeader,
        domain_index: u8,
        body: &[u8],
        xcvr: &[u8; XCVR_BLOCK_LEN],
    ) {
        let Ok(apdu) = Apdu::from_slice(body) else {
            self.stats.protocol_errors += 1;
            return;
        };
        if apdu.len() > self.cfg.app_in_buf {
            self.stats.protocol_errors += 1;
            return;
        }
        let indication = Indication {
            req_id: ReqId::NONE,
            service: ServiceType::Unacked,
            source: header.source,
            domain_index,
            priority: header.priority,
            alt_path: header.alt_path,
            authenticated: false,
            apdu,
            xcvr: *xcvr,
        };
        if self.app_in.push(indication).is_err() {
            self.stats.lost_messages += 1;
        }
    }

    /// Hands the message held in RR `idx` to the application. Returns true
    /// only when the indication was queued; the record then moves to
    /// Delivered.
    pub(crate) fn deliver_rr(&mut self, idx: usize, _now: Millis) -> bool {
        let rr = self.rrs.slot(idx);
        if rr.needs_auth && rr.state != TransState::Authenticated {
            return false;
        }
        if rr.apdu.len() > self.cfg.app_in_buf {
            // Undeliverable forever; finish the record so it only absorbs
            // retries from here on.
            warn!(len = rr.apdu.len(), "APDU exceeds the application buffer");
            self.rrs.slot_mut(idx).state = TransState::Done;
            return false;
        }
        if self.app_in.is_full() {
            // The sender's retry gets another chance.
            self.stats.lost_messages += 1;
            return false;
        }
        let rr = self.rrs.slot(idx);
        let indication = Indication {
            req_id: rr.req_id,
            service: rr.service,
            source: rr.key.source,
            domain_index: rr.key.domain_index,
            priority: rr.key.priority,
            alt_path: rr.alt_path,
            authenticated: rr.auth_ok,
            apdu: rr.apdu,
            xcvr: rr.xcvr,
        };
        let _ = self.app_in.push(indication);
        self.rrs.slot_mut(idx).state = TransState::Delivered;
        true
    }

    /// Encodes and queues one NPDU. False when the out-queue is full or
    /// the frame would not fit a network buffer.
    pub(crate) fn emit_npdu(&mut self, header: &NpduHeader, enclosed: &[u8]) -> bool {
        let bytes = header.encode(enclosed);
        if bytes.len() > MAX_NPDU {
            self.stats.protocol_errors += 1;
            return false;
        }
        let priority = header.priority;
        match self.net_out.peek_tail_mut() {
            Some(slot) => {
                slot.fill(&bytes, priority);
                self.net_out.advance_tail();
                true
            }
            None => false,
        }
    }

    /// Ends the lane's transaction, queueing exactly one completion event.
    /// A full event queue defers the termination; the record is retried at
    /// the head of each send pass until the queue drains.
    pub(crate) fn terminate(&mut self, priority: bool, success: bool) {
        let lane = usize::from(priority);
        let tag = self.tx[lane].tag;
        if self.events.push(AppEvent::Completion { tag, success }).is_err() {
            let tx = &mut self.tx[lane];
            tx.pending_completion = Some(success);
            tx.xmit_timer.stop();
            return;
        }
        debug!(tag, success, "transaction terminated");
        self.tx[lane].release();
        self.tcs.trans_done(priority);
    }

    /// Retries a termination deferred on a full event queue.
    pub(crate) fn flush_pending_completion(&mut self, priority: bool) {
        let lane = usize::from(priority);
        let Some(success) = self.tx[lane].pending_completion else {
            return;
        };
        let tag = self.tx[lane].tag;
        if self.events.push(AppEvent::Completion { tag, success }).is_ok() {
            self.tx[lane].release();
            self.tcs.trans_done(priority);
        }
    }

    /// Queues a completion event; callers have already checked for room.
    pub(crate) fn complete(&mut self, tag: u16, success: bool) {
        let _ = self.events.push(AppEvent::Completion { tag, success });
    }

    /// The next request id: monotonic, wrapping, never 0, never colliding
    /// with a record still held.
    pub(crate) fn alloc_req_id(&mut self) -> ReqId {
        loop {
            self.next_req_id = self.next_req_id.wrapping_add(1);
            if self.next_req_id == 0 {
                self.next_req_id = 1;
            }
            let candidate = ReqId(self.next_req_id);
            if self.rrs.by_req_id(candidate).is_none() {
                return candidate;
            }
        }
    }

    pub(crate) fn resolve_domain(&self, domain: &DomainRef) -> Option<DomainEntry> {
        match domain {
            DomainRef::Index(i) => self.tables.domain(*i as usize).copied(),
            DomainRef::Flex => Some(DomainEntry {
                id: DomainId::empty(),
                subnet: 0,
                node: 0,
                key: Default::default(),
            }),
            DomainRef::Explicit(entry) => Some(*entry),
        }
    }

    pub(crate) fn domain_index_of(&self, domain: &DomainRef) -> Option<u8> {
        match domain {
            DomainRef::Index(i) => self.tables.domain(*i as usize).map(|_| *i),
            _ => None,
        }
    }
}
