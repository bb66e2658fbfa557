//! Transport layer: acknowledged and repeated service, the per-lane send
//! scheduler, retries with M_LIST reminders, and the shared receive-record
//! intake used by both the transport and session layers.

use tracing::{debug, warn};

use crate::bitmap::{MemberBits, MAX_M_LIST};
use crate::config::{ALT_PATH_COUNT, MAX_GROUP_MEMBER, XCVR_BLOCK_LEN};
use crate::rr::{RrKey, RrStatus, TransState};
use crate::stack::Stack;
use crate::tables::DomainEntry;
use crate::time::Millis;
use crate::tx::TxStatus;
use crate::ServiceType;
use lon_proto::{
    AddrMode, Apdu, Destination, NpduHeader, PduType, SpduHeader, SpduKind, SubnetNode,
    TpduHeader, TpduKind, TransId,
};

impl Stack {
    /// Dispatches a received TPDU.
    pub(crate) fn tp_receive(
        &mut self,
        header: &NpduHeader,
        domain_index: u8,
        body: &[u8],
        xcvr: &[u8; XCVR_BLOCK_LEN],
        now: Millis,
    ) {
        let Ok((tpdu, rest)) = TpduHeader::decode(body, header.version) else {
            self.stats.protocol_errors += 1;
            return;
        };
        match tpdu.kind {
            TpduKind::Ackd => self.receive_message(
                header,
                domain_index,
                ServiceType::Acked,
                tpdu.auth,
                tpdu.tid,
                rest,
                xcvr,
                now,
            ),
            TpduKind::UnackdRpt => self.receive_message(
                header,
                domain_index,
                ServiceType::Repeated,
                tpdu.auth,
                tpdu.tid,
                rest,
                xcvr,
                now,
            ),
            TpduKind::Ack => self.receive_ack(header, tpdu.tid, now),
            TpduKind::Reminder | TpduKind::RemMsg => self.receive_reminder(
                header,
                domain_index,
                ServiceType::Acked,
                tpdu.auth,
                tpdu.tid,
                tpdu.kind == TpduKind::RemMsg,
                rest,
                xcvr,
                now,
            ),
        }
    }

    /// Receive-record identity of an incoming message frame.
    fn rr_key(header: &NpduHeader, domain_index: u8) -> RrKey {
        let (mode, scope) = match header.dest {
            Destination::Broadcast { subnet } => (AddrMode::Broadcast, subnet),
            Destination::Group { group } => (AddrMode::Group, group),
            Destination::SubnetNode { .. } | Destination::GroupAck { .. } => {
                (AddrMode::SubnetNode, 0)
            }
            Destination::UniqueId { .. } => (AddrMode::UniqueId, 0),
        };
        RrKey {
            priority: header.priority,
            source: header.source,
            mode,
            domain_index,
            scope,
        }
    }

    /// Intake for a connection-oriented message (ACKD, UNACKD_RPT or
    /// REQUEST): duplicate suppression, record allocation, authentication
    /// hand-off and delivery.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn receive_message(
        &mut self,
        header: &NpduHeader,
        domain_index: u8,
        service: ServiceType,
        auth: bool,
        tid: TransId,
        apdu: &[u8],
        xcvr: &[u8; XCVR_BLOCK_LEN],
        now: Millis,
    ) {
        let Ok(apdu) = Apdu::from_slice(apdu) else {
            self.stats.protocol_errors += 1;
            return;
        };
        let key = Self::rr_key(header, domain_index);

        if let Some(idx) = self.rrs.find(&key) {
            let rr = self.rrs.slot(idx);
            if rr.tid == tid {
                if rr.apdu == apdu {
                    self.answer_duplicate(idx, now);
                } else {
                    // Same transaction number, different payload: not a
                    // retry of anything we hold.
                    self.stats.protocol_errors += 1;
                }
                return;
            }
            // The sender advanced the transaction number. A settled record
            // is taken over; one still processing its message drops the
            // newcomer (the sender will retry).
            if !rr.settled() {
                self.stats.protocol_errors += 1;
                return;
            }
            self.init_rr(idx, key, header, service, auth, tid, apdu, xcvr, now);
            return;
        }

        let Some(idx) = self.rrs.alloc() else {
            self.stats.missed_messages += 1;
            warn!("receive-record pool exhausted, message dropped");
            return;
        };
        self.init_rr(idx, key, header, service, auth, tid, apdu, xcvr, now);
    }

    /// Initialises a record for a fresh transaction, then either starts a
    /// challenge or delivers straight away.
    #[allow(clippy::too_many_arguments)]
    fn init_rr(
        &mut self,
        idx: usize,
        key: RrKey,
        header: &NpduHeader,
        service: ServiceType,
        auth: bool,
        tid: TransId,
        apdu: Apdu,
        xcvr: &[u8; XCVR_BLOCK_LEN],
        now: Millis,
    ) {
        let membership = (key.mode == AddrMode::Group)
            .then(|| self.tables.group_member(key.domain_index, key.scope))
            .flatten()
            .copied();
        let req_id = self.alloc_req_id();
        let rcv_timer_ms = self.cfg.rcv_timer_ms;

        let rr = self.rrs.slot_mut(idx);
        rr.status = match service {
            ServiceType::Request => RrStatus::Session,
            _ => RrStatus::Transport,
        };
        rr.key = key;
        rr.member = membership.map(|m| m.member).unwrap_or(0);
        rr.is_member = membership.is_some();
        rr.tid = tid;
        rr.version = header.version;
        rr.req_id = req_id;
        rr.state = TransState::JustReceived;
        rr.service = service;
        rr.alt_path = header.alt_path;
        rr.needs_auth = auth;
        rr.auth_ok = false;
        rr.apdu = apdu;
        rr.response = Apdu::empty();
        rr.has_response = false;
        rr.random = [0; 8];
        rr.xcvr = *xcvr;
        rr.rcv_timer.set(now, rcv_timer_ms);

        if auth {
            self.auth_start_challenge(idx, now);
        } else if self.deliver_rr(idx, now) && service == ServiceType::Acked {
            self.send_ack(idx);
        }
    }

    /// Re-answers a retry of a transaction we already hold. The record's
    /// state is never regressed.
    pub(crate) fn answer_duplicate(&mut self, idx: usize, now: Millis) {
        let (state, service, needs_auth) = {
            let rr = self.rrs.slot(idx);
            (rr.state, rr.service, rr.needs_auth)
        };
        match state {
            TransState::JustReceived => {
                // First processing never finished: challenge or delivery is
                // re-attempted.
                if needs_auth {
                    self.auth_start_challenge(idx, now);
                } else if self.deliver_rr(idx, now) && service == ServiceType::Acked {
                    self.send_ack(idx);
                }
            }
            TransState::Authenticating => self.auth_start_challenge(idx, now),
            TransState::Authenticated => {
                if self.deliver_rr(idx, now) && service == ServiceType::Acked {
                    self.send_ack(idx);
                }
            }
            TransState::Delivered => {
                if service == ServiceType::Acked {
                    self.send_ack(idx);
                }
                // Repeated: nothing to answer. Request: the application
                // has not responded yet; the retry is absorbed.
            }
            TransState::Responded => {
                self.reemit_cached_response(idx);
            }
            TransState::Done => {
                // Null-response or oversize-dropped transaction: absorbed
                // without emitting anything.
            }
        }
    }

    /// Acknowledges the message held in RR `idx` back to its originator.
    pub(crate) fn send_ack(&mut self, idx: usize) {
        let rr = self.rrs.slot(idx);
        let Some(domain) = self.tables.domain(rr.key.domain_index as usize).copied() else {
            return;
        };
        let dest = if rr.key.mode == AddrMode::Group {
            // A node that is not a member of the group delivers but does
            // not acknowledge.
            if !rr.is_member {
                return;
            }
            Destination::GroupAck {
                subnet: rr.key.source.subnet,
                node: rr.key.source.node,
                group: rr.key.scope,
                member: rr.member,
            }
        } else {
            Destination::SubnetNode {
                subnet: rr.key.source.subnet,
                node: rr.key.source.node,
            }
        };
        let header = NpduHeader {
            priority: rr.key.priority,
            // Locked so the ack returns on the carrier the message used.
            alt_path: rr.alt_path,
            delta_backlog: 0,
            version: rr.version,
            pdu_type: PduType::Tpdu,
            source: SubnetNode::new(domain.subnet, domain.node),
            dest,
            domain: domain.id,
        };
        let tpdu = TpduHeader {
            auth: false,
            kind: TpduKind::Ack,
            tid: rr.tid,
        };
        let mut enclosed = Vec::with_capacity(2);
        tpdu.encode_into(rr.version, &mut enclosed);
        self.emit_npdu(&header, &enclosed);
        // A full out-queue loses the ack; the sender's retry recovers it.
    }

    /// Processes an ACK addressed to our outgoing transaction.
    fn receive_ack(&mut self, header: &NpduHeader, tid: TransId, now: Millis) {
        let lane = usize::from(header.priority);
        let (tx_status, tx_dest, tx_domain_id) = {
            let tx = &self.tx[lane];
            (tx.status, tx.dest, tx.domain.id)
        };
        if tx_status != TxStatus::Transport
            || !self.tcs.validate(header.priority, tid)
            || self.tx[lane].tid != tid
            || tx_domain_id != header.domain
            || self.tx[lane].pending_completion.is_some()
        {
            self.stats.late_acks += 1;
            return;
        }

        match (tx_dest, header.dest) {
            (Destination::Group { group }, Destination::GroupAck { group: g, member, .. }) => {
                if g != group {
                    self.stats.late_acks += 1;
                    return;
                }
                if member as usize > MAX_GROUP_MEMBER {
                    self.stats.protocol_errors += 1;
                    return;
                }
                let tx = &mut self.tx[lane];
                if tx.acks.set(member as usize) {
                    tx.ack_count += 1;
                }
            }
            (Destination::SubnetNode { subnet, node }, Destination::SubnetNode { .. }) => {
                if header.source != SubnetNode::new(subnet, node) {
                    self.stats.late_acks += 1;
                    return;
                }
                let tx = &mut self.tx[lane];
                if tx.ack_count == 0 {
                    tx.ack_count = 1;
                }
            }
            (Destination::Broadcast { .. }, Destination::SubnetNode { .. }) => {
                self.tx[lane].ack_count = self.tx[lane].ack_count.saturating_add(1);
            }
            (Destination::UniqueId { .. }, Destination::SubnetNode { .. }) => {
                let tx = &mut self.tx[lane];
                if tx.ack_count == 0 {
                    tx.ack_count = 1;
                }
            }
            _ => {
                self.stats.late_acks += 1;
                return;
            }
        }

        if self.tx[lane].acks_complete() {
            self.terminate(header.priority, true);
        } else {
            let value = self.tx[lane].xmit_timer_value;
            self.tx[lane].xmit_timer.set(now, value);
        }
    }

    /// A reminder (with or without the message) for a multicast
    /// transaction we may hold.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn receive_reminder(
        &mut self,
        header: &NpduHeader,
        domain_index: u8,
        service: ServiceType,
        auth: bool,
        tid: TransId,
        carries_message: bool,
        body: &[u8],
        xcvr: &[u8; XCVR_BLOCK_LEN],
        now: Millis,
    ) {
        let Some((&mlen, rest)) = body.split_first() else {
            self.stats.protocol_errors += 1;
            return;
        };
        let mlen = mlen as usize;
        if rest.len() < mlen || mlen > MAX_M_LIST {
            self.stats.protocol_errors += 1;
            return;
        }
        let (mlist, apdu) = rest.split_at(mlen);
        let acked = MemberBits::from_m_list(mlist);

        if !matches!(header.dest, Destination::Group { .. }) {
            self.stats.protocol_errors += 1;
            return;
        }
        let key = Self::rr_key(header, domain_index);

        let Some(idx) = self.rrs.find(&key) else {
            if carries_message {
                // A REM_MSG self-contains the APDU and starts a record.
                self.receive_message(header, domain_index, service, auth, tid, apdu, xcvr, now);
            }
            return;
        };

        let rr = self.rrs.slot(idx);
        if rr.tid != tid {
            if carries_message && rr.settled() {
                self.receive_message(header, domain_index, service, auth, tid, apdu, xcvr, now);
            }
            return;
        }
        if carries_message && rr.apdu.as_slice() != apdu {
            self.stats.protocol_errors += 1;
            return;
        }
        // Our bit set means our ack or response already got through.
        if rr.is_member && acked.get(rr.member as usize) {
            return;
        }
        self.answer_duplicate(idx, now);
    }

    /// One send pass for a priority lane: deferred completions first, then
    /// a pending application response, then transmit-timer service, then a
    /// new transaction. At most one new frame is emitted per pass.
    pub(crate) fn lane_send(&mut self, priority: bool, now: Millis) {
        let lane = usize::from(priority);
        if self.tx[lane].pending_completion.is_some() {
            self.flush_pending_completion(priority);
            return;
        }
        if self.session_send_response(priority, now) {
            return;
        }
        if self.tx[lane].in_use() {
            if self.tx[lane].xmit_timer.expired(now) {
                self.retry_or_terminate(priority, now);
            }
            return;
        }
        if !self.app_out[lane].is_empty() && !self.net_out.is_full() {
            self.start_new(priority, now);
        }
    }

    /// Starts a new outgoing transaction from the lane's out-queue head.
    fn start_new(&mut self, priority: bool, now: Millis) {
        let lane = usize::from(priority);
        let Some(req) = self.app_out[lane].peek_head().copied() else {
            return;
        };

        // Destination and service validation; rejects fail the message
        // with a completion event, which needs queue room.
        let membership = match req.dest {
            Destination::Group { group } => {
                if matches!(req.service, ServiceType::Acked | ServiceType::Request)
                    && req.group_size as usize > MAX_GROUP_MEMBER + 1
                {
                    if self.fail_send(req.tag) {
                        self.app_out[lane].advance_head();
                    }
                    return;
                }
                self.domain_index_of(&req.domain)
                    .and_then(|di| self.tables.group_member(di, group))
                    .copied()
            }
            Destination::GroupAck { .. } => {
                // Not a valid way to originate a transaction.
                if self.fail_send(req.tag) {
                    self.app_out[lane].advance_head();
                }
                return;
            }
            _ => None,
        };

        let Some(domain) = self.resolve_domain(&req.domain) else {
            if self.fail_send(req.tag) {
                self.app_out[lane].advance_head();
            }
            return;
        };

        if req.service == ServiceType::Unacked {
            // No transaction state: one frame out, one successful
            // completion, both or neither.
            if self.events.is_full() {
                return;
            }
            let header = NpduHeader {
                priority,
                alt_path: req.alt_path,
                delta_backlog: 1,
                version: self.cfg.version,
                pdu_type: PduType::Apdu,
                source: SubnetNode::new(domain.subnet, domain.node),
                dest: req.dest,
                domain: domain.id,
            };
            if self.emit_npdu(&header, req.apdu.as_slice()) {
                self.app_out[lane].advance_head();
                self.complete(req.tag, true);
            }
            return;
        }

        let version = self.cfg.version;
        let Some(tid) = self
            .tcs
            .new_trans(priority, version, &domain.id, &req.dest, now)
        else {
            // Every TID-table slot is inside the retention window; the
            // message stays queued for a later pass.
            return;
        };

        let dest_count = match req.dest {
            Destination::Group { .. } => {
                req.group_size
                    .saturating_sub(u8::from(membership.is_some()))
                    .max(1)
            }
            _ => 1,
        };

        let tx = &mut self.tx[lane];
        tx.status = match req.service {
            ServiceType::Request => TxStatus::Session,
            _ => TxStatus::Transport,
        };
        tx.service = req.service;
        tx.tag = req.tag;
        tx.priority = priority;
        tx.dest = req.dest;
        tx.domain = domain;
        tx.version = version;
        tx.tid = tid;
        tx.acks.clear();
        tx.ack_count = 0;
        tx.dest_count = dest_count;
        tx.retries_left = req.retries;
        tx.xmit_timer_value = req.tx_timer_ms;
        tx.apdu = req.apdu;
        tx.auth = req.auth;
        tx.alt_path_requested = req.alt_path;
        tx.last_retry_delay_ms = req.last_retry_delay_ms;
        tx.alt_key = req.alt_key;
        tx.max_responses = req.max_responses;
        tx.responses_delivered = 0;
        tx.pending_completion = None;

        if self.emit_original(priority) {
            self.app_out[lane].advance_head();
            self.arm_xmit_timer(priority, now);
        } else {
            // Out-queue raced full; roll the record back and retry later.
            self.tx[lane].release();
            self.tcs.trans_done(priority);
        }
    }

    /// Queues a failure completion for a message rejected before any
    /// transaction started. False when the event queue is full (the
    /// message stays queued and the rejection repeats later).
    fn fail_send(&mut self, tag: u16) -> bool {
        if self.events.is_full() {
            return false;
        }
        self.complete(tag, false);
        true
    }

    /// The transmit timer fired: finish the transaction or send a retry.
    fn retry_or_terminate(&mut self, priority: bool, now: Millis) {
        let lane = usize::from(priority);
        let tx = &self.tx[lane];

        if tx.retries_left == 0 || tx.acks_complete() {
            let success = tx.service == ServiceType::Repeated || tx.acks_complete();
            if !success {
                self.stats.transaction_timeouts += 1;
                debug!(tid = %tx.tid, "transaction exhausted its retries");
            }
            self.terminate(priority, success);
            return;
        }

        if self.net_out.is_full() {
            // Local backpressure consumes a retry so tail latency stays
            // bounded.
            self.stats.lost_retries += 1;
            warn!("out-queue full, retry slot lost");
            let tx = &mut self.tx[lane];
            tx.retries_left -= 1;
            self.arm_xmit_timer(priority, now);
            return;
        }

        let reminders =
            self.tx[lane].is_multicast() && self.tx[lane].service != ServiceType::Repeated;
        if reminders {
            let mut mlist = [0u8; MAX_M_LIST];
            let mlen = self.tx[lane].acks.m_list(&mut mlist);
            if mlen <= 2 {
                if !self.emit_rem_msg(priority, &mlist[..mlen]) {
                    self.arm_xmit_timer(priority, now);
                    return;
                }
            } else {
                // Long member list: reminder and message go out as a pair.
                if self.net_out.room() < 2 {
                    // Deferred without spending the retry budget.
                    self.arm_xmit_timer(priority, now);
                    return;
                }
                if !self.emit_reminder(priority, &mlist[..mlen]) || !self.emit_original(priority) {
                    self.arm_xmit_timer(priority, now);
                    return;
                }
            }
        } else if !self.emit_original(priority) {
            self.arm_xmit_timer(priority, now);
            return;
        }

        self.tx[lane].retries_left -= 1;
        self.arm_xmit_timer(priority, now);
    }

    /// Arms the transmit timer, extending the final wait by the
    /// last-retry delay.
    fn arm_xmit_timer(&mut self, priority: bool, now: Millis) {
        let tx = &mut self.tx[usize::from(priority)];
        let mut value = tx.xmit_timer_value;
        if tx.retries_left == 0 {
            value += tx.last_retry_delay_ms as u32;
        }
        tx.xmit_timer.set(now, value);
    }

    fn tx_header(&self, tx_domain: &DomainEntry, priority: bool, pdu_type: PduType) -> NpduHeader {
        let lane = usize::from(priority);
        let tx = &self.tx[lane];
        let delta_backlog = match (&tx.service, &tx.dest) {
            (ServiceType::Repeated, _) => tx.retries_left.min(0x3F),
            (_, Destination::Broadcast { .. }) => self.cfg.bcast_backlog.min(0x3F),
            (_, Destination::Group { .. }) => tx.dest_count.min(0x3F),
            _ => 1,
        };
        NpduHeader {
            priority,
            alt_path: tx.alt_path_requested || tx.retries_left <= ALT_PATH_COUNT,
            delta_backlog,
            version: tx.version,
            pdu_type,
            source: SubnetNode::new(tx_domain.subnet, tx_domain.node),
            dest: tx.dest,
            domain: tx_domain.id,
        }
    }

    /// Emits the transaction's original PDU (initial send and plain
    /// retries).
    fn emit_original(&mut self, priority: bool) -> bool {
        let lane = usize::from(priority);
        let tx = &self.tx[lane];
        let domain = tx.domain;
        let mut enclosed = Vec::with_capacity(2 + tx.apdu.len());
        let pdu_type = match tx.service {
            ServiceType::Request => {
                SpduHeader {
                    auth: tx.auth,
                    kind: SpduKind::Request,
                    tid: tx.tid,
                }
                .encode_into(tx.version, &mut enclosed);
                PduType::Spdu
            }
            service => {
                TpduHeader {
                    auth: tx.auth,
                    kind: if service == ServiceType::Repeated {
                        TpduKind::UnackdRpt
                    } else {
                        TpduKind::Ackd
                    },
                    tid: tx.tid,
                }
                .encode_into(tx.version, &mut enclosed);
                PduType::Tpdu
            }
        };
        enclosed.extend_from_slice(self.tx[lane].apdu.as_slice());
        let header = self.tx_header(&domain, priority, pdu_type);
        self.emit_npdu(&header, &enclosed)
    }

    /// Emits a REM_MSG: reminder list and APDU in one frame.
    fn emit_rem_msg(&mut self, priority: bool, mlist: &[u8]) -> bool {
        let lane = usize::from(priority);
        let tx = &self.tx[lane];
        let domain = tx.domain;
        let mut enclosed = Vec::with_capacity(2 + 1 + mlist.len() + tx.apdu.len());
        let pdu_type = if tx.service == ServiceType::Request {
            SpduHeader {
                auth: tx.auth,
                kind: SpduKind::RemMsg,
                tid: tx.tid,
            }
            .encode_into(tx.version, &mut enclosed);
            PduType::Spdu
        } else {
            TpduHeader {
                auth: tx.auth,
                kind: TpduKind::RemMsg,
                tid: tx.tid,
            }
            .encode_into(tx.version, &mut enclosed);
            PduType::Tpdu
        };
        enclosed.push(mlist.len() as u8);
        enclosed.extend_from_slice(mlist);
        enclosed.extend_from_slice(self.tx[lane].apdu.as_slice());
        let header = self.tx_header(&domain, priority, pdu_type);
        self.emit_npdu(&header, &enclosed)
    }

    /// Emits a bare REMINDER (the message follows as its own frame).
    fn emit_reminder(&mut self, priority: bool, mlist: &[u8]) -> bool {
        let lane = usize::from(priority);
        let tx = &self.tx[lane];
        let domain = tx.domain;
        let mut enclosed = Vec::with_capacity(2 + 1 + mlist.len());
        let pdu_type = if tx.service == ServiceType::Request {
            SpduHeader {
                auth: tx.auth,
                kind: SpduKind::Reminder,
                tid: tx.tid,
            }
            .encode_into(tx.version, &mut enclosed);
            PduType::Spdu
        } else {
            TpduHeader {
                auth: tx.auth,
                kind: TpduKind::Reminder,
                tid: tx.tid,
            }
            .encode_into(tx.version, &mut enclosed);
            PduType::Tpdu
        };
        enclosed.push(mlist.len() as u8);
        enclosed.extend_from_slice(mlist);
        let header = self.tx_header(&domain, priority, pdu_type);
        self.emit_npdu(&header, &enclosed)
    }
}

