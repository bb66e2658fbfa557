//! Session layer: request/response with per-record response caching,
//! null responses and flex-domain responses.

use tracing::debug;

use crate::config::{MAX_GROUP_MEMBER, XCVR_BLOCK_LEN};
use crate::rr::{RrStatus, TransState};
use crate::stack::Stack;
use crate::time::Millis;
use crate::tx::TxStatus;
use crate::{AppEvent, ServiceType};
use lon_proto::{
    Apdu, Destination, NpduHeader, PduType, SpduHeader, SpduKind, SubnetNode, TransId, MAX_APDU,
};

/// Response opcode that gets the local transceiver parameters appended on
/// delivery: the answering node measured our signal, we attach how we
/// heard it, and the application sees both directions.
const XCVR_STATUS_RESPONSE: u8 = 0x41;

impl Stack {
    /// Dispatches a received SPDU.
    pub(crate) fn sn_receive(
        &mut self,
        header: &NpduHeader,
        domain_index: u8,
        body: &[u8],
        xcvr: &[u8; XCVR_BLOCK_LEN],
        now: Millis,
    ) {
        let Ok((spdu, rest)) = SpduHeader::decode(body, header.version) else {
            self.stats.protocol_errors += 1;
            return;
        };
        match spdu.kind {
            SpduKind::Request => self.receive_message(
                header,
                domain_index,
                ServiceType::Request,
                spdu.auth,
                spdu.tid,
                rest,
                xcvr,
                now,
            ),
            SpduKind::Response => self.receive_response(header, spdu.tid, rest, now),
            SpduKind::Reminder | SpduKind::RemMsg => self.receive_reminder(
                header,
                domain_index,
                ServiceType::Request,
                spdu.auth,
                spdu.tid,
                spdu.kind == SpduKind::RemMsg,
                rest,
                xcvr,
                now,
            ),
        }
    }

    /// A response for our outgoing request.
    fn receive_response(&mut self, header: &NpduHeader, tid: TransId, body: &[u8], now: Millis) {
        let lane = usize::from(header.priority);
        let (tx_status, tx_dest, tx_domain_id) = {
            let tx = &self.tx[lane];
            (tx.status, tx.dest, tx.domain.id)
        };
        if tx_status != TxStatus::Session
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
                // Each member's response is delivered at most once.
                if self.tx[lane].acks.get(member as usize) {
                    return;
                }
                if !self.deliver_response(lane, header.source, body) {
                    return;
                }
                let tx = &mut self.tx[lane];
                tx.acks.set(member as usize);
                tx.ack_count += 1;
                if tx.acks_complete() {
                    self.terminate(header.priority, true);
                } else {
                    let value = self.tx[lane].xmit_timer_value;
                    self.tx[lane].xmit_timer.set(now, value);
                }
            }
            (Destination::Broadcast { .. }, Destination::SubnetNode { .. }) => {
                let tx = &self.tx[lane];
                if tx.responses_delivered >= tx.max_responses {
                    // First N win; the rest vanish without a trace.
                    return;
                }
                if !self.deliver_response(lane, header.source, body) {
                    return;
                }
                let tx = &mut self.tx[lane];
                tx.responses_delivered += 1;
                if tx.responses_delivered >= tx.max_responses {
                    self.terminate(header.priority, true);
                }
            }
            (
                Destination::SubnetNode { .. } | Destination::UniqueId { .. },
                Destination::SubnetNode { .. },
            ) => {
                if self.tx[lane].ack_count != 0 {
                    return;
                }
                if !self.deliver_response(lane, header.source, body) {
                    return;
                }
                self.tx[lane].ack_count = 1;
                self.terminate(header.priority, true);
            }
            _ => {
                self.stats.late_acks += 1;
            }
        }
    }

    /// Hands a response to the application. False when the event queue has
    /// no room; the caller leaves the transaction state untouched so a
    /// retry can elicit the cached response again.
    fn deliver_response(&mut self, lane: usize, source: SubnetNode, body: &[u8]) -> bool {
        if self.events.is_full() {
            self.stats.lost_messages += 1;
            return false;
        }
        let mut apdu = match Apdu::from_slice(body) {
            Ok(a) => a,
            Err(_) => {
                self.stats.protocol_errors += 1;
                return false;
            }
        };
        if apdu.opcode() == Some(XCVR_STATUS_RESPONSE) {
            apdu = append_xcvr(&apdu, &self.xcvr_params);
        }
        let tag = self.tx[lane].tag;
        let _ = self.events.push(AppEvent::Response { tag, source, apdu });
        true
    }

    /// Serves the response out-queue head if it belongs to this lane.
    /// Returns true when a frame was emitted.
    pub(crate) fn session_send_response(&mut self, priority: bool, _now: Millis) -> bool {
        let Some(resp) = self.resp_out.peek_head().copied() else {
            return false;
        };
        let Some(idx) = self.rrs.by_req_id(resp.req_id) else {
            // The record aged out before the application answered.
            self.resp_out.advance_head();
            self.stats.stale_responses += 1;
            return false;
        };
        {
            let rr = self.rrs.slot(idx);
            if rr.key.priority != priority {
                return false;
            }
            if rr.status != RrStatus::Session {
                self.resp_out.advance_head();
                self.stats.stale_responses += 1;
                return false;
            }
        }

        if resp.null {
            // The transaction ends without a wire byte; the record stays
            // to absorb retries until its timer expires.
            let rr = self.rrs.slot_mut(idx);
            rr.state = TransState::Done;
            rr.has_response = false;
            self.resp_out.advance_head();
            debug!(req_id = resp.req_id.0, "null response, transaction done");
            return false;
        }

        if self.net_out.is_full() {
            return false;
        }
        {
            let rr = self.rrs.slot_mut(idx);
            rr.response = resp.apdu;
            rr.has_response = true;
        }
        let sent = self.emit_response(idx, resp.flex_domain);
        if sent {
            let rr = self.rrs.slot_mut(idx);
            rr.state = TransState::Responded;
        }
        self.resp_out.advance_head();
        sent
    }

    /// Emits the cached response for a retried request.
    pub(crate) fn reemit_cached_response(&mut self, idx: usize) -> bool {
        if !self.rrs.slot(idx).has_response {
            return false;
        }
        self.emit_response(idx, false)
    }

    /// Builds and emits the RESPONSE SPDU for RR `idx`. A flex-domain
    /// response keeps the request's domain but originates from 0/0.
    fn emit_response(&mut self, idx: usize, flex: bool) -> bool {
        let rr = self.rrs.slot(idx);
        let Some(domain) = self.tables.domain(rr.key.domain_index as usize).copied() else {
            return false;
        };
        let source = if flex {
            SubnetNode::new(0, 0)
        } else {
            SubnetNode::new(domain.subnet, domain.node)
        };
        let dest = if rr.key.mode == lon_proto::AddrMode::Group {
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
            alt_path: rr.alt_path,
            delta_backlog: 0,
            version: rr.version,
            pdu_type: PduType::Spdu,
            source,
            dest,
            domain: domain.id,
        };
        // Responses are never authenticated.
        let spdu = SpduHeader {
            auth: false,
            kind: SpduKind::Response,
            tid: rr.tid,
        };
        let mut enclosed = Vec::with_capacity(2 + rr.response.len());
        spdu.encode_into(rr.version, &mut enclosed);
        enclosed.extend_from_slice(rr.response.as_slice());
        self.emit_npdu(&header, &enclosed)
    }
}

/// Appends the local transceiver block to a signal-strength response.
fn append_xcvr(apdu: &Apdu, params: &[u8; XCVR_BLOCK_LEN]) -> Apdu {
    let mut bytes = [0u8; MAX_APDU];
    let len = apdu.len().min(MAX_APDU - XCVR_BLOCK_LEN);
    bytes[..len].copy_from_slice(&apdu.as_slice()[..len]);
    bytes[len..len + XCVR_BLOCK_LEN].copy_from_slice(params);
    Apdu::from_slice(&bytes[..len + XCVR_BLOCK_LEN]).unwrap_or(*apdu)
}
