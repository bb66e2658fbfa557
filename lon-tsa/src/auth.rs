//! Challenge-response authentication, interleaved with transport and
//! session traffic.
//!
//! A message carrying the auth flag is held in its receive record while
//! the receiver challenges the sender with a fresh nonce; the sender
//! answers with an 8-byte MAC over the nonce and the guarded APDU, keyed
//! by the shared domain key. The OMA variant uses the 96-bit key form and
//! additionally binds the challenger's address into the MAC.

use rand::RngCore;

use crate::rr::TransState;
use crate::stack::Stack;
use crate::tables::AuthKey;
use crate::time::Millis;
use crate::ServiceType;
use lon_proto::{
    AddrMode, AuthHeader, AuthKind, Destination, DomainId, NpduHeader, PduType, SubnetNode,
};

/// MAC output length.
pub const MAC_LEN: usize = 8;

/// Length of the address block an OMA MAC binds.
pub const OMA_ADDR_LEN: usize = 20;

/// One mixing pass over the 8 state bytes. The key bit for each position
/// selects addition or subtraction of the complemented, left-rotated
/// neighbour byte.
fn mix_pass(state: &mut [u8; MAC_LEN], key_byte: u8) {
    for i in 0..MAC_LEN {
        let rotated = state[(i + 1) % MAC_LEN].rotate_left(1);
        let c = !rotated;
        state[i] = if key_byte & (1 << i) != 0 {
            state[i].wrapping_add(c)
        } else {
            state[i].wrapping_sub(c)
        };
    }
}

fn absorb<I: Iterator<Item = u8>>(state: &mut [u8; MAC_LEN], schedule: &[u8], message: I) {
    let mut block = [0u8; MAC_LEN];
    let mut fill = 0;
    let flush = |state: &mut [u8; MAC_LEN], block: &mut [u8; MAC_LEN]| {
        for i in 0..MAC_LEN {
            state[i] ^= block[i];
        }
        for &kb in schedule {
            mix_pass(state, kb);
        }
        *block = [0; MAC_LEN];
    };
    let mut total: u16 = 0;
    for byte in message {
        block[fill] = byte;
        fill += 1;
        total = total.wrapping_add(1);
        if fill == MAC_LEN {
            flush(state, &mut block);
            fill = 0;
        }
    }
    // The trailing block is always processed, zero padded and with the
    // message length folded in: an empty message still passes through the
    // full key schedule, and a payload is distinct from the same payload
    // with trailing zeros.
    block[6] ^= total as u8;
    block[7] ^= (total >> 8) as u8;
    flush(state, &mut block);
}

/// Computes the authentication MAC.
///
/// Standard keys schedule their six bytes once per block. OMA keys
/// schedule twelve bytes and then the first six again, prefix the message
/// with the challenger's address block, and feed the APDU in reverse byte
/// order. Both sides of a transaction must call this with identical
/// inputs.
pub fn mac(
    key: &AuthKey,
    nonce: &[u8; MAC_LEN],
    apdu: &[u8],
    challenger: Option<&[u8; OMA_ADDR_LEN]>,
) -> [u8; MAC_LEN] {
    let mut state = *nonce;
    match key {
        AuthKey::Std(k) => absorb(&mut state, k, apdu.iter().copied()),
        AuthKey::Oma(k) => {
            let mut schedule = [0u8; 18];
            schedule[..12].copy_from_slice(k);
            schedule[12..].copy_from_slice(&k[..6]);
            let addr = challenger.map(|a| &a[..]).unwrap_or(&[]);
            let message = addr.iter().copied().chain(apdu.iter().rev().copied());
            absorb(&mut state, &schedule, message);
        }
    }
    state
}

/// The challenger-address block an OMA MAC binds: the domain and the
/// subnet/node of the node issuing the challenge, zero padded.
pub fn challenger_block(domain: &DomainId, challenger: SubnetNode) -> [u8; OMA_ADDR_LEN] {
    let mut block = [0u8; OMA_ADDR_LEN];
    block[0] = domain.len() as u8;
    block[1..1 + domain.len()].copy_from_slice(domain.as_slice());
    block[7] = challenger.subnet;
    block[8] = challenger.node;
    block
}

impl Stack {
    /// Fresh challenge nonce: RNG output folded with the previous
    /// challenge and the tick, so successive nonces differ even under a
    /// weak RNG.
    pub(crate) fn make_nonce(&mut self, now: Millis) -> [u8; MAC_LEN] {
        let mut nonce = [0u8; MAC_LEN];
        self.rng.fill_bytes(&mut nonce);
        let ticks = now.0.to_le_bytes();
        for (i, byte) in nonce.iter_mut().enumerate() {
            *byte ^= self.prev_challenge[i] ^ ticks[i % 4];
        }
        self.prev_challenge = nonce;
        nonce
    }

    /// Challenges the originator of the message held in RR `idx`. On the
    /// first attempt a nonce is generated and stored; retries of the
    /// guarded message re-issue the same nonce.
    pub(crate) fn auth_start_challenge(&mut self, idx: usize, now: Millis) {
        let fresh = self.rrs.slot(idx).state == TransState::JustReceived;
        let nonce = if fresh {
            self.make_nonce(now)
        } else {
            self.rrs.slot(idx).random
        };

        let rr = self.rrs.slot(idx);
        let Some(domain) = self.tables.domain(rr.key.domain_index as usize).copied() else {
            return;
        };
        let kind = if domain.key.is_oma() {
            AuthKind::ChallengeOma
        } else {
            AuthKind::Challenge
        };
        let group = (rr.key.mode == AddrMode::Group).then_some(rr.key.scope);
        let dest = match group {
            Some(g) => Destination::GroupAck {
                subnet: rr.key.source.subnet,
                node: rr.key.source.node,
                group: g,
                member: rr.member,
            },
            None => Destination::SubnetNode {
                subnet: rr.key.source.subnet,
                node: rr.key.source.node,
            },
        };
        let header = NpduHeader {
            priority: rr.key.priority,
            alt_path: rr.alt_path,
            delta_backlog: 0,
            version: rr.version,
            pdu_type: PduType::AuthPdu,
            source: SubnetNode::new(domain.subnet, domain.node),
            dest,
            domain: domain.id,
        };
        let auth = AuthHeader {
            kind,
            tid: rr.tid,
            group,
        };
        let mut enclosed = Vec::with_capacity(2 + 1 + MAC_LEN);
        auth.encode_into(rr.version, &mut enclosed);
        enclosed.extend_from_slice(&nonce);

        if self.emit_npdu(&header, &enclosed) {
            let rr = self.rrs.slot_mut(idx);
            rr.random = nonce;
            rr.state = TransState::Authenticating;
        }
        // On a full out-queue the record stays JustReceived; the sender's
        // retry triggers another attempt.
    }

    /// Dispatches a received AuthPDU.
    pub(crate) fn auth_receive(
        &mut self,
        header: &NpduHeader,
        domain_index: u8,
        body: &[u8],
        now: Millis,
    ) {
        let Ok((auth, rest)) = AuthHeader::decode(body, header.version) else {
            self.stats.protocol_errors += 1;
            return;
        };
        if rest.len() < MAC_LEN {
            self.stats.protocol_errors += 1;
            return;
        }
        let mut payload = [0u8; MAC_LEN];
        payload.copy_from_slice(&rest[..MAC_LEN]);

        if auth.kind.is_challenge() {
            self.auth_answer_challenge(header, &auth, payload, now);
        } else {
            self.auth_verify_reply(header, domain_index, &auth, payload, now);
        }
    }

    /// A peer challenged our outgoing transaction: compute the MAC and
    /// reply.
    fn auth_answer_challenge(
        &mut self,
        header: &NpduHeader,
        auth: &AuthHeader,
        nonce: [u8; MAC_LEN],
        now: Millis,
    ) {
        let lane = usize::from(header.priority);
        let tx = &self.tx[lane];
        if !tx.in_use() || !tx.auth || tx.tid != auth.tid {
            self.stats.late_acks += 1;
            return;
        }
        if tx.domain.id != header.domain {
            self.stats.late_acks += 1;
            return;
        }
        match (auth.group, &tx.dest) {
            (Some(g), Destination::Group { group }) if g == *group => {}
            (None, d) if !matches!(d, Destination::Group { .. }) => {}
            _ => {
                self.stats.late_acks += 1;
                return;
            }
        }

        let key = tx.alt_key.unwrap_or(tx.domain.key);
        let wants_oma = auth.kind.is_oma();
        if wants_oma != key.is_oma() {
            self.stats.protocol_errors += 1;
            return;
        }
        let block = challenger_block(&tx.domain.id, header.source);
        let computed = mac(
            &key,
            &nonce,
            tx.apdu.as_slice(),
            wants_oma.then_some(&block),
        );

        let reply_kind = if wants_oma {
            AuthKind::ReplyOma
        } else {
            AuthKind::Reply
        };
        let reply_header = NpduHeader {
            priority: header.priority,
            alt_path: header.alt_path,
            delta_backlog: 0,
            version: tx.version,
            pdu_type: PduType::AuthPdu,
            source: SubnetNode::new(tx.domain.subnet, tx.domain.node),
            dest: Destination::SubnetNode {
                subnet: header.source.subnet,
                node: header.source.node,
            },
            domain: tx.domain.id,
        };
        let reply = AuthHeader {
            kind: reply_kind,
            tid: tx.tid,
            group: auth.group,
        };
        let mut enclosed = Vec::with_capacity(2 + 1 + MAC_LEN);
        reply.encode_into(tx.version, &mut enclosed);
        enclosed.extend_from_slice(&computed);

        if self.emit_npdu(&reply_header, &enclosed) {
            let value = self.tx[lane].xmit_timer_value;
            self.tx[lane].xmit_timer.set(now, value);
        }
    }

    /// The originator answered our challenge: verify the MAC, then let the
    /// held message proceed.
    fn auth_verify_reply(
        &mut self,
        header: &NpduHeader,
        domain_index: u8,
        auth: &AuthHeader,
        carried: [u8; MAC_LEN],
        now: Millis,
    ) {
        let Some(idx) = self.rrs.find_authenticating(
            header.priority,
            header.source,
            domain_index,
            auth.tid,
            auth.group,
        ) else {
            self.stats.late_acks += 1;
            return;
        };
        let Some(domain) = self.tables.domain(domain_index as usize).copied() else {
            return;
        };
        if auth.kind.is_oma() != domain.key.is_oma() {
            self.stats.protocol_errors += 1;
            return;
        }

        let block = challenger_block(&domain.id, SubnetNode::new(domain.subnet, domain.node));
        let rr = self.rrs.slot(idx);
        let expected = mac(
            &domain.key,
            &rr.random,
            rr.apdu.as_slice(),
            auth.kind.is_oma().then_some(&block),
        );

        let ok = expected == carried;
        if !ok {
            self.stats.auth_failures += 1;
            tracing::warn!(tid = %auth.tid, "authentication reply MAC mismatch");
        }
        let rr = self.rrs.slot_mut(idx);
        rr.auth_ok = ok;
        rr.state = TransState::Authenticated;

        let service = self.rrs.slot(idx).service;
        if self.deliver_rr(idx, now) && service == ServiceType::Acked {
            self.send_ack(idx);
        }
    }
}
