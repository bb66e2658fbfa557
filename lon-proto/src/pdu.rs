//! Enclosed PDU headers (TPDU, SPDU, AuthPDU) and the APDU container.
//!
//! The first byte of every enclosed PDU packs a flag bit, a 3-bit kind and
//! the transaction number:
//!
//! ```text
//! f k k k t t t t   f = auth flag (TPDU/SPDU) or group-format (AuthPDU)
//!                   k = kind, t = TID bits
//! ```
//!
//! Legacy frames carry the whole 4-bit TID in `t`; enhanced frames carry
//! the high four bits of a 12-bit TID there and the low eight in the next
//! byte.

use crate::error::ProtoError;
use crate::npdu::PduVersion;
use crate::MAX_APDU;

/// A transaction number: 4 bits in legacy mode, 12 bits in enhanced mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TransId(pub u16);

impl TransId {
    /// The successor TID under the given version's modulus.
    pub fn next(self, version: PduVersion) -> Self {
        TransId(self.0.wrapping_add(1) & version.tid_mask())
    }
}

impl std::fmt::Display for TransId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An application payload: opcode byte plus data, stored inline so queue
/// items stay plain data.
#[derive(Clone, Copy)]
pub struct Apdu {
    data: [u8; MAX_APDU],
    len: u8,
}

impl Apdu {
    pub const fn empty() -> Self {
        Self {
            data: [0; MAX_APDU],
            len: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() > MAX_APDU {
            return Err(ProtoError::ApduTooLarge);
        }
        let mut data = [0u8; MAX_APDU];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            data,
            len: bytes.len() as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The opcode byte, if any.
    pub fn opcode(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }
}

impl Default for Apdu {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Apdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Apdu {}

impl std::fmt::Debug for Apdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Apdu({:02x?})", self.as_slice())
    }
}

/// TPDU kinds (3-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpduKind {
    Ackd = 0,
    UnackdRpt = 1,
    Ack = 2,
    Reminder = 4,
    RemMsg = 5,
}

/// SPDU kinds (3-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpduKind {
    Request = 0,
    Response = 2,
    Reminder = 4,
    RemMsg = 5,
}

/// AuthPDU kinds (3-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Challenge = 0,
    ChallengeOma = 1,
    Reply = 2,
    ReplyOma = 3,
}

impl AuthKind {
    pub fn is_challenge(self) -> bool {
        matches!(self, AuthKind::Challenge | AuthKind::ChallengeOma)
    }

    pub fn is_oma(self) -> bool {
        matches!(self, AuthKind::ChallengeOma | AuthKind::ReplyOma)
    }
}

fn encode_first(flag: bool, kind: u8, tid: TransId, version: PduVersion, out: &mut Vec<u8>) {
    match version {
        PduVersion::Legacy => {
            out.push((flag as u8) << 7 | kind << 4 | (tid.0 as u8 & 0x0F));
        }
        PduVersion::Enhanced => {
            out.push((flag as u8) << 7 | kind << 4 | ((tid.0 >> 8) as u8 & 0x0F));
            out.push(tid.0 as u8);
        }
    }
}

fn decode_first(buf: &[u8], version: PduVersion) -> Result<(bool, u8, TransId, usize), ProtoError> {
    if buf.len() < 1 + version.tid_bytes() {
        return Err(ProtoError::Truncated);
    }
    let flag = buf[0] & 0x80 != 0;
    let kind = (buf[0] >> 4) & 0x07;
    let tid = match version {
        PduVersion::Legacy => TransId((buf[0] & 0x0F) as u16),
        PduVersion::Enhanced => TransId(((buf[0] & 0x0F) as u16) << 8 | buf[1] as u16),
    };
    Ok((flag, kind, tid, 1 + version.tid_bytes()))
}

/// A TPDU header: auth flag, kind, transaction number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpduHeader {
    pub auth: bool,
    pub kind: TpduKind,
    pub tid: TransId,
}

impl TpduHeader {
    pub fn encode_into(&self, version: PduVersion, out: &mut Vec<u8>) {
        encode_first(self.auth, self.kind as u8, self.tid, version, out);
    }

    pub fn decode(buf: &[u8], version: PduVersion) -> Result<(Self, &[u8]), ProtoError> {
        let (auth, kind, tid, used) = decode_first(buf, version)?;
        let kind = match kind {
            0 => TpduKind::Ackd,
            1 => TpduKind::UnackdRpt,
            2 => TpduKind::Ack,
            4 => TpduKind::Reminder,
            5 => TpduKind::RemMsg,
            k => return Err(ProtoError::UnknownTpdu(k)),
        };
        Ok((Self { auth, kind, tid }, &buf[used..]))
    }
}

/// An SPDU header: auth flag, kind, transaction number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpduHeader {
    pub auth: bool,
    pub kind: SpduKind,
    pub tid: TransId,
}

impl SpduHeader {
    pub fn encode_into(&self, version: PduVersion, out: &mut Vec<u8>) {
        encode_first(self.auth, self.kind as u8, self.tid, version, out);
    }

    pub fn decode(buf: &[u8], version: PduVersion) -> Result<(Self, &[u8]), ProtoError> {
        let (auth, kind, tid, used) = decode_first(buf, version)?;
        let kind = match kind {
            0 => SpduKind::Request,
            2 => SpduKind::Response,
            4 => SpduKind::Reminder,
            5 => SpduKind::RemMsg,
            k => return Err(ProtoError::UnknownSpdu(k)),
        };
        Ok((Self { auth, kind, tid }, &buf[used..]))
    }
}

/// An AuthPDU header.
///
/// `group` carries the original transaction's group id when the guarded
/// message was multicast; the flag bit on the wire says whether the group
/// byte is present at the start of the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHeader {
    pub kind: AuthKind,
    pub tid: TransId,
    pub group: Option<u8>,
}

impl AuthHeader {
    pub fn encode_into(&self, version: PduVersion, out: &mut Vec<u8>) {
        encode_first(self.group.is_some(), self.kind as u8, self.tid, version, out);
        if let Some(group) = self.group {
            out.push(group);
        }
    }

    pub fn decode(buf: &[u8], version: PduVersion) -> Result<(Self, &[u8]), ProtoError> {
        let (group_fmt, kind, tid, mut used) = decode_first(buf, version)?;
        let kind = match kind {
            0 => AuthKind::Challenge,
            1 => AuthKind::ChallengeOma,
            2 => AuthKind::Reply,
            3 => AuthKind::ReplyOma,
            k => return Err(ProtoError::UnknownAuthPdu(k)),
        };
        let group = if group_fmt {
            let g = *buf.get(used).ok_or(ProtoError::Truncated)?;
            used += 1;
            Some(g)
        } else {
            None
        };
        Ok((Self { kind, tid, group }, &buf[used..]))
    }
}
