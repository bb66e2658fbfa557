//! NPDU header codec.
//!
//! Layout (all fields big-endian bit order within a byte):
//!
//! ```text
//! byte 0: P A B B B B B B   P=priority, A=alt path, B=delta backlog
//! byte 1: V V T T F F L L   V=version, T=pdu type, F=address format,
//!                           L=domain length code
//! byte 2: source subnet
//! byte 3: s n n n n n n n   s=2a/2b selector (1 = 2a), n=source node
//! ...     destination bytes per address format
//! ...     domain id bytes per length code
//! ...     enclosed PDU
//! ```

use crate::addr::{Destination, DomainId, SubnetNode};
use crate::error::ProtoError;

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], ProtoError> {
    if buf.len() < *pos + n {
        return Err(ProtoError::Truncated);
    }
    let slice = &buf[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

/// Protocol version field: 0 is the legacy 4-bit-TID encoding, 2 the
/// enhanced 12-bit-TID encoding. Values 1 and 3 are reserved and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PduVersion {
    #[default]
    Legacy = 0,
    Enhanced = 2,
}

impl PduVersion {
    /// Extra TID byte carried by each enclosed PDU header.
    pub fn tid_bytes(self) -> usize {
        match self {
            PduVersion::Legacy => 0,
            PduVersion::Enhanced => 1,
        }
    }

    /// Largest transaction number representable in this version.
    pub fn tid_mask(self) -> u16 {
        match self {
            PduVersion::Legacy => 0x000F,
            PduVersion::Enhanced => 0x0FFF,
        }
    }
}

/// The kind of PDU enclosed in an NPDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Tpdu = 0,
    Spdu = 1,
    AuthPdu = 2,
    /// A bare APDU: unacknowledged service, no transport state.
    Apdu = 3,
}

/// A decoded (or to-be-encoded) NPDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpduHeader {
    pub priority: bool,
    pub alt_path: bool,
    pub delta_backlog: u8,
    pub version: PduVersion,
    pub pdu_type: PduType,
    pub source: SubnetNode,
    pub dest: Destination,
    pub domain: DomainId,
}

impl NpduHeader {
    /// Appends the encoded header followed by `enclosed` to `out`.
    pub fn encode_into(&self, enclosed: &[u8], out: &mut Vec<u8>) {
        out.push(
            (self.priority as u8) << 7 | (self.alt_path as u8) << 6 | (self.delta_backlog & 0x3F),
        );
        out.push(
            (self.version as u8) << 6
                | (self.pdu_type as u8) << 4
                | self.dest.format() << 2
                | self.domain.length_code(),
        );
        out.push(self.source.subnet);
        // The selector bit is meaningful only for format 2; it is set for
        // every format except 2b so that a plain source node always reads
        // as 2a.
        let selector = !matches!(self.dest, Destination::GroupAck { .. });
        out.push((selector as u8) << 7 | (self.source.node & 0x7F));
        match self.dest {
            Destination::Broadcast { subnet } => out.push(subnet),
            Destination::Group { group } => out.push(group),
            Destination::SubnetNode { subnet, node } => {
                out.push(subnet);
                out.push(node);
            }
            Destination::GroupAck {
                subnet,
                node,
                group,
                member,
            } => {
                out.push(subnet);
                out.push(node);
                out.push(group);
                out.push(member);
            }
            Destination::UniqueId { subnet, unique_id } => {
                out.push(subnet);
                out.extend_from_slice(&unique_id);
            }
        }
        out.extend_from_slice(self.domain.as_slice());
        out.extend_from_slice(enclosed);
    }

    pub fn encode(&self, enclosed: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(17 + enclosed.len());
        self.encode_into(enclosed, &mut out);
        out
    }

    /// Decodes a header, returning it together with the enclosed PDU bytes.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), ProtoError> {
        if buf.len() < 4 {
            return Err(ProtoError::Truncated);
        }
        let priority = buf[0] & 0x80 != 0;
        let alt_path = buf[0] & 0x40 != 0;
        let delta_backlog = buf[0] & 0x3F;
        let version = match buf[1] >> 6 {
            0 => PduVersion::Legacy,
            2 => PduVersion::Enhanced,
            v => return Err(ProtoError::ReservedVersion(v)),
        };
        let pdu_type = match (buf[1] >> 4) & 0x03 {
            0 => PduType::Tpdu,
            1 => PduType::Spdu,
            2 => PduType::AuthPdu,
            _ => PduType::Apdu,
        };
        let format = (buf[1] >> 2) & 0x03;
        let domain_len = DomainId::length_from_code(buf[1]);
        let source = SubnetNode::new(buf[2], buf[3] & 0x7F);
        let is_2a = buf[3] & 0x80 != 0;

        let mut pos = 4;
        let dest = match format {
            0 => Destination::Broadcast {
                subnet: take(buf, &mut pos, 1)?[0],
            },
            1 => Destination::Group {
                group: take(buf, &mut pos, 1)?[0],
            },
            2 => {
                if is_2a {
                    let d = take(buf, &mut pos, 2)?;
                    Destination::SubnetNode {
                        subnet: d[0],
                        node: d[1],
                    }
                } else {
                    let d = take(buf, &mut pos, 4)?;
                    Destination::GroupAck {
                        subnet: d[0],
                        node: d[1],
                        group: d[2],
                        member: d[3],
                    }
                }
            }
            _ => {
                let d = take(buf, &mut pos, 7)?;
                let mut unique_id = [0u8; 6];
                unique_id.copy_from_slice(&d[1..7]);
                Destination::UniqueId {
                    subnet: d[0],
                    unique_id,
                }
            }
        };
        let domain = DomainId::new(take(buf, &mut pos, domain_len)?);

        Ok((
            Self {
                priority,
                alt_path,
                delta_backlog,
                version,
                pdu_type,
                source,
                dest,
                domain,
            },
            &buf[pos..],
        ))
    }
}
