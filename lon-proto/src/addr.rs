//! Network addresses as tagged variants.
//!
//! The on-wire representation collapses these into a 2-bit address-format
//! field plus positional bytes; the split between format 2a (subnet/node)
//! and 2b (multicast-ack) rides on the high bit of the source node byte.
//! Encoding lives in [`crate::npdu`]; this module only defines the shapes.

/// A subnet/node pair as carried in the NPDU source field.
///
/// Subnet 0 is "unknown"; node values use the low 7 bits (the high bit of
/// the node byte is the 2a/2b selector on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubnetNode {
    pub subnet: u8,
    pub node: u8,
}

impl SubnetNode {
    pub fn new(subnet: u8, node: u8) -> Self {
        Self { subnet, node }
    }
}

/// A domain identifier: up to six bytes plus an explicit length.
///
/// Valid lengths are 0, 1, 3 and 6, matching the 2-bit length code of the
/// NPDU header (0, 1, 2, 3 respectively).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DomainId {
    bytes: [u8; 6],
    len: u8,
}

impl DomainId {
    /// Builds a domain id, truncating `id` to six bytes. Lengths other than
    /// 0, 1, 3 and 6 are not representable on the wire and are rounded down
    /// to the nearest representable length.
    pub fn new(id: &[u8]) -> Self {
        let len = match id.len() {
            0 => 0,
            1 | 2 => 1,
            3..=5 => 3,
            _ => 6,
        };
        let mut bytes = [0u8; 6];
        bytes[..len].copy_from_slice(&id[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// The zero-length domain.
    pub const fn empty() -> Self {
        Self {
            bytes: [0; 6],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The 2-bit on-wire length code.
    pub fn length_code(&self) -> u8 {
        match self.len {
            0 => 0,
            1 => 1,
            3 => 2,
            _ => 3,
        }
    }

    /// Domain byte count for a 2-bit length code.
    pub fn length_from_code(code: u8) -> usize {
        match code & 0x03 {
            0 => 0,
            1 => 1,
            2 => 3,
            _ => 6,
        }
    }
}

/// The address-mode discriminant, kept alongside received frames so that
/// acks and responses can be paired with the transaction that produced the
/// original message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Broadcast,
    Group,
    SubnetNode,
    GroupAck,
    UniqueId,
}

/// Where a PDU is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Subnet broadcast; subnet 0 addresses the whole domain.
    Broadcast { subnet: u8 },
    /// Multicast to a group.
    Group { group: u8 },
    /// Format 2a: a single node by subnet/node.
    SubnetNode { subnet: u8, node: u8 },
    /// Format 2b: a single node, answering on behalf of a group member.
    GroupAck {
        subnet: u8,
        node: u8,
        group: u8,
        member: u8,
    },
    /// A single node by its 48-bit unique id, routed via a subnet hint.
    UniqueId { subnet: u8, unique_id: [u8; 6] },
}

impl Destination {
    /// The 2-bit on-wire address format.
    pub fn format(&self) -> u8 {
        match self {
            Destination::Broadcast { .. } => 0,
            Destination::Group { .. } => 1,
            Destination::SubnetNode { .. } | Destination::GroupAck { .. } => 2,
            Destination::UniqueId { .. } => 3,
        }
    }

    pub fn mode(&self) -> AddrMode {
        match self {
            Destination::Broadcast { .. } => AddrMode::Broadcast,
            Destination::Group { .. } => AddrMode::Group,
            Destination::SubnetNode { .. } => AddrMode::SubnetNode,
            Destination::GroupAck { .. } => AddrMode::GroupAck,
            Destination::UniqueId { .. } => AddrMode::UniqueId,
        }
    }

    /// True for the two multicast shapes.
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            Destination::Group { .. } | Destination::GroupAck { .. }
        )
    }
}
