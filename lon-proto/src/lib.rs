//! # LON Proto
//!
//! Wire-level types and the bit-exact codec for the LON (ISO/IEC 14908-1)
//! upper-layer PDUs: the NPDU header, the enclosed TPDU/SPDU/AuthPDU
//! headers, and the tagged address variants they carry.
//!
//! Header fields are packed with explicit shifts and masks; endianness and
//! bit positions are part of the wire contract, so no bitfield or derive
//! machinery is used here. The engine crate (`lon-tsa`) builds and parses
//! PDU bodies on top of these headers.

pub mod addr;
pub mod npdu;
pub mod pdu;

mod error;

pub use addr::{AddrMode, Destination, DomainId, SubnetNode};
pub use error::ProtoError;
pub use npdu::{NpduHeader, PduType, PduVersion};
pub use pdu::{Apdu, AuthHeader, AuthKind, SpduHeader, SpduKind, TpduHeader, TpduKind, TransId};

/// Largest APDU (opcode plus payload) carried by a single PDU.
pub const MAX_APDU: usize = 228;

/// Upper bound on an encoded NPDU: 2 header bytes, 2 source bytes, up to 7
/// destination bytes, up to 6 domain bytes, 2 TPDU header bytes, 3 reminder
/// bytes and the APDU.
pub const MAX_NPDU: usize = 2 + 2 + 7 + 6 + 2 + 3 + MAX_APDU;
