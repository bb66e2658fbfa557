//! # LON TSA
//!
//! The transport, session and authentication engine of the LON
//! (ISO/IEC 14908-1) upper layers: concurrent multi-destination
//! transactions, duplicate suppression, ordered retransmission with
//! group-acknowledgement bitmaps, and challenge-response authentication
//! interleaved with normal traffic, on top of an unreliable datagram
//! channel.
//!
//! ## Architecture
//!
//! The engine is sans-IO and single-threaded cooperative. One [`Stack`]
//! holds all state; [`Stack::service`] runs one bounded scheduler pass per
//! call with the current millisecond tick passed in. Everything crosses
//! the boundary through fixed-capacity queues: network frames in and out,
//! application sends, responses, deliveries and completion events. No
//! handler suspends; a runtime that wants a thread or a task wraps the
//! scheduler, it never lives inside it.
//!
//! - **Reliability**: acknowledged and repeated service with per-member
//!   ack bitmaps and M_LIST reminders on multicast retries.
//! - **Sessions**: request/response with per-record response caching, so
//!   a retried request is answered with the identical bytes.
//! - **Authentication**: legacy challenge-response MAC, standard and OMA
//!   variants, usable under either layer.

pub mod auth;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod queue;
pub mod stack;
pub mod stats;
pub mod tables;
pub mod tcs;
pub mod time;

pub(crate) mod rr;
pub(crate) mod session;
pub(crate) mod transport;
pub(crate) mod tx;

use lon_proto::{Apdu, Destination, SubnetNode, MAX_NPDU};

use crate::config::XCVR_BLOCK_LEN;
use crate::tables::{AuthKey, DomainEntry};

pub use crate::config::StackConfig;
pub use crate::error::TsaError;
pub use crate::stack::Stack;
pub use crate::stats::Stats;
pub use crate::time::Millis;

/// The service class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceType {
    /// Fire-and-forget, no transport state on either side.
    #[default]
    Unacked,
    /// Sent `retries + 1` times, delivered once, never acknowledged.
    Repeated,
    /// Acknowledged end-to-end.
    Acked,
    /// Request expecting an application response.
    Request,
}

/// Handle pairing a delivered request with the application's response.
/// Never 0 for a held receive record; 0 marks a delivery with no record
/// behind it (unacknowledged service).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReqId(pub u16);

impl ReqId {
    pub const NONE: ReqId = ReqId(0);
}

/// Which domain an outgoing message travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRef {
    /// A configured domain-table index.
    Index(u8),
    /// The flex pseudo-domain: zero-length id, source 0/0.
    Flex,
    /// A caller-supplied entry (proxy traffic derives the domain from the
    /// destination instead of the local table).
    Explicit(DomainEntry),
}

/// An outgoing message as the application queues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    /// Echoed in the completion event.
    pub tag: u16,
    pub service: ServiceType,
    pub dest: Destination,
    pub domain: DomainRef,
    pub priority: bool,
    /// Request authenticated delivery (the peer will challenge us).
    pub auth: bool,
    pub alt_path: bool,
    pub retries: u8,
    /// Transmit timer for Acked/Request, repeat timer for Repeated.
    pub tx_timer_ms: u32,
    /// Extra wait added to the final retry interval (proxy tail).
    pub last_retry_delay_ms: u16,
    /// Self-inclusive size of the destination group (multicast only).
    pub group_size: u8,
    /// Broadcast requests: deliver this many responses, then terminate.
    pub max_responses: u8,
    /// Overrides the domain key when answering challenges for this
    /// message.
    pub alt_key: Option<AuthKey>,
    pub apdu: Apdu,
}

impl Default for SendRequest {
    fn default() -> Self {
        Self {
            tag: 0,
            service: ServiceType::Unacked,
            dest: Destination::Broadcast { subnet: 0 },
            domain: DomainRef::Index(0),
            priority: false,
            auth: false,
            alt_path: false,
            retries: 3,
            tx_timer_ms: 96,
            last_retry_delay_ms: 0,
            group_size: 0,
            max_responses: 1,
            alt_key: None,
            apdu: Apdu::empty(),
        }
    }
}

/// The application's answer to a delivered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseRequest {
    pub req_id: ReqId,
    /// Finish the transaction without emitting anything.
    pub null: bool,
    /// Send the response as originating from no configured address
    /// (source 0/0).
    pub flex_domain: bool,
    pub apdu: Apdu,
}

/// A message handed up to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indication {
    pub req_id: ReqId,
    pub service: ServiceType,
    pub source: SubnetNode,
    pub domain_index: u8,
    pub priority: bool,
    pub alt_path: bool,
    pub authenticated: bool,
    pub apdu: Apdu,
    /// Transceiver parameters the link layer attached to the frame.
    pub xcvr: [u8; XCVR_BLOCK_LEN],
}

impl Default for Indication {
    fn default() -> Self {
        Self {
            req_id: ReqId::NONE,
            service: ServiceType::Unacked,
            source: SubnetNode::default(),
            domain_index: 0,
            priority: false,
            alt_path: false,
            authenticated: false,
            apdu: Apdu::empty(),
            xcvr: [0; XCVR_BLOCK_LEN],
        }
    }
}

/// Completion-and-response queue items. Exactly one completion is
/// delivered per originated Acked/Repeated/Request message; responses for
/// a request always precede its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    Completion {
        tag: u16,
        success: bool,
    },
    Response {
        tag: u16,
        source: SubnetNode,
        apdu: Apdu,
    },
}

impl Default for AppEvent {
    fn default() -> Self {
        AppEvent::Completion {
            tag: 0,
            success: false,
        }
    }
}

/// A raw frame from the network layer, with whatever transceiver block
/// the link driver attached.
#[derive(Debug, Clone, Copy)]
pub struct IncomingFrame {
    pub data: [u8; MAX_NPDU],
    pub len: u16,
    pub xcvr: [u8; XCVR_BLOCK_LEN],
}

impl IncomingFrame {
    pub fn new(bytes: &[u8]) -> Result<Self, TsaError> {
        if bytes.len() > MAX_NPDU {
            return Err(TsaError::FrameTooLarge);
        }
        let mut data = [0u8; MAX_NPDU];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            data,
            len: bytes.len() as u16,
            xcvr: [0; XCVR_BLOCK_LEN],
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl Default for IncomingFrame {
    fn default() -> Self {
        Self {
            data: [0; MAX_NPDU],
            len: 0,
            xcvr: [0; XCVR_BLOCK_LEN],
        }
    }
}

/// An encoded NPDU bound for the network layer. Priority, alternate path
/// and backlog ride in the first header byte; the flag here picks the
/// outgoing channel queue.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingFrame {
    pub data: [u8; MAX_NPDU],
    pub len: u16,
    pub priority: bool,
}

impl OutgoingFrame {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub(crate) fn fill(&mut self, bytes: &[u8], priority: bool) {
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len() as u16;
        self.priority = priority;
    }
}

impl Default for OutgoingFrame {
    fn default() -> Self {
        Self {
            data: [0; MAX_NPDU],
            len: 0,
            priority: false,
        }
    }
}
