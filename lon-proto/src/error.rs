use thiserror::Error;

/// Errors produced while decoding a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("frame truncated")]
    Truncated,
    #[error("reserved protocol version {0}")]
    ReservedVersion(u8),
    #[error("unknown TPDU kind {0}")]
    UnknownTpdu(u8),
    #[error("unknown SPDU kind {0}")]
    UnknownSpdu(u8),
    #[error("unknown AuthPDU kind {0}")]
    UnknownAuthPdu(u8),
    #[error("APDU larger than the buffer maximum")]
    ApduTooLarge,
}
