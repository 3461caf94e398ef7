use thiserror::Error;

/// Decoder failures. Every variant that can point at the offending
/// byte carries its offset from the start of the frame; the enclosing
/// channel logs it and drops the connection.
#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("malformed frame at byte {pos}: {what}")]
    MalformedFrame { pos: usize, what: &'static str },
    #[error("unknown field type 0x{ty:02X} at byte {pos}")]
    UnknownType { ty: u8, pos: usize },
    #[error("truncated value at byte {pos}: need {need}, have {have}")]
    TruncatedValue { pos: usize, need: usize, have: usize },
    #[error("unsupported protocol byte 0x{0:02X}")]
    UnsupportedProtocol(u8),
}

/// Memory-mapped store failures (LVC / chart / tape open paths).
/// A failed open leaves the store inert.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: signature mismatch, got {got:?}")]
    Signature { path: String, got: String },
    #[error("{path}: file truncated, need {need} bytes, have {have}")]
    Truncated { path: String, need: u64, have: u64 },
    #[error("lock wait exceeded {0:?}")]
    TimedOut(std::time::Duration),
}

#[derive(Error, Debug, PartialEq)]
pub enum TapeError {
    #[error("end of tape")]
    EndOfTape,
    #[error("position {0} outside tape data region")]
    BadPosition(u64),
}
