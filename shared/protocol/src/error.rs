//! Decode failures for wire formats.

use thiserror::Error;

/// Failures that can occur while decoding an RTP packet, an RTCP report,
/// or a control message from raw bytes.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    #[error("buffer too short: need at least {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown payload type {0}")]
    UnknownPayloadType(u8),

    #[error("malformed control message: address is not printable ASCII")]
    NonPrintableAddress,

    #[error("malformed control message: address missing leading '/sam/'")]
    BadAddressPrefix,

    #[error("malformed control message: address string not null-terminated")]
    UnterminatedAddress,

    #[error("malformed control message: type tag string not null-terminated")]
    UnterminatedTypeTag,

    #[error("malformed control message: unknown type tag '{0}'")]
    UnknownTypeTag(char),

    #[error("malformed control message: string argument not null-terminated")]
    UnterminatedStringArg,

    #[error("malformed control message: truncated argument {index} of type '{tag}'")]
    TruncatedArgument { index: usize, tag: char },
}
