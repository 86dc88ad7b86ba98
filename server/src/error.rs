//! Error taxonomy for the server: transport, protocol, admission, resource,
//! timeout, and peer-loss failures. The audio callback never returns one of
//! these — it counts and logs at a throttled rate instead.

use thiserror::Error;

/// Wire error codes sent back to clients on `regdeny`/`deny` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorCode {
    Default = 0,
    VersionMismatch = 1,
    MaxClients = 2,
    NoFreeOutput = 3,
    InvalidId = 4,
    InvalidType = 5,
}

impl WireErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Error)]
pub enum SamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed control message: {0}")]
    MalformedMessage(#[from] sam_protocol::CodecError),

    #[error("registration denied: {0:?}")]
    RequestDenied(WireErrorCode),

    #[error("no free output channel available")]
    NoFreeOutput,

    #[error("request timed out")]
    Timeout,

    #[error("invalid client id {0}")]
    InvalidId(i32),

    #[error("invalid rendering type {0}")]
    InvalidType(i32),
}

pub type Result<T> = std::result::Result<T, SamError>;
