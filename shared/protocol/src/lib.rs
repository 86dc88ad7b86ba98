//! Wire codecs for the Streaming Audio Manager.
//!
//! This crate has no I/O and no async runtime: it only knows how to turn
//! bytes into typed packets/messages and back. Transport (sockets, the
//! playout queue, the control dispatcher) lives in `sam-server`.

pub mod error;
pub mod osc;
pub mod rtcp;
pub mod rtp;

pub use error::CodecError;
