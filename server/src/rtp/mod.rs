//! RTP transport: C2 (sender), C3 (receiver + playout queue).

pub mod network;
pub mod queue;
pub mod receiver;
pub mod sender;

pub use queue::{wrapping_le, wrapping_lt, PlayoutQueue, QueuedPacket};
pub use receiver::{DropReason, ReceiverConfig, ReceiverStats, MAX_DROPOUT, MAX_LATE, MAX_MISORDER};
pub use sender::RtpSender;
