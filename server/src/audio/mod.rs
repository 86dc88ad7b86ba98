//! The audio driver boundary.
//!
//! `AudioInterface` is the capability set the design notes call out for the
//! source's `AudioInterface -> {Virtual, Jack}` hierarchy: `sample_rate`,
//! `buffer_size`, `output_ports`, `set_callback`, `start`, `stop`. A real
//! driver (`CpalInterface`) and an in-process one used by tests and
//! headless runs (`VirtualInterface`) both implement it.

pub mod cpal_interface;
pub mod virtual_interface;

pub use cpal_interface::CpalInterface;
pub use virtual_interface::VirtualInterface;

use std::sync::Arc;

/// Realtime audio callback signature: one invocation per block, given the
/// number of output ports and frames per block. The callback writes
/// `frames` interleaved samples into each of `outputs.len()` port buffers.
/// Must not allocate or block.
pub type AudioCallback = Box<dyn FnMut(&mut [Vec<f32>], u64) + Send>;

/// An opaque real-time audio device: sample rate, buffer size, a fixed set
/// of output ports, and a periodic callback. Never owns mixing logic.
pub trait AudioInterface: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn buffer_size(&self) -> usize;
    /// Number of available output ports; bounds the discrete-channel count.
    fn output_ports(&self) -> usize;
    /// Install the block callback. Must be called before `start`.
    fn set_callback(&mut self, callback: AudioCallback);
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
    /// Monotonic, non-wrapping sample count since the driver started.
    fn current_sample_time(&self) -> u64;
}

/// Shared handle to whichever interface is active, used by components that
/// only need to read the clock (e.g. the RTP receiver stamping arrival time).
pub type SharedClock = Arc<dyn Fn() -> u64 + Send + Sync>;
