//! The mix/effects kernel (C4): per-client volume/mute/solo/delay applied
//! with click-free ramps, plus input/output metering.

pub mod channel;

pub use channel::{MeterSnapshot, MixKernel};
