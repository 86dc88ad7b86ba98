//! The mix/effects kernel (C4): one instance per client session, applied
//! identically to every one of the session's channels. A circular delay
//! line, a sample-accurate gain ramp (mute/solo-mute included), and
//! input/output metering. Control-plane values are double-buffered
//! (`_next` written by the control thread, `_current` consumed by the
//! audio thread) following the same atomic-bit-pattern trick as the
//! teacher's master bus.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Circular delay line, pre-allocated to `delay_max` so the audio thread
/// never resizes it.
struct DelayLine {
    buffer: Vec<f32>,
    write_pos: usize,
}

impl DelayLine {
    fn new(delay_max: usize) -> Self {
        Self {
            buffer: vec![0.0; delay_max.max(1)],
            write_pos: 0,
        }
    }

    fn write_read(&mut self, input: f32, delay: usize) -> f32 {
        let len = self.buffer.len();
        let delay = delay.min(len - 1);
        self.buffer[self.write_pos] = input;
        let read_pos = (self.write_pos + len - delay) % len;
        let out = self.buffer[read_pos];
        self.write_pos = (self.write_pos + 1) % len;
        out
    }
}

struct ChannelMeter {
    rms_in_bits: AtomicU32,
    peak_in_bits: AtomicU32,
    rms_out_bits: AtomicU32,
    peak_out_bits: AtomicU32,
}

impl ChannelMeter {
    fn new() -> Self {
        Self {
            rms_in_bits: AtomicU32::new(0),
            peak_in_bits: AtomicU32::new(0),
            rms_out_bits: AtomicU32::new(0),
            peak_out_bits: AtomicU32::new(0),
        }
    }

    fn update(&self, rms_in: f32, peak_in: f32, rms_out: f32, peak_out: f32) {
        self.rms_in_bits.store(rms_in.to_bits(), Ordering::Relaxed);
        self.rms_out_bits.store(rms_out.to_bits(), Ordering::Relaxed);
        let held_in = f32::from_bits(self.peak_in_bits.load(Ordering::Relaxed));
        if peak_in > held_in {
            self.peak_in_bits.store(peak_in.to_bits(), Ordering::Relaxed);
        }
        let held_out = f32::from_bits(self.peak_out_bits.load(Ordering::Relaxed));
        if peak_out > held_out {
            self.peak_out_bits.store(peak_out.to_bits(), Ordering::Relaxed);
        }
    }

    /// Read the published values and reset the peak envelope.
    fn publish(&self) -> MeterSnapshot {
        let snapshot = MeterSnapshot {
            rms_in: f32::from_bits(self.rms_in_bits.load(Ordering::Relaxed)),
            peak_in: f32::from_bits(self.peak_in_bits.swap(0, Ordering::Relaxed)),
            rms_out: f32::from_bits(self.rms_out_bits.load(Ordering::Relaxed)),
            peak_out: f32::from_bits(self.peak_out_bits.swap(0, Ordering::Relaxed)),
        };
        snapshot
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeterSnapshot {
    pub rms_in: f32,
    pub peak_in: f32,
    pub rms_out: f32,
    pub peak_out: f32,
}

/// Per-client gain/mute/solo/delay kernel, channel-independent.
pub struct MixKernel {
    channels: usize,
    delay_max: usize,
    delay_lines: Vec<DelayLine>,
    meters: Vec<ChannelMeter>,

    volume_current_bits: AtomicU32,
    volume_next_bits: AtomicU32,
    mute_current: AtomicBool,
    mute_next: AtomicBool,
    solo_current: AtomicBool,
    solo_next: AtomicBool,
    delay_current: AtomicU32,
    delay_next: AtomicU32,
}

impl MixKernel {
    pub fn new(channels: usize, delay_max: usize) -> Self {
        Self {
            channels,
            delay_max,
            delay_lines: (0..channels).map(|_| DelayLine::new(delay_max)).collect(),
            meters: (0..channels).map(|_| ChannelMeter::new()).collect(),
            volume_current_bits: AtomicU32::new(1.0f32.to_bits()),
            volume_next_bits: AtomicU32::new(1.0f32.to_bits()),
            mute_current: AtomicBool::new(false),
            mute_next: AtomicBool::new(false),
            solo_current: AtomicBool::new(false),
            solo_next: AtomicBool::new(false),
            delay_current: AtomicU32::new(0),
            delay_next: AtomicU32::new(0),
        }
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume_next_bits.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_next_bits.load(Ordering::Relaxed))
    }

    pub fn set_mute(&self, muted: bool) {
        self.mute_next.store(muted, Ordering::Relaxed);
    }

    pub fn mute(&self) -> bool {
        self.mute_next.load(Ordering::Relaxed)
    }

    pub fn set_solo(&self, solo: bool) {
        self.solo_next.store(solo, Ordering::Relaxed);
    }

    pub fn solo(&self) -> bool {
        self.solo_next.load(Ordering::Relaxed)
    }

    /// Samples; clamped to `[0, delay_max - 1]` per the delay-bounds invariant.
    pub fn set_delay(&self, delay_samples: u32) {
        let bound = (self.delay_max.saturating_sub(1)) as u32;
        self.delay_next.store(delay_samples.min(bound), Ordering::Relaxed);
    }

    pub fn delay(&self) -> u32 {
        self.delay_next.load(Ordering::Relaxed)
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Process one block. `input`/`output` are one slice per channel, each
    /// `frames` samples. `global_gain_start`/`global_gain_end` come from the
    /// manager's own double-buffered global volume; `solo_active` is true
    /// when some session (not necessarily this one) currently has solo set.
    pub fn process(
        &mut self,
        input: &[&[f32]],
        output: &mut [Vec<f32>],
        global_gain_start: f32,
        global_gain_end: f32,
        solo_active: bool,
    ) {
        debug_assert_eq!(input.len(), self.channels);
        debug_assert_eq!(output.len(), self.channels);
        let frames = input.first().map(|c| c.len()).unwrap_or(0);
        if frames == 0 {
            return;
        }

        let volume_start = f32::from_bits(self.volume_current_bits.load(Ordering::Relaxed));
        let volume_end = f32::from_bits(self.volume_next_bits.load(Ordering::Relaxed));
        let mute_start = self.mute_current.load(Ordering::Relaxed);
        let mute_end = self.mute_next.load(Ordering::Relaxed);
        let solo_start = self.solo_current.load(Ordering::Relaxed);
        let solo_end = self.solo_next.load(Ordering::Relaxed);
        let delay_start = self.delay_current.load(Ordering::Relaxed) as usize;
        let delay_end = self.delay_next.load(Ordering::Relaxed) as usize;

        let effective_mute_start = mute_start || (solo_active && !solo_start);
        let effective_mute_end = mute_end || (solo_active && !solo_end);
        let gain_start = if effective_mute_start { 0.0 } else { global_gain_start * volume_start };
        let gain_end = if effective_mute_end { 0.0 } else { global_gain_end * volume_end };
        let step = (gain_end - gain_start) / frames as f32;

        for (ch, delay_line) in self.delay_lines.iter_mut().enumerate() {
            let mut sum_sq_in = 0.0f32;
            let mut peak_in = 0.0f32;
            let mut sum_sq_out = 0.0f32;
            let mut peak_out = 0.0f32;

            for i in 0..frames {
                let t = i as f32 / frames as f32;
                let gain = gain_start + step * (i + 1) as f32;
                // Nearest-sample delay interpolation (documented placeholder).
                let delay = if delay_start == delay_end {
                    delay_start
                } else {
                    delay_start + ((delay_end as f32 - delay_start as f32) * t).round() as usize
                };

                let raw = input[ch][i];
                let delayed = delay_line.write_read(raw, delay);
                let out = delayed * gain;
                output[ch][i] = out;

                sum_sq_in += raw * raw;
                peak_in = peak_in.max(raw.abs());
                sum_sq_out += out * out;
                peak_out = peak_out.max(out.abs());
            }

            let rms_in = (sum_sq_in / frames as f32).sqrt();
            let rms_out = (sum_sq_out / frames as f32).sqrt();
            self.meters[ch].update(rms_in, peak_in, rms_out, peak_out);
        }

        self.volume_current_bits.store(volume_end.to_bits(), Ordering::Relaxed);
        self.mute_current.store(mute_end, Ordering::Relaxed);
        self.solo_current.store(solo_end, Ordering::Relaxed);
        self.delay_current.store(delay_end as u32, Ordering::Relaxed);
    }

    pub fn meter_snapshot(&self, channel: usize) -> MeterSnapshot {
        self.meters[channel].publish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_gain_passes_signal_through_after_delay_settles() {
        let mut kernel = MixKernel::new(1, 4);
        let input = vec![0.5f32; 8];
        let mut output = vec![vec![0.0f32; 8]];
        kernel.process(&[&input], &mut output, 1.0, 1.0, false);
        assert!((output[0][7] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mute_ramps_to_zero_within_one_block() {
        let mut kernel = MixKernel::new(1, 1);
        let input = vec![1.0f32; 256];
        let mut output = vec![vec![0.0f32; 256]];
        // First block establishes unity gain as "current".
        kernel.process(&[&input], &mut output, 1.0, 1.0, false);
        let prev_last = output[0][255];

        kernel.set_mute(true);
        let mut output2 = vec![vec![0.0f32; 256]];
        kernel.process(&[&input], &mut output2, 1.0, 1.0, false);

        let step = (0.0 - prev_last) / 256.0;
        assert!((output2[0][0] - (prev_last + step)).abs() < 1e-4);
        assert_eq!(output2[0][255], 0.0);
    }

    #[test]
    fn solo_mutes_non_soloed_sessions() {
        let mut kernel = MixKernel::new(1, 1);
        let input = vec![1.0f32; 64];
        let mut output = vec![vec![0.0f32; 64]];
        kernel.process(&[&input], &mut output, 1.0, 1.0, true);
        assert_eq!(output[0][63], 0.0);
    }

    #[test]
    fn delay_bounds_are_clamped() {
        let kernel = MixKernel::new(1, 10);
        kernel.set_delay(100);
        assert!(kernel.delay() <= 9);
    }

    #[test]
    fn meter_peak_resets_on_publish() {
        let mut kernel = MixKernel::new(1, 1);
        let input = vec![0.9f32; 16];
        let mut output = vec![vec![0.0f32; 16]];
        kernel.process(&[&input], &mut output, 1.0, 1.0, false);
        let first = kernel.meter_snapshot(0);
        assert!(first.peak_in > 0.0);
        let second = kernel.meter_snapshot(0);
        assert_eq!(second.peak_in, 0.0);
    }
}
