//! Arrival-path statistics machine: extended sequence assignment, clock-skew
//! compensation, jitter estimation, and lateness detection. Runs on the
//! network thread; produces [`QueuedPacket`]s for the playout queue.
//!
//! Every numeric comparison on the wrapping 32-bit sample-clock values uses
//! the wrap-safe signed comparison from [`super::queue`].

use sam_protocol::rtcp::ReceiverReport;
use sam_protocol::rtp::{decode_samples, PayloadFormat, RtpHeader};
use tracing::{trace, warn};

use super::queue::{wrapping_le, wrapping_lt, QueuedPacket};

pub const MAX_DROPOUT: u16 = 3000;
pub const MAX_MISORDER: u16 = 100;
pub const MAX_LATE: u32 = 200;

#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    pub queue_depth_samples: u32,
    pub skew_threshold: u32,
    pub stats_interval_samples: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DropReason {
    BadlyMisordered,
    Duplicate,
    SkewDiscard,
    Late,
}

pub struct ArrivalOutcome {
    pub packet: Option<QueuedPacket>,
    pub reset_triggered: bool,
}

/// Running per-sender receive statistics, one instance per client session.
pub struct ReceiverStats {
    initialized: bool,
    max_seq: u16,
    wrap_count: u64,
    bad_sequence: Option<u32>,

    stored_offset: u32,
    active_delay: i64,
    jitter: i64,
    prev_transit: Option<i32>,

    consecutive_late: u32,
    consecutive_missing: u32,

    first_seq_this_interval: u16,
    max_seq_this_interval: u16,
    packets_this_interval: u32,
    packets_received: u64,

    current_play_clock: u32,
    config: ReceiverConfig,

    cumulative_lost: i32,
    last_sr_mid: u32,
    last_sr_received_at: Option<u64>,
}

impl ReceiverStats {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            initialized: false,
            max_seq: 0,
            wrap_count: 0,
            bad_sequence: None,
            stored_offset: 0,
            active_delay: 0,
            jitter: 0,
            prev_transit: None,
            consecutive_late: 0,
            consecutive_missing: 0,
            first_seq_this_interval: 0,
            max_seq_this_interval: 0,
            packets_this_interval: 0,
            packets_received: 0,
            current_play_clock: 0,
            config,
            cumulative_lost: 0,
            last_sr_mid: 0,
            last_sr_received_at: None,
        }
    }

    /// Record a sender report received on the companion RTCP socket, so the
    /// next receiver report can carry `last_sr`/`delay_since_last_sr`.
    pub fn on_sender_report(&mut self, ntp_time: u64, received_at: u64) {
        self.last_sr_mid = ((ntp_time >> 16) & 0xFFFF_FFFF) as u32;
        self.last_sr_received_at = Some(received_at);
    }

    /// Build the next RTCP receiver report for `ssrc` (the sender being
    /// reported on), using the interval counters and the last-seen SR.
    pub fn build_receiver_report(&mut self, ssrc: u32, now: u64, sample_rate: u32) -> ReceiverReport {
        let (first, last, received) = self.take_interval_snapshot();
        let expected = last.wrapping_sub(first) as u32 + 1;
        let lost_this_interval = expected.saturating_sub(received) as i32;
        self.cumulative_lost += lost_this_interval;
        let fraction_lost = if expected == 0 {
            0
        } else {
            ((lost_this_interval.max(0) as u32 * 256) / expected).min(255) as u8
        };

        let delay_since_last_sr = match self.last_sr_received_at {
            Some(at) if sample_rate > 0 => {
                let elapsed_samples = now.saturating_sub(at);
                ((elapsed_samples as u128 * 65536) / sample_rate as u128) as u32
            }
            _ => 0,
        };

        ReceiverReport {
            ssrc,
            fraction_lost,
            cumulative_lost: self.cumulative_lost,
            extended_highest_seq: self.extended_highest_seq(),
            jitter: self.jitter_estimate(),
            last_sr: self.last_sr_mid,
            delay_since_last_sr,
        }
    }

    /// Advance the audio-thread-observed play clock; used by the lateness
    /// check. The network thread reads the driver clock directly instead
    /// when it has one, but tests drive this explicitly.
    pub fn set_play_clock(&mut self, play_clock: u32) {
        self.current_play_clock = play_clock;
    }

    fn reset_statistics(&mut self, seed_seq: u16) {
        self.initialized = true;
        self.max_seq = seed_seq;
        self.wrap_count = 0;
        self.bad_sequence = None;
        self.jitter = 0;
        self.prev_transit = None;
        self.consecutive_late = 0;
        self.first_seq_this_interval = seed_seq;
        self.max_seq_this_interval = seed_seq;
        self.packets_this_interval = 0;
    }

    /// Process one decoded RTP packet, producing a node for the playout
    /// queue or a reason it was dropped.
    pub fn on_packet(
        &mut self,
        header: &RtpHeader,
        payload: &[u8],
        arrival_time: u32,
    ) -> Result<ArrivalOutcome, DropReason> {
        let mut reset_triggered = false;

        // Step 2: timestamp-offset tracking (minimum observed transit).
        let current_offset = arrival_time.wrapping_sub(header.timestamp);
        if !self.initialized || wrapping_lt(current_offset, self.stored_offset) {
            self.stored_offset = current_offset;
        }

        // Step 3: extended sequence assignment.
        if !self.initialized {
            self.reset_statistics(header.sequence);
        } else {
            let delta = header.sequence.wrapping_sub(self.max_seq);
            if delta < MAX_DROPOUT {
                if header.sequence < self.max_seq {
                    self.wrap_count += 1;
                }
                self.max_seq = header.sequence;
            } else if delta <= 65535u16.wrapping_sub(MAX_MISORDER) {
                let expected_restart = (header.sequence as u32).wrapping_add(1);
                if self.bad_sequence == Some(expected_restart) {
                    self.reset_statistics(header.sequence);
                    reset_triggered = true;
                } else {
                    self.bad_sequence = Some(expected_restart);
                    return Err(DropReason::BadlyMisordered);
                }
            } else {
                return Err(DropReason::Duplicate);
            }
        }
        let extended_seq = header.sequence as u64 + 65536 * self.wrap_count;

        // Step 4: skew adjustment. `diff` measures how far this packet moved
        // the smoothed transit-delay estimate in one step; a shift beyond
        // the threshold means the sender/path skewed abruptly rather than
        // drifted, so the stored offset jumps instead of ramping.
        let d = arrival_time.wrapping_sub(header.timestamp) as i32 as i64;
        let active_delay_old = self.active_delay;
        let smoothed = (31 * active_delay_old + d) / 32;
        self.active_delay = smoothed;
        let skew_threshold = self.config.skew_threshold as i64;
        let diff = smoothed - active_delay_old;
        let mut skew_adjust: i64 = 0;
        if diff >= skew_threshold {
            self.stored_offset = self.stored_offset.wrapping_sub(self.config.skew_threshold);
            return Err(DropReason::SkewDiscard);
        } else if diff <= -skew_threshold {
            self.stored_offset = self.stored_offset.wrapping_add(self.config.skew_threshold);
            skew_adjust = 0;
        }

        // Step 5: jitter adjustment.
        if let Some(prev) = self.prev_transit {
            self.jitter += ((prev - d as i32).abs() as i64 - self.jitter) / 16;
        }
        self.prev_transit = Some(d as i32);

        // Step 6: playout time.
        let playout = header
            .timestamp
            .wrapping_add(self.stored_offset)
            .wrapping_add(skew_adjust as u32)
            .wrapping_add(self.config.queue_depth_samples);

        // Step 7: lateness check.
        if wrapping_lt(playout, self.current_play_clock) {
            self.consecutive_late += 1;
            if self.consecutive_late > MAX_LATE {
                self.reset_statistics(header.sequence);
                reset_triggered = true;
            }
            return Err(DropReason::Late);
        }
        self.consecutive_late = 0;

        // Interval bookkeeping for the next RTCP receiver report.
        self.packets_this_interval += 1;
        self.packets_received += 1;
        if wrapping_lt(self.max_seq_this_interval, header.sequence) {
            self.max_seq_this_interval = header.sequence;
        }

        let format = PayloadFormat::from_payload_type(header.payload_type)
            .unwrap_or(PayloadFormat::Float32);
        let samples = decode_samples(format, payload);

        trace!(
            seq = header.sequence,
            extended_seq,
            playout,
            "accepted RTP packet"
        );

        Ok(ArrivalOutcome {
            packet: Some(QueuedPacket {
                extended_seq,
                playout_time: playout,
                channels: 1,
                samples,
                used: false,
            }),
            reset_triggered,
        })
    }

    /// Called when [`Self::on_packet`] yields no node (missing/silence
    /// block) so underrun counting matches §4.3.2.
    pub fn note_missing_block(&mut self) {
        self.consecutive_missing += 1;
        if self.consecutive_missing > 0 && self.packets_received > 0 {
            warn!(
                consecutive_missing = self.consecutive_missing,
                "playout underrun"
            );
        }
    }

    pub fn note_block_played(&mut self) {
        self.consecutive_missing = 0;
    }

    pub fn extended_highest_seq(&self) -> u32 {
        (self.max_seq as u32) + (self.wrap_count as u32) * 65536
    }

    pub fn jitter_estimate(&self) -> u32 {
        self.jitter.unsigned_abs() as u32
    }

    /// Reset the per-interval counters and return the fields needed to
    /// build an RTCP receiver report; called on the fixed reporting timer.
    pub fn take_interval_snapshot(&mut self) -> (u16, u16, u32) {
        let snapshot = (
            self.first_seq_this_interval,
            self.max_seq_this_interval,
            self.packets_this_interval,
        );
        self.first_seq_this_interval = self.max_seq;
        self.max_seq_this_interval = self.max_seq;
        self.packets_this_interval = 0;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sam_protocol::rtp::encode_samples;

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            queue_depth_samples: 0,
            skew_threshold: 256,
            stats_interval_samples: 48_000,
        }
    }

    fn header(seq: u16, timestamp: u32) -> RtpHeader {
        RtpHeader {
            payload_type: PayloadFormat::Float32.payload_type(),
            marker: false,
            sequence: seq,
            timestamp,
            ssrc: 0x1234,
        }
    }

    fn payload() -> Vec<u8> {
        let mut buf = Vec::new();
        encode_samples(PayloadFormat::Float32, &[0.1, 0.2], &mut buf);
        buf
    }

    #[test]
    fn first_packet_initializes_and_is_accepted() {
        let mut stats = ReceiverStats::new(config());
        let outcome = stats.on_packet(&header(100, 0), &payload(), 0).unwrap();
        assert_eq!(outcome.packet.unwrap().extended_seq, 100);
    }

    #[test]
    fn sequence_wrap_increments_extended_sequence_continuously() {
        let mut stats = ReceiverStats::new(config());
        stats.on_packet(&header(65534, 0), &payload(), 0).unwrap();
        stats.on_packet(&header(65535, 160), &payload(), 160).unwrap();
        let outcome = stats.on_packet(&header(0, 320), &payload(), 320).unwrap();
        assert_eq!(outcome.packet.unwrap().extended_seq, 65536);
    }

    #[test]
    fn large_jump_is_dropped_then_accepted_on_repeat() {
        let mut stats = ReceiverStats::new(config());
        stats.on_packet(&header(10, 0), &payload(), 0).unwrap();

        let err = stats.on_packet(&header(40010, 160), &payload(), 160).unwrap_err();
        assert_eq!(err, DropReason::BadlyMisordered);

        let outcome = stats.on_packet(&header(40010, 320), &payload(), 320).unwrap();
        assert!(outcome.reset_triggered);
        assert_eq!(outcome.packet.unwrap().extended_seq, 40010);
    }

    #[test]
    fn late_packet_is_dropped_and_counted() {
        let mut stats = ReceiverStats::new(config());
        stats.on_packet(&header(0, 0), &payload(), 0).unwrap();
        stats.set_play_clock(10_000);
        let err = stats.on_packet(&header(1, 160), &payload(), 160).unwrap_err();
        assert_eq!(err, DropReason::Late);
    }

    #[test]
    fn skew_beyond_threshold_adjusts_offset_and_drops() {
        let mut cfg = config();
        cfg.skew_threshold = 10;
        let mut stats = ReceiverStats::new(cfg);
        stats.on_packet(&header(0, 0), &payload(), 0).unwrap();
        // Large sudden transit-time drop triggers the "sender is faster" branch.
        let err = stats.on_packet(&header(1, 0), &payload(), 1000).unwrap_err();
        assert_eq!(err, DropReason::SkewDiscard);
    }
}
