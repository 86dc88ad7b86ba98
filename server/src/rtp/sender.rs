//! RTP sender (C2): packetizes one client's outgoing audio and paces RTCP
//! sender reports against the negotiated report interval.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;
use sam_protocol::rtcp::SenderReport;
use sam_protocol::rtp::{encode_samples, PayloadFormat, RtpHeader};
use tracing::trace;

use super::queue::wrapping_le;
use crate::error::{Result, SamError};

pub struct RtpSender {
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    rtp_destination: SocketAddr,
    rtcp_destination: SocketAddr,
    ssrc: u32,
    format: PayloadFormat,
    sequence: AtomicU32,
    timestamp: AtomicU32,
    packet_count: AtomicU32,
    octet_count: AtomicU32,
    next_report_tick: AtomicU32,
    report_interval_samples: u32,
}

impl RtpSender {
    pub fn new(
        rtp_socket: UdpSocket,
        rtcp_socket: UdpSocket,
        rtp_destination: SocketAddr,
        rtcp_destination: SocketAddr,
        ssrc: u32,
        format: PayloadFormat,
        report_interval_samples: u32,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let initial_sequence: u16 = rng.gen();
        let initial_timestamp: u32 = rng.gen();
        Self {
            rtp_socket,
            rtcp_socket,
            rtp_destination,
            rtcp_destination,
            ssrc,
            format,
            sequence: AtomicU32::new(initial_sequence as u32),
            timestamp: AtomicU32::new(initial_timestamp),
            packet_count: AtomicU32::new(0),
            octet_count: AtomicU32::new(0),
            next_report_tick: AtomicU32::new(initial_timestamp.wrapping_add(report_interval_samples)),
            report_interval_samples,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Encode one block of `frames` interleaved samples and send it,
    /// advancing sequence/timestamp/counters. Paces an RTCP SR afterward
    /// when the timestamp has crossed the next report tick.
    pub fn send(&self, frames: u32, samples: &[f32]) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) as u16;
        let timestamp = self.timestamp.fetch_add(frames, Ordering::Relaxed);

        let header = RtpHeader {
            payload_type: self.format.payload_type(),
            marker: false,
            sequence,
            timestamp,
            ssrc: self.ssrc,
        };

        let mut packet = Vec::with_capacity(12 + samples.len() * self.format.bytes_per_sample());
        header.encode(&mut packet);
        encode_samples(self.format, samples, &mut packet);

        self.rtp_socket
            .send_to(&packet, self.rtp_destination)
            .map_err(|e| SamError::Transport(e.to_string()))?;

        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.octet_count
            .fetch_add((packet.len() - 12) as u32, Ordering::Relaxed);

        let new_timestamp = timestamp.wrapping_add(frames);
        let next_tick = self.next_report_tick.load(Ordering::Relaxed);
        if wrapping_le(next_tick, new_timestamp) {
            self.emit_sender_report(new_timestamp)?;
            self.next_report_tick
                .store(next_tick.wrapping_add(self.report_interval_samples), Ordering::Relaxed);
        }

        trace!(seq = sequence, timestamp, "sent RTP packet");
        Ok(())
    }

    fn emit_sender_report(&self, rtp_timestamp: u32) -> Result<()> {
        let report = SenderReport {
            ssrc: self.ssrc,
            ntp_time: ntp_now(),
            rtp_timestamp,
            packet_count: self.packet_count.load(Ordering::Relaxed),
            octet_count: self.octet_count.load(Ordering::Relaxed),
        };
        let mut buf = Vec::with_capacity(SenderReport::WIRE_LEN);
        report.encode(&mut buf);
        self.rtcp_socket
            .send_to(&buf, self.rtcp_destination)
            .map_err(|e| SamError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Fixed-point 32.32 NTP timestamp for "now". Not wired to a real NTP
/// source; wall-clock seconds-since-epoch plus fractional seconds is
/// sufficient for the sender reports this system emits.
fn ntp_now() -> u64 {
    const NTP_UNIX_EPOCH_DELTA: u64 = 2_208_988_800;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let seconds = now.as_secs() + NTP_UNIX_EPOCH_DELTA;
    let fraction = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    #[test]
    fn send_increments_sequence_and_timestamp() {
        let rtp_socket = bound_socket();
        let rtcp_socket = bound_socket();
        let rtp_dst: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let rtcp_dst: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let sender = RtpSender::new(
            rtp_socket,
            rtcp_socket,
            rtp_dst,
            rtcp_dst,
            0xAAAA,
            PayloadFormat::Float32,
            48_000,
        );

        let start_seq = sender.sequence.load(Ordering::Relaxed);
        sender.send(128, &vec![0.0f32; 128]).unwrap();
        assert_eq!(sender.sequence.load(Ordering::Relaxed), (start_seq + 1) & 0xFFFF);
        assert_eq!(sender.packet_count.load(Ordering::Relaxed), 1);
    }
}
