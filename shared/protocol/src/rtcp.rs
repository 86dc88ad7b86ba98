//! RTCP sender and receiver report encode/decode.
//!
//! Only the two report types this system emits/consumes are implemented;
//! there is no generic RTCP compound-packet framing here since SAM never
//! mixes report types in one datagram.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::CodecError;

/// Sender report: wallclock + RTP timestamp correspondence and running
/// send counters, emitted by `RtpSender` on its report timer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderReport {
    pub ssrc: u32,
    /// NTP-format wallclock at send time (fixed-point 32.32).
    pub ntp_time: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub const WIRE_LEN: usize = 24;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_u32::<BigEndian>(self.ssrc).unwrap();
        out.write_u64::<BigEndian>(self.ntp_time).unwrap();
        out.write_u32::<BigEndian>(self.rtp_timestamp).unwrap();
        out.write_u32::<BigEndian>(self.packet_count).unwrap();
        out.write_u32::<BigEndian>(self.octet_count).unwrap();
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::WIRE_LEN {
            return Err(CodecError::Truncated {
                need: Self::WIRE_LEN,
                got: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            ssrc: cursor.read_u32::<BigEndian>().unwrap(),
            ntp_time: cursor.read_u64::<BigEndian>().unwrap(),
            rtp_timestamp: cursor.read_u32::<BigEndian>().unwrap(),
            packet_count: cursor.read_u32::<BigEndian>().unwrap(),
            octet_count: cursor.read_u32::<BigEndian>().unwrap(),
        })
    }
}

/// Receiver report: one block of reception statistics for a single
/// sender SSRC, emitted by the receiver's statistics timer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverReport {
    /// SSRC of the sender this report describes.
    pub ssrc: u32,
    /// Fraction of packets lost since the last report (8-bit fixed point).
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24-bit signed-ish count, kept
    /// as i32 and masked to 24 bits on encode).
    pub cumulative_lost: i32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    /// Middle 32 bits of the NTP timestamp from the last SR received.
    pub last_sr: u32,
    /// Delay since last SR, in units of 1/65536 second.
    pub delay_since_last_sr: u32,
}

impl ReceiverReport {
    pub const WIRE_LEN: usize = 24;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_u32::<BigEndian>(self.ssrc).unwrap();
        let cumulative = (self.cumulative_lost as u32) & 0x00FF_FFFF;
        let word = ((self.fraction_lost as u32) << 24) | cumulative;
        out.write_u32::<BigEndian>(word).unwrap();
        out.write_u32::<BigEndian>(self.extended_highest_seq).unwrap();
        out.write_u32::<BigEndian>(self.jitter).unwrap();
        out.write_u32::<BigEndian>(self.last_sr).unwrap();
        out.write_u32::<BigEndian>(self.delay_since_last_sr).unwrap();
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::WIRE_LEN {
            return Err(CodecError::Truncated {
                need: Self::WIRE_LEN,
                got: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let ssrc = cursor.read_u32::<BigEndian>().unwrap();
        let word = cursor.read_u32::<BigEndian>().unwrap();
        let fraction_lost = (word >> 24) as u8;
        let mut cumulative_lost = (word & 0x00FF_FFFF) as i32;
        if cumulative_lost & 0x0080_0000 != 0 {
            cumulative_lost |= !0x00FF_FFFFu32 as i32;
        }
        Ok(Self {
            ssrc,
            fraction_lost,
            cumulative_lost,
            extended_highest_seq: cursor.read_u32::<BigEndian>().unwrap(),
            jitter: cursor.read_u32::<BigEndian>().unwrap(),
            last_sr: cursor.read_u32::<BigEndian>().unwrap(),
            delay_since_last_sr: cursor.read_u32::<BigEndian>().unwrap(),
        })
    }
}

/// Read helper used by tests/callers that already have a `Read`, kept for
/// symmetry with the pack's `unmarshal<R: Read>` convention.
pub fn read_receiver_report<R: Read>(reader: &mut R) -> Result<ReceiverReport, CodecError> {
    let mut buf = [0u8; ReceiverReport::WIRE_LEN];
    reader
        .read_exact(&mut buf)
        .map_err(|_| CodecError::Truncated {
            need: ReceiverReport::WIRE_LEN,
            got: 0,
        })?;
    ReceiverReport::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_report_roundtrip() {
        let sr = SenderReport {
            ssrc: 0x1234_5678,
            ntp_time: 0x0011_2233_4455_6677,
            rtp_timestamp: 48_000,
            packet_count: 1000,
            octet_count: 192_000,
        };
        let mut buf = Vec::new();
        sr.encode(&mut buf);
        assert_eq!(buf.len(), SenderReport::WIRE_LEN);
        assert_eq!(SenderReport::decode(&buf).unwrap(), sr);
    }

    #[test]
    fn receiver_report_roundtrip() {
        let rr = ReceiverReport {
            ssrc: 42,
            fraction_lost: 12,
            cumulative_lost: 300,
            extended_highest_seq: 0x0001_0010,
            jitter: 55,
            last_sr: 0xABCD,
            delay_since_last_sr: 1234,
        };
        let mut buf = Vec::new();
        rr.encode(&mut buf);
        assert_eq!(ReceiverReport::decode(&buf).unwrap(), rr);
    }

    #[test]
    fn receiver_report_negative_cumulative_lost() {
        let rr = ReceiverReport {
            ssrc: 1,
            fraction_lost: 0,
            cumulative_lost: -5,
            extended_highest_seq: 0,
            jitter: 0,
            last_sr: 0,
            delay_since_last_sr: 0,
        };
        let mut buf = Vec::new();
        rr.encode(&mut buf);
        let decoded = ReceiverReport::decode(&buf).unwrap();
        assert_eq!(decoded.cumulative_lost, -5);
    }
}
