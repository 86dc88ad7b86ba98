//! RTP packet header and PCM payload encode/decode.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Padding/extension/CSRC-count and the marker bit are carried but
//! ignored on receive and always zero on send, per spec.

use crate::error::CodecError;

pub const RTP_HEADER_LEN: usize = 12;

/// The three PCM payload widths this system understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Signed 16-bit big-endian.
    Pcm16,
    /// Signed 24-bit big-endian (3 bytes per sample).
    Pcm24,
    /// IEEE-754 32-bit float, big-endian.
    Float32,
}

impl PayloadFormat {
    /// Maps to/from the negotiated RTP payload-type code.
    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            96 => Some(Self::Pcm16),
            97 => Some(Self::Pcm24),
            98 => Some(Self::Float32),
            _ => None,
        }
    }

    pub fn payload_type(self) -> u8 {
        match self {
            Self::Pcm16 => 96,
            Self::Pcm24 => 97,
            Self::Float32 => 98,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Pcm16 => 2,
            Self::Pcm24 => 3,
            Self::Float32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payload_type,
            marker: false,
            sequence: 0,
            timestamp: 0,
            ssrc,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(0x80); // V=2, P=0, X=0, CC=0
        out.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(CodecError::Truncated {
                need: RTP_HEADER_LEN,
                got: data.len(),
            });
        }
        let version = (data[0] >> 6) & 0x03;
        if version != 2 {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Ok(Self {
            payload_type: data[1] & 0x7F,
            marker: (data[1] & 0x80) != 0,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// Encode interleaved float samples (channel-major per frame) into the
/// wire format for `format`, appending to `out`.
pub fn encode_samples(format: PayloadFormat, samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * format.bytes_per_sample());
    match format {
        PayloadFormat::Pcm16 => {
            for &s in samples {
                let clamped = s.clamp(-1.0, 1.0);
                let scaled = (clamped * i16::MAX as f32).round() as i16;
                out.extend_from_slice(&scaled.to_be_bytes());
            }
        }
        PayloadFormat::Pcm24 => {
            for &s in samples {
                let clamped = s.clamp(-1.0, 1.0);
                let scaled = (clamped * 8_388_607.0).round() as i32;
                let bytes = scaled.to_be_bytes();
                out.extend_from_slice(&bytes[1..4]);
            }
        }
        PayloadFormat::Float32 => {
            for &s in samples {
                out.extend_from_slice(&s.clamp(-1.0, 1.0).to_be_bytes());
            }
        }
    }
}

/// Decode a wire payload of `format` into interleaved float samples.
pub fn decode_samples(format: PayloadFormat, data: &[u8]) -> Vec<f32> {
    let width = format.bytes_per_sample();
    let count = data.len() / width;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let chunk = &data[i * width..i * width + width];
        let sample = match format {
            PayloadFormat::Pcm16 => {
                i16::from_be_bytes([chunk[0], chunk[1]]) as f32 / i16::MAX as f32
            }
            PayloadFormat::Pcm24 => {
                let raw = ((chunk[0] as i32) << 16) | ((chunk[1] as i32) << 8) | (chunk[2] as i32);
                let signed = if raw & 0x0080_0000 != 0 {
                    raw | !0x00FF_FFFFu32 as i32
                } else {
                    raw
                };
                signed as f32 / 8_388_607.0
            }
            PayloadFormat::Float32 => {
                f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]).clamp(-1.0, 1.0)
            }
        };
        out.push(sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = RtpHeader {
            payload_type: 97,
            marker: true,
            sequence: 12345,
            timestamp: 0xDEAD_BEEF,
            ssrc: 0xCAFE_BABE,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), RTP_HEADER_LEN);
        let decoded = RtpHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_rejects_short_buffer() {
        let err = RtpHeader::decode(&[0u8; 4]).unwrap_err();
        assert_eq!(err, CodecError::Truncated { need: 12, got: 4 });
    }

    #[test]
    fn pcm16_roundtrip() {
        let samples = [0.5f32, -0.5, 0.0, 1.0, -1.0];
        let mut buf = Vec::new();
        encode_samples(PayloadFormat::Pcm16, &samples, &mut buf);
        let back = decode_samples(PayloadFormat::Pcm16, &buf);
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn pcm24_roundtrip() {
        let samples = [0.25f32, -0.75, 0.0];
        let mut buf = Vec::new();
        encode_samples(PayloadFormat::Pcm24, &samples, &mut buf);
        assert_eq!(buf.len(), samples.len() * 3);
        let back = decode_samples(PayloadFormat::Pcm24, &buf);
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn float32_roundtrip() {
        let samples = [0.125f32, -0.875, 0.0];
        let mut buf = Vec::new();
        encode_samples(PayloadFormat::Float32, &samples, &mut buf);
        let back = decode_samples(PayloadFormat::Float32, &buf);
        assert_eq!(samples.to_vec(), back);
    }

    #[test]
    fn payload_type_roundtrip() {
        for fmt in [
            PayloadFormat::Pcm16,
            PayloadFormat::Pcm24,
            PayloadFormat::Float32,
        ] {
            assert_eq!(PayloadFormat::from_payload_type(fmt.payload_type()), Some(fmt));
        }
    }
}
