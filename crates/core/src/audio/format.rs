//! Stream format description and sample codecs
//!
//! Provides the negotiated/detected format of a source stream and the
//! conversions the rest of the core needs:
//! - raw PCM (8/16/24/32-bit, either byte order) ↔ integer / f32
//! - G.711 μ-law and A-law ↔ 16-bit linear
//! - f32 → i32 output conversion with clamping

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on channels for any stream or sink
pub const MAX_CHANNELS: usize = 8;

/// Audio codec carried in the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Linear PCM. 8-bit is unsigned (offset 128), wider depths are signed.
    #[default]
    Pcm,
    /// G.711 μ-law, 8 bits per sample
    MuLaw,
    /// G.711 A-law, 8 bits per sample
    ALaw,
}

/// Byte order of multi-byte samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Format of one source stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProperties {
    pub codec: Codec,
    /// Bits per sample: 8, 16, 24 or 32
    pub bit_depth: u8,
    /// Interleaved channel count (1..=MAX_CHANNELS)
    pub channels: usize,
    pub byte_order: ByteOrder,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl Default for StreamProperties {
    fn default() -> Self {
        Self {
            codec: Codec::Pcm,
            bit_depth: 16,
            channels: 2,
            byte_order: ByteOrder::Little,
            sample_rate: 48000,
        }
    }
}

impl StreamProperties {
    /// Bytes used by one sample of one channel
    pub fn bytes_per_sample(&self) -> usize {
        (self.bit_depth / 8) as usize
    }

    /// Bytes used by one frame (one sample of every channel)
    pub fn frame_bytes(&self) -> usize {
        self.bytes_per_sample() * self.channels
    }

    /// Check that the format can be decoded by the pipeline
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.bit_depth, 8 | 16 | 24 | 32) {
            return Err(Error::UnsupportedFormat(format!(
                "bit depth {} (expected 8, 16, 24 or 32)",
                self.bit_depth
            )));
        }
        if self.codec != Codec::Pcm && self.bit_depth != 8 {
            return Err(Error::UnsupportedFormat(format!(
                "{:?} requires 8-bit samples, got {}",
                self.codec, self.bit_depth
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(Error::UnsupportedFormat(format!(
                "channel count {} (expected 1..={})",
                self.channels, MAX_CHANNELS
            )));
        }
        if self.sample_rate == 0 {
            return Err(Error::UnsupportedFormat("sample rate 0".into()));
        }
        Ok(())
    }

    /// Read the sample starting at `bytes[0]` as a signed integer at this
    /// stream's native scale. Companded codecs decode to 16-bit linear.
    pub fn read_sample(&self, bytes: &[u8]) -> i32 {
        match self.codec {
            Codec::MuLaw => mulaw_to_linear(bytes[0]) as i32,
            Codec::ALaw => alaw_to_linear(bytes[0]) as i32,
            Codec::Pcm => read_pcm(bytes, self.bit_depth, self.byte_order),
        }
    }

    /// Write `value` (same scale as [`read_sample`](Self::read_sample)) into `out`.
    pub fn write_sample(&self, value: i32, out: &mut [u8]) {
        match self.codec {
            Codec::MuLaw => out[0] = linear_to_mulaw(value.clamp(-32768, 32767) as i16),
            Codec::ALaw => out[0] = linear_to_alaw(value.clamp(-32768, 32767) as i16),
            Codec::Pcm => write_pcm(value, self.bit_depth, self.byte_order, out),
        }
    }

    /// Full-scale magnitude of [`read_sample`](Self::read_sample) values
    pub fn full_scale(&self) -> f32 {
        match self.codec {
            Codec::MuLaw | Codec::ALaw => 32768.0,
            Codec::Pcm => pcm_full_scale(self.bit_depth),
        }
    }

    /// Read one sample normalized to [-1, 1]
    pub fn read_normalized(&self, bytes: &[u8]) -> f32 {
        self.read_sample(bytes) as f32 / self.full_scale()
    }
}

/// Full-scale magnitude of a signed PCM sample at `bit_depth`
pub fn pcm_full_scale(bit_depth: u8) -> f32 {
    match bit_depth {
        8 => 128.0,
        16 => 32768.0,
        24 => 8_388_608.0,
        _ => 2_147_483_648.0,
    }
}

/// Read a linear PCM sample as a signed integer
///
/// 8-bit samples are unsigned with a 128 offset; the result is re-centred
/// to -128..=127. 24-bit samples are sign-extended.
///
/// # Example
/// ```
/// use multiroom_core::audio::format::{read_pcm, ByteOrder};
///
/// assert_eq!(read_pcm(&[0xE8, 0x03], 16, ByteOrder::Little), 1000);
/// assert_eq!(read_pcm(&[0x03, 0xE8], 16, ByteOrder::Big), 1000);
/// assert_eq!(read_pcm(&[0xFF, 0xFF, 0xFF], 24, ByteOrder::Little), -1);
/// assert_eq!(read_pcm(&[0x80], 8, ByteOrder::Little), 0);
/// ```
pub fn read_pcm(bytes: &[u8], bit_depth: u8, order: ByteOrder) -> i32 {
    match (bit_depth, order) {
        (8, _) => bytes[0] as i32 - 128,
        (16, ByteOrder::Little) => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
        (16, ByteOrder::Big) => i16::from_be_bytes([bytes[0], bytes[1]]) as i32,
        (24, ByteOrder::Little) => i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8,
        (24, ByteOrder::Big) => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]) >> 8,
        (_, ByteOrder::Little) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        (_, ByteOrder::Big) => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

/// Write a signed integer as a linear PCM sample, saturating to the depth's range
pub fn write_pcm(value: i32, bit_depth: u8, order: ByteOrder, out: &mut [u8]) {
    match bit_depth {
        8 => out[0] = (value.clamp(-128, 127) + 128) as u8,
        16 => {
            let v = value.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            let b = match order {
                ByteOrder::Little => v.to_le_bytes(),
                ByteOrder::Big => v.to_be_bytes(),
            };
            out[..2].copy_from_slice(&b);
        }
        24 => {
            let v = value.clamp(-8_388_608, 8_388_607);
            match order {
                ByteOrder::Little => out[..3].copy_from_slice(&v.to_le_bytes()[..3]),
                ByteOrder::Big => out[..3].copy_from_slice(&v.to_be_bytes()[1..]),
            }
        }
        _ => {
            let b = match order {
                ByteOrder::Little => value.to_le_bytes(),
                ByteOrder::Big => value.to_be_bytes(),
            };
            out[..4].copy_from_slice(&b);
        }
    }
}

/// Decode a G.711 μ-law byte to 16-bit linear
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode 16-bit linear to a G.711 μ-law byte
pub fn linear_to_mulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut x = sample as i32;
    let sign = if x < 0 {
        x = -x;
        0x80u8
    } else {
        0
    };
    x = x.min(CLIP) + BIAS;

    let mut exponent = 7u8;
    let mut mask = 0x4000;
    while exponent > 0 && x & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((x >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode a G.711 A-law byte to 16-bit linear
pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let segment = (a >> 4) & 0x07;
    let mut t = ((a & 0x0F) as i32) << 4;
    match segment {
        0 => t += 8,
        1 => t += 0x108,
        _ => t = (t + 0x108) << (segment - 1),
    }
    // A-law sets the sign bit for positive values
    if a & 0x80 != 0 {
        t as i16
    } else {
        -t as i16
    }
}

/// Encode 16-bit linear to a G.711 A-law byte
pub fn linear_to_alaw(sample: i16) -> u8 {
    const SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

    let mut pcm = (sample as i32) >> 3;
    let mask = if pcm >= 0 {
        0xD5u8
    } else {
        pcm = -pcm - 1;
        0x55u8
    };

    let Some(segment) = SEGMENT_END.iter().position(|&end| pcm <= end) else {
        return 0x7F ^ mask;
    };
    let mut aval = (segment as u8) << 4;
    if segment < 2 {
        aval |= ((pcm >> 1) & 0x0F) as u8;
    } else {
        aval |= ((pcm >> segment) & 0x0F) as u8;
    }
    aval ^ mask
}

/// Convert one f32 sample to i32 (range: -1.0..1.0 → i32::MIN..i32::MAX)
///
/// Values outside the range and NaN are clamped.
///
/// # Example
/// ```
/// use multiroom_core::audio::format::f32_to_i32;
///
/// assert_eq!(f32_to_i32(0.0), 0);
/// assert_eq!(f32_to_i32(1.5), i32::MAX);
/// assert_eq!(f32_to_i32(-1.0), -2147483647);
/// assert_eq!(f32_to_i32(f32::NAN), 0);
/// ```
#[inline]
pub fn f32_to_i32(sample: f32) -> i32 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0) as f64;
    (clamped * 2_147_483_647.0) as i32
}
