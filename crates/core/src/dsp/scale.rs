//! Stage 1: raw payload bytes → interleaved f32 in [-1, 1]

use crate::audio::{ByteOrder, Codec, StreamProperties};
use crate::audio::format::{alaw_to_linear, mulaw_to_linear};

/// Decode every complete frame of `input` into `out` (cleared first)
///
/// Returns the number of frames decoded. Trailing bytes that do not form
/// a whole frame are ignored. `out` must already have capacity for the
/// decoded samples; the caller grows it outside the hot loop.
pub fn scale_to_f32(input: &[u8], props: &StreamProperties, out: &mut Vec<f32>) -> usize {
    out.clear();
    let frame_bytes = props.frame_bytes();
    if frame_bytes == 0 {
        return 0;
    }
    let frames = input.len() / frame_bytes;
    let bytes = &input[..frames * frame_bytes];

    match (props.codec, props.bit_depth, props.byte_order) {
        (Codec::MuLaw, _, _) => {
            out.extend(bytes.iter().map(|&b| mulaw_to_linear(b) as f32 / 32768.0));
        }
        (Codec::ALaw, _, _) => {
            out.extend(bytes.iter().map(|&b| alaw_to_linear(b) as f32 / 32768.0));
        }
        (Codec::Pcm, 8, _) => {
            out.extend(bytes.iter().map(|&b| (b as f32 - 128.0) / 128.0));
        }
        (Codec::Pcm, 16, ByteOrder::Little) => {
            out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0),
            );
        }
        (Codec::Pcm, 16, ByteOrder::Big) => {
            out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_be_bytes([c[0], c[1]]) as f32 / 32768.0),
            );
        }
        (Codec::Pcm, 24, order) => {
            out.extend(bytes.chunks_exact(3).map(|c| {
                crate::audio::format::read_pcm(c, 24, order) as f32 / 8_388_608.0
            }));
        }
        (Codec::Pcm, _, ByteOrder::Little) => {
            out.extend(bytes.chunks_exact(4).map(|c| {
                (i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64 / 2_147_483_648.0) as f32
            }));
        }
        (Codec::Pcm, _, ByteOrder::Big) => {
            out.extend(bytes.chunks_exact(4).map(|c| {
                (i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64 / 2_147_483_648.0) as f32
            }));
        }
    }
    frames
}
