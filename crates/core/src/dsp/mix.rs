//! Stage 4: channel mixing
//!
//! A mix is an 8x8 gain table indexed `[input][output]`. The hot path never
//! walks the full table; it uses [`MixTaps`], the sparse per-output list of
//! contributing inputs derived from it.
//!
//! Automatic layouts use the usual speaker order:
//!
//! | channels | order |
//! |---|---|
//! | 1 | M |
//! | 2 | L R |
//! | 4 | FL FR RL RR |
//! | 6 | FL FR C LFE RL RR |
//! | 8 | FL FR C LFE RL RR SL SR |

use crate::audio::MAX_CHANNELS;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Gains indexed `[input][output]`
pub type MixMatrix = [[f32; MAX_CHANNELS]; MAX_CHANNELS];

/// Gains at or below this magnitude are not turned into taps
pub const MIX_EPSILON: f32 = 1e-6;

const H: f32 = std::f32::consts::FRAC_1_SQRT_2;

// Speaker positions within surround layouts
const FL: usize = 0;
const FR: usize = 1;
const C: usize = 2;
const LFE: usize = 3;
const RL: usize = 4;
const RR: usize = 5;
const SL: usize = 6;
const SR: usize = 7;

/// Mix configuration for one input channel count
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerLayout {
    /// Derive the matrix from the channel counts instead of `matrix`
    pub auto_mode: bool,
    /// `matrix[input][output]`
    pub matrix: Vec<Vec<f32>>,
}

/// Layouts keyed by input channel count
pub type SpeakerLayoutTable = HashMap<usize, SpeakerLayout>;

/// Sparse form of a [`MixMatrix`]
#[derive(Debug, Clone, PartialEq)]
pub struct MixTaps {
    /// `taps[k]` lists `(input, gain)` pairs feeding output `k`
    taps: Vec<Vec<(usize, f32)>>,
    identity: bool,
}

impl MixTaps {
    /// Derive taps for `inputs` x `outputs` channels of `matrix`
    pub fn from_matrix(matrix: &MixMatrix, inputs: usize, outputs: usize) -> Self {
        let inputs = inputs.min(MAX_CHANNELS);
        let outputs = outputs.min(MAX_CHANNELS);
        let taps: Vec<Vec<(usize, f32)>> = (0..outputs)
            .map(|k| {
                (0..inputs)
                    .filter(|&i| matrix[i][k].abs() > MIX_EPSILON)
                    .map(|i| (i, matrix[i][k]))
                    .collect()
            })
            .collect();

        let identity = inputs == outputs
            && taps
                .iter()
                .enumerate()
                .all(|(k, t)| t.len() == 1 && t[0].0 == k && (t[0].1 - 1.0).abs() <= MIX_EPSILON);

        Self { taps, identity }
    }

    pub fn outputs(&self) -> usize {
        self.taps.len()
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Taps feeding `output`
    pub fn for_output(&self, output: usize) -> &[(usize, f32)] {
        self.taps.get(output).map_or(&[], Vec::as_slice)
    }
}

/// Identity mix over the first `channels` channels
pub fn identity_matrix(channels: usize) -> MixMatrix {
    let mut m = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
    for (i, row) in m.iter_mut().enumerate().take(channels.min(MAX_CHANNELS)) {
        row[i] = 1.0;
    }
    m
}

/// Canonical mix between the standard layouts (1, 2, 4, 6, 8 channels)
///
/// Unsupported counts get the identity mapping over the shared channels.
///
/// # Example
/// ```
/// use multiroom_core::dsp::mix::auto_matrix;
///
/// // Mono is copied to both sides of a stereo sink
/// let m = auto_matrix(1, 2);
/// assert_eq!(m[0][0], 1.0);
/// assert_eq!(m[0][1], 1.0);
/// ```
pub fn auto_matrix(inputs: usize, outputs: usize) -> MixMatrix {
    let standard = |n| matches!(n, 1 | 2 | 4 | 6 | 8);
    if inputs == outputs || !standard(inputs) || !standard(outputs) {
        return identity_matrix(inputs.min(outputs));
    }

    let mut m = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
    match (inputs, outputs) {
        (1, n) => {
            for k in (0..n).filter(|&k| !(n >= 6 && k == LFE)) {
                m[0][k] = 1.0;
            }
        }
        (n, 1) => {
            // Fold to stereo first, then sum the pair
            let to_stereo = auto_matrix(n, 2);
            for (i, row) in to_stereo.iter().enumerate().take(n) {
                m[i][0] = 0.5 * (row[0] + row[1]);
            }
        }
        (2, n) => {
            m[0][FL] = 1.0;
            m[1][FR] = 1.0;
            let (rear_l, rear_r) = if n == 4 { (2, 3) } else { (RL, RR) };
            m[0][rear_l] = 1.0;
            m[1][rear_r] = 1.0;
            if n >= 6 {
                m[0][C] = 0.5;
                m[1][C] = 0.5;
            }
            if n == 8 {
                m[0][SL] = 1.0;
                m[1][SR] = 1.0;
            }
        }
        (n, 2) => {
            m[FL][0] = 1.0;
            m[FR][1] = 1.0;
            let (rear_l, rear_r) = if n == 4 { (2, 3) } else { (RL, RR) };
            m[rear_l][0] = H;
            m[rear_r][1] = H;
            if n >= 6 {
                m[C][0] = H;
                m[C][1] = H;
            }
            if n == 8 {
                m[SL][0] = H;
                m[SR][1] = H;
            }
        }
        (4, n) => {
            m[0][FL] = 1.0;
            m[1][FR] = 1.0;
            m[2][RL] = 1.0;
            m[3][RR] = 1.0;
            m[0][C] = 0.5;
            m[1][C] = 0.5;
            if n == 8 {
                m[2][SL] = 1.0;
                m[3][SR] = 1.0;
            }
        }
        (n, 4) => {
            m[FL][0] = 1.0;
            m[FR][1] = 1.0;
            m[C][0] = H;
            m[C][1] = H;
            m[RL][2] = 1.0;
            m[RR][3] = 1.0;
            if n == 8 {
                m[SL][2] = H;
                m[SR][3] = H;
                m[SL][0] = H * 0.5;
                m[SR][1] = H * 0.5;
            }
        }
        (6, 8) => {
            for k in 0..6 {
                m[k][k] = 1.0;
            }
            m[RL][SL] = 1.0;
            m[RR][SR] = 1.0;
        }
        (8, 6) => {
            for k in 0..6 {
                m[k][k] = 1.0;
            }
            m[SL][RL] = H;
            m[SR][RR] = H;
            m[SL][FL] = H * 0.5;
            m[SR][FR] = H * 0.5;
        }
        _ => return identity_matrix(inputs.min(outputs)),
    }

    if inputs > outputs {
        normalize_columns(&mut m, inputs, outputs);
    }
    m
}

/// Scale each output column whose summed gain magnitude exceeds 1
fn normalize_columns(m: &mut MixMatrix, inputs: usize, outputs: usize) {
    for k in 0..outputs {
        let sum: f32 = (0..inputs).map(|i| m[i][k].abs()).sum();
        if sum > 1.0 {
            for row in m.iter_mut().take(inputs) {
                row[k] /= sum;
            }
        }
    }
}

/// Validate an explicit `matrix[input][output]` against the active layout
pub fn explicit_matrix(rows: &[Vec<f32>], inputs: usize, outputs: usize) -> Result<MixMatrix> {
    let cols = rows.iter().map(Vec::len).min().unwrap_or(0);
    let shape_ok = rows.len() >= inputs && cols >= outputs && inputs <= MAX_CHANNELS && outputs <= MAX_CHANNELS;
    if !shape_ok {
        return Err(Error::InvalidMixMatrix {
            expected_rows: inputs,
            expected_cols: outputs,
            rows: rows.len(),
            cols,
        });
    }
    if rows.iter().flatten().any(|g| !g.is_finite()) {
        return Err(Error::InvalidConfig("mix matrix contains non-finite gains".into()));
    }

    let mut m = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
    for (i, row) in rows.iter().enumerate().take(inputs) {
        m[i][..outputs].copy_from_slice(&row[..outputs]);
    }
    Ok(m)
}

/// Choose the matrix for `inputs` channels from the layout table
///
/// Explicit matrices that do not fit the layout are logged and replaced by
/// the automatic mix.
pub fn select_matrix(table: &SpeakerLayoutTable, inputs: usize, outputs: usize) -> MixMatrix {
    match table.get(&inputs) {
        Some(layout) if !layout.auto_mode => match explicit_matrix(&layout.matrix, inputs, outputs) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "Speaker layout for {} channels rejected ({}), using automatic mix",
                    inputs, e
                );
                auto_matrix(inputs, outputs)
            }
        },
        _ => auto_matrix(inputs, outputs),
    }
}

/// Applies [`MixTaps`] to planar buffers
pub struct ChannelMixer;

impl ChannelMixer {
    /// Mix `frames` frames of `input` into `output` (resized per output channel)
    pub fn apply(taps: &MixTaps, input: &[Vec<f32>], frames: usize, output: &mut [Vec<f32>]) {
        for (k, dst) in output.iter_mut().enumerate().take(taps.outputs()) {
            dst.clear();
            dst.resize(frames, 0.0);
            for &(i, gain) in taps.for_output(k) {
                let Some(src) = input.get(i) else { continue };
                for (d, s) in dst.iter_mut().zip(&src[..frames.min(src.len())]) {
                    *d += s * gain;
                }
            }
        }
    }
}

/// Add `src` into `acc` with saturation, over the shorter length
///
/// # Example
/// ```
/// use multiroom_core::dsp::mix_saturating;
///
/// let mut acc = [i32::MAX - 1, -5, i32::MIN];
/// mix_saturating(&mut acc, &[10, 5, -1]);
/// assert_eq!(acc, [i32::MAX, 0, i32::MIN]);
/// ```
pub fn mix_saturating(acc: &mut [i32], src: &[i32]) {
    for (a, &s) in acc.iter_mut().zip(src) {
        *a = a.saturating_add(s);
    }
}
