//! Mel spectrogram → per-video-frame audio embeddings.
//!
//! ```text
//! MelSpectrogram ──crop_window(i)──► MelWindow (16 × n_mels)
//!                                        │ encode (audio encoder session)
//!                                        ▼
//!                          N embeddings ──pad──► EmbeddingSequence (N + 2)
//!                                                     │ context_window(i)
//!                                                     ▼
//!                                   16 embeddings, relabelled to the mode shape
//! ```

pub mod exchange;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audio::mel::{MelConfig, MelSpectrogram};
use crate::error::{LipframeError, Result};

/// Mel time-frames per encoder window.
pub const MEL_WINDOW_FRAMES: usize = 16;
/// Embeddings either side of the target frame.
pub const CONTEXT_RADIUS: usize = 8;
/// Embeddings stacked per generator call (`[i-8, i+8)`).
pub const CONTEXT_LEN: usize = 2 * CONTEXT_RADIUS;
/// Width of one audio-encoder embedding.
pub const ENCODER_EMBEDDING_DIM: usize = 512;

/// Audio feature flavour the generator was trained with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    #[default]
    Ave,
    Hubert,
    Wenet,
}

impl AudioMode {
    /// Generator audio input shape `(1, C, H, W)`.
    pub const fn audio_tensor_shape(self) -> [usize; 4] {
        match self {
            AudioMode::Ave => [1, 32, 16, 16],
            AudioMode::Hubert => [1, 32, 32, 32],
            AudioMode::Wenet => [1, 256, 16, 32],
        }
    }

    /// Values in one generator audio tensor.
    pub const fn context_values(self) -> usize {
        let [n, c, h, w] = self.audio_tensor_shape();
        n * c * h * w
    }

    /// Width of a single per-frame embedding in this mode.
    pub const fn embedding_dim(self) -> usize {
        self.context_values() / CONTEXT_LEN
    }

    pub const fn default_fps(self) -> u32 {
        match self {
            AudioMode::Wenet => 20,
            AudioMode::Ave | AudioMode::Hubert => 25,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            AudioMode::Ave => "ave",
            AudioMode::Hubert => "hubert",
            AudioMode::Wenet => "wenet",
        }
    }
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioMode {
    type Err = LipframeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ave" => Ok(AudioMode::Ave),
            "hubert" => Ok(AudioMode::Hubert),
            "wenet" => Ok(AudioMode::Wenet),
            other => Err(LipframeError::InvalidConfig(format!(
                "unknown audio mode '{other}' (expected ave, hubert or wenet)"
            ))),
        }
    }
}

/// 16 consecutive mel frames, stored time-major (`[16][n_mels]`).
#[derive(Debug, Clone, PartialEq)]
pub struct MelWindow {
    n_mels: usize,
    data: Vec<f32>,
}

impl MelWindow {
    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    pub fn frames(&self) -> usize {
        MEL_WINDOW_FRAMES
    }

    pub fn get(&self, frame: usize, mel: usize) -> f32 {
        self.data[frame * self.n_mels + mel]
    }

    /// Time-major values.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Encoder input shape `(1, 1, n_mels, 16)`.
    pub fn encoder_shape(&self) -> [usize; 4] {
        [1, 1, self.n_mels, MEL_WINDOW_FRAMES]
    }

    /// Values transposed to the encoder's mel-major layout.
    pub fn to_encoder_layout(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.data.len()];
        for t in 0..MEL_WINDOW_FRAMES {
            for m in 0..self.n_mels {
                out[m * MEL_WINDOW_FRAMES + t] = self.data[t * self.n_mels + m];
            }
        }
        out
    }
}

/// Padded per-frame embedding sequence, flat `[len][dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSequence {
    dim: usize,
    data: Vec<f32>,
}

impl EmbeddingSequence {
    /// Wrap already-padded flat data.
    pub fn from_flat(dim: usize, data: Vec<f32>) -> Result<Self> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(LipframeError::ShapeMismatch {
                tensor: "embedding sequence".into(),
                expected: vec![data.len() / dim.max(1), dim],
                actual: vec![data.len()],
            });
        }
        Ok(Self { dim, data })
    }

    /// Duplicate the first embedding at the head and the last at the tail.
    pub fn pad(embeddings: Vec<Vec<f32>>) -> Result<Self> {
        let (Some(first), Some(last)) = (embeddings.first(), embeddings.last()) else {
            return Err(LipframeError::InsufficientAudio(
                "no encoder windows to pad".into(),
            ));
        };
        let dim = first.len();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dim) {
            return Err(LipframeError::ShapeMismatch {
                tensor: "audio embedding".into(),
                expected: vec![dim],
                actual: vec![bad.len()],
            });
        }

        let mut data = Vec::with_capacity((embeddings.len() + 2) * dim);
        data.extend_from_slice(first);
        let last = last.clone();
        for e in embeddings {
            data.extend(e);
        }
        data.extend(last);
        Ok(Self { dim, data })
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.dim)?;
        self.data.get(start..start + self.dim)
    }

    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }

    /// Gather embeddings `[index-8, index+8)` into `out`, zero-filling
    /// positions outside the sequence.
    ///
    /// `out` must hold exactly `CONTEXT_LEN * dim` values; its contents are
    /// then a pure relabelling to whatever tensor shape the caller declares.
    pub fn context_into(&self, index: usize, out: &mut [f32]) -> Result<()> {
        let needed = CONTEXT_LEN * self.dim;
        if out.len() != needed {
            return Err(LipframeError::ShapeMismatch {
                tensor: "context window".into(),
                expected: vec![needed],
                actual: vec![out.len()],
            });
        }
        let len = self.len() as isize;
        for (slot, chunk) in out.chunks_exact_mut(self.dim).enumerate() {
            let src = index as isize - CONTEXT_RADIUS as isize + slot as isize;
            if (0..len).contains(&src) {
                let start = src as usize * self.dim;
                chunk.copy_from_slice(&self.data[start..start + self.dim]);
            } else {
                chunk.fill(0.0);
            }
        }
        Ok(())
    }

    /// Context window for `index`, shaped for `mode`.
    pub fn context_window(&self, index: usize, mode: AudioMode) -> Result<ContextWindow> {
        if self.dim != mode.embedding_dim() {
            return Err(LipframeError::ShapeMismatch {
                tensor: format!("{mode} embedding"),
                expected: vec![mode.embedding_dim()],
                actual: vec![self.dim],
            });
        }
        let mut data = vec![0.0; mode.context_values()];
        self.context_into(index, &mut data)?;
        Ok(ContextWindow {
            shape: mode.audio_tensor_shape(),
            data,
        })
    }
}

/// Flattened context embeddings plus the shape they are presented as.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindow {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

/// Maps video frames onto mel windows.
#[derive(Debug, Clone)]
pub struct FeatureWindowExtractor {
    fps: u32,
    /// Mel frames per second of audio (`sample_rate / hop_length`).
    mel_rate: u32,
}

impl FeatureWindowExtractor {
    /// # Errors
    /// `InvalidConfig` when `fps` is zero or the hop does not divide the
    /// sample rate.
    pub fn new(mel: &MelConfig, fps: u32) -> Result<Self> {
        if fps == 0 {
            return Err(LipframeError::InvalidConfig("fps must be non-zero".into()));
        }
        let mel_rate = mel.frames_per_second().ok_or_else(|| {
            LipframeError::InvalidConfig(format!(
                "hop length {} does not divide sample rate {}",
                mel.hop_length, mel.sample_rate
            ))
        })?;
        Ok(Self { fps, mel_rate })
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn mel_rate(&self) -> u32 {
        self.mel_rate
    }

    /// Number of encoder windows (video frames before padding):
    /// `floor((T - 16) * fps / mel_rate) + 2`.
    pub fn frame_count(&self, mel: &MelSpectrogram) -> Result<usize> {
        let t = mel.n_frames();
        if t < MEL_WINDOW_FRAMES {
            return Err(LipframeError::InsufficientAudio(format!(
                "{t} mel frames, need at least {MEL_WINDOW_FRAMES}"
            )));
        }
        let span = (t - MEL_WINDOW_FRAMES) as u64 * u64::from(self.fps);
        Ok((span / u64::from(self.mel_rate)) as usize + 2)
    }

    /// First mel frame of the window for `frame_idx`, shifted left to fit.
    pub fn window_start(&self, n_frames: usize, frame_idx: usize) -> Result<usize> {
        let start = frame_idx as u64 * u64::from(self.mel_rate) / u64::from(self.fps);
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        if start.saturating_add(MEL_WINDOW_FRAMES) <= n_frames {
            return Ok(start);
        }
        n_frames.checked_sub(MEL_WINDOW_FRAMES).ok_or_else(|| {
            LipframeError::InsufficientAudio(format!(
                "frame {frame_idx}: {n_frames} mel frames cannot hold a {MEL_WINDOW_FRAMES}-frame window"
            ))
        })
    }

    /// The 16-frame mel window for `frame_idx`.
    pub fn crop_window(&self, mel: &MelSpectrogram, frame_idx: usize) -> Result<MelWindow> {
        let start = self.window_start(mel.n_frames(), frame_idx)?;
        let n_mels = mel.n_mels();
        let mut data = Vec::with_capacity(MEL_WINDOW_FRAMES * n_mels);
        for t in start..start + MEL_WINDOW_FRAMES {
            data.extend(mel.as_array().column(t).iter().copied());
        }
        Ok(MelWindow { n_mels, data })
    }

    /// Encode every window in index order and pad the result.
    pub fn build_embedding_sequence<F>(
        &self,
        mel: &MelSpectrogram,
        mut encode: F,
    ) -> Result<EmbeddingSequence>
    where
        F: FnMut(&MelWindow) -> Result<Vec<f32>>,
    {
        let n = self.frame_count(mel)?;
        let mut embeddings = Vec::with_capacity(n);
        for idx in 0..n {
            let window = self.crop_window(mel, idx)?;
            embeddings.push(encode(&window)?);
        }
        EmbeddingSequence::pad(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp_mel(n_frames: usize) -> MelSpectrogram {
        // value = frame index, so windows are easy to identify
        MelSpectrogram::from_array(Array2::from_shape_fn((80, n_frames), |(_, t)| t as f32))
    }

    fn extractor(fps: u32) -> FeatureWindowExtractor {
        FeatureWindowExtractor::new(&MelConfig::default(), fps).unwrap()
    }

    #[test]
    fn frame_count_follows_mel_rate() {
        // 161 mel frames → floor(145 * 25 / 80) + 2 = 47
        assert_eq!(extractor(25).frame_count(&ramp_mel(161)).unwrap(), 47);
        assert_eq!(extractor(20).frame_count(&ramp_mel(161)).unwrap(), 38);
        assert_eq!(extractor(25).frame_count(&ramp_mel(16)).unwrap(), 2);
        assert!(matches!(
            extractor(25).frame_count(&ramp_mel(15)),
            Err(LipframeError::InsufficientAudio(_))
        ));
    }

    #[test]
    fn windows_start_at_scaled_index_and_shift_left_at_the_end() {
        let mel = ramp_mel(161);
        let ex = extractor(25);
        let w = ex.crop_window(&mel, 10).unwrap();
        assert_eq!(w.get(0, 0), 32.0); // floor(80 * 10 / 25)
        assert_eq!(w.get(15, 79), 47.0);

        // Last frame would start at 147; shifted to 145 so it still holds 16 frames.
        let last = ex.frame_count(&mel).unwrap() - 1;
        let w = ex.crop_window(&mel, last).unwrap();
        assert_eq!(w.get(0, 0), 145.0);
        assert_eq!(w.get(15, 0), 160.0);
    }

    #[test]
    fn window_too_large_for_spectrogram_is_an_error() {
        let mel = ramp_mel(10);
        assert!(matches!(
            extractor(25).crop_window(&mel, 0),
            Err(LipframeError::InsufficientAudio(_))
        ));
    }

    #[test]
    fn encoder_layout_is_mel_major() {
        let mel = MelSpectrogram::from_array(Array2::from_shape_fn((80, 16), |(m, t)| {
            (m * 100 + t) as f32
        }));
        let w = extractor(25).crop_window(&mel, 0).unwrap();
        assert_eq!(w.encoder_shape(), [1, 1, 80, 16]);
        let enc = w.to_encoder_layout();
        assert_eq!(enc[3 * 16 + 5], 305.0);
        assert_eq!(enc[79 * 16 + 15], 7915.0);
    }

    #[test]
    fn sequence_is_padded_with_first_and_last() {
        let mel = ramp_mel(161);
        let ex = extractor(25);
        let mut calls = 0;
        let seq = ex
            .build_embedding_sequence(&mel, |w| {
                calls += 1;
                Ok(vec![w.get(0, 0); 4])
            })
            .unwrap();
        assert_eq!(calls, 47);
        assert_eq!(seq.len(), 49);
        assert_eq!(seq.get(0), seq.get(1));
        assert_eq!(seq.get(47), seq.get(48));
        assert_eq!(seq.get(2).unwrap()[0], 3.0); // floor(80/25)
    }

    #[test]
    fn context_window_zero_fills_outside_the_sequence() {
        let embeddings: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32 + 1.0; 512]).collect();
        let seq = EmbeddingSequence::pad(embeddings).unwrap();
        assert_eq!(seq.len(), 7);

        let ctx = seq.context_window(0, AudioMode::Ave).unwrap();
        assert_eq!(ctx.shape, [1, 32, 16, 16]);
        assert_eq!(ctx.data.len(), 8192);
        // slots 0..8 are before the start
        assert!(ctx.data[..8 * 512].iter().all(|&v| v == 0.0));
        assert_eq!(ctx.data[8 * 512], 1.0);
        // slots for indices 7.. are past the end (len 7)
        assert!(ctx.data[15 * 512..].iter().all(|&v| v == 0.0));
        assert_eq!(ctx.data[14 * 512], 5.0);
    }

    #[test]
    fn context_reshape_is_a_relabel() {
        let embeddings: Vec<Vec<f32>> = (0..40)
            .map(|i| (0..512).map(|j| (i * 512 + j) as f32).collect())
            .collect();
        let seq = EmbeddingSequence::pad(embeddings).unwrap();
        let ctx = seq.context_window(20, AudioMode::Ave).unwrap();
        let mut flat = vec![0.0; 8192];
        seq.context_into(20, &mut flat).unwrap();
        assert_eq!(ctx.data, flat);
        assert_eq!(&ctx.data[..512], seq.get(12).unwrap());
    }

    #[test]
    fn mode_shapes_and_dims() {
        assert_eq!(AudioMode::Ave.embedding_dim(), 512);
        assert_eq!(AudioMode::Hubert.embedding_dim(), 2048);
        assert_eq!(AudioMode::Wenet.embedding_dim(), 8192);
        assert_eq!(AudioMode::Wenet.context_values(), 131_072);
        assert_eq!(AudioMode::Wenet.default_fps(), 20);
        assert_eq!("HuBERT".parse::<AudioMode>().unwrap(), AudioMode::Hubert);
        assert!("mfcc".parse::<AudioMode>().is_err());

        let seq = EmbeddingSequence::pad(vec![vec![0.0; 512]; 3]).unwrap();
        assert!(matches!(
            seq.context_window(0, AudioMode::Hubert),
            Err(LipframeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn pad_rejects_empty_and_ragged_input() {
        assert!(EmbeddingSequence::pad(Vec::new()).is_err());
        assert!(EmbeddingSequence::pad(vec![vec![0.0; 4], vec![0.0; 3]]).is_err());
    }
}
