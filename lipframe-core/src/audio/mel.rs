//! Normalised log-mel spectrogram frontend.
//!
//! ## Parameters (must match the audio encoder's training frontend)
//!
//! | Parameter        | Value            |
//! |------------------|------------------|
//! | Sample rate      | 16 000 Hz        |
//! | FFT size         | 800              |
//! | Window / hop     | 800 / 200        |
//! | Frequency bins   | 401 (800/2+1)    |
//! | Mel bands        | 80 (HTK scale)   |
//! | Mel range        | 55–7 600 Hz      |
//! | Pre-emphasis     | 0.97             |
//! | dB ref / floor   | 20 dB / -100 dB  |
//! | Output range     | [-4, 4]          |
//!
//! Frames are taken without centre padding: `(N - win) / hop + 1` frames,
//! the trailing partial frame is dropped. All arithmetic is `f32`.

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::AudioSamples;
use crate::error::{LipframeError, Result};

/// Amplitude floor before the dB conversion (`10^(-100/20)`).
const AMPLITUDE_FLOOR: f32 = 1e-5;

/// Mel frontend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct MelConfig {
    /// Input sample rate (Hz). Default: 16000.
    pub sample_rate: u32,
    /// FFT size. Default: 800.
    pub n_fft: usize,
    /// Hop between frames (samples). Default: 200.
    pub hop_length: usize,
    /// Analysis window length (samples). Default: 800.
    pub win_length: usize,
    /// Number of mel bands. Default: 80.
    pub n_mels: usize,
    /// Lowest filter edge (Hz). Default: 55.
    pub f_min: f32,
    /// Highest filter edge (Hz). Default: 7600.
    pub f_max: f32,
    /// Pre-emphasis coefficient. Default: 0.97.
    pub preemphasis: f32,
    /// Reference level subtracted after the dB conversion. Default: 20.
    pub ref_level_db: f32,
    /// Lower end of the normalised range (dB). Default: -100.
    pub min_level_db: f32,
    /// Output values lie in `[-max_abs_value, max_abs_value]`. Default: 4.
    pub max_abs_value: f32,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            n_fft: 800,
            hop_length: 200,
            win_length: 800,
            n_mels: 80,
            f_min: 55.0,
            f_max: 7_600.0,
            preemphasis: 0.97,
            ref_level_db: 20.0,
            min_level_db: -100.0,
            max_abs_value: 4.0,
        }
    }
}

impl MelConfig {
    /// Reject configurations the frontend cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(LipframeError::InvalidConfig(msg));
        if self.sample_rate == 0 || self.hop_length == 0 || self.win_length == 0 {
            return fail("sample rate, hop and window must be non-zero".into());
        }
        if self.n_fft < self.win_length {
            return fail(format!(
                "n_fft {} is smaller than win_length {}",
                self.n_fft, self.win_length
            ));
        }
        if self.n_mels == 0 {
            return fail("n_mels must be non-zero".into());
        }
        let nyquist = self.sample_rate as f32 / 2.0;
        if !(0.0..self.f_max).contains(&self.f_min) || self.f_max > nyquist {
            return fail(format!(
                "mel range {}..{} Hz invalid for nyquist {nyquist} Hz",
                self.f_min, self.f_max
            ));
        }
        if self.min_level_db >= 0.0 || self.max_abs_value <= 0.0 {
            return fail("min_level_db must be negative and max_abs_value positive".into());
        }
        Ok(())
    }

    /// Number of one-sided FFT bins.
    pub fn n_freqs(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Mel frames per second of audio, when that is a whole number.
    pub fn frames_per_second(&self) -> Option<u32> {
        let hop = u32::try_from(self.hop_length).ok()?;
        (hop != 0 && self.sample_rate % hop == 0).then(|| self.sample_rate / hop)
    }

    /// Frame count for `n_samples` of input.
    pub fn frame_count(&self, n_samples: usize) -> usize {
        if n_samples < self.win_length {
            return 0;
        }
        (n_samples - self.win_length) / self.hop_length + 1
    }
}

/// HTK mel scale.
pub fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

pub fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Periodic Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Triangular mel filterbank, `[n_mels][n_freqs]`.
#[derive(Debug, Clone)]
pub struct MelFilterbank {
    weights: Array2<f32>,
}

impl MelFilterbank {
    pub fn new(config: &MelConfig) -> Self {
        let n_freqs = config.n_freqs();
        let n_mels = config.n_mels;
        let mel_min = hz_to_mel(config.f_min);
        let mel_max = hz_to_mel(config.f_max);

        // n_mels + 2 edge frequencies, equally spaced in mel.
        let edges: Vec<f32> = (0..n_mels + 2)
            .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
            .collect();
        let bin_hz = config.sample_rate as f32 / config.n_fft as f32;

        let mut weights = Array2::<f32>::zeros((n_mels, n_freqs));
        for m in 0..n_mels {
            let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
            let rise = (center - left).max(f32::EPSILON);
            let fall = (right - center).max(f32::EPSILON);
            let enorm = 2.0 / (right - left);
            for k in 0..n_freqs {
                let freq = k as f32 * bin_hz;
                let up = (freq - left) / rise;
                let down = (right - freq) / fall;
                weights[[m, k]] = up.min(down).max(0.0) * enorm;
            }
        }
        Self { weights }
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn n_mels(&self) -> usize {
        self.weights.nrows()
    }

    pub fn n_freqs(&self) -> usize {
        self.weights.ncols()
    }
}

/// Normalised mel spectrogram, `[n_mels][n_frames]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MelSpectrogram {
    data: Array2<f32>,
}

impl MelSpectrogram {
    pub fn from_array(data: Array2<f32>) -> Self {
        Self { data }
    }

    pub fn n_mels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_frames(&self) -> usize {
        self.data.ncols()
    }

    pub fn get(&self, mel: usize, frame: usize) -> f32 {
        self.data[[mel, frame]]
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn into_array(self) -> Array2<f32> {
        self.data
    }
}

/// STFT + mel projection + dB normalisation.
///
/// The filterbank is built once and shared; `process` takes `&self` so one
/// engine can serve several threads.
pub struct MelSpectrogramEngine {
    config: MelConfig,
    filterbank: Arc<MelFilterbank>,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl MelSpectrogramEngine {
    pub fn new(config: MelConfig) -> Result<Self> {
        config.validate()?;
        let filterbank = Arc::new(MelFilterbank::new(&config));
        let window = hann_window(config.win_length);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.n_fft);
        Ok(Self {
            config,
            filterbank,
            window,
            fft,
        })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    pub fn filterbank(&self) -> Arc<MelFilterbank> {
        Arc::clone(&self.filterbank)
    }

    /// Compute the normalised mel spectrogram of `audio`.
    ///
    /// # Errors
    /// `InvalidConfig` if `audio` is not at the configured sample rate,
    /// `EmptySpectrogram` if it is shorter than one analysis window.
    pub fn process(&self, audio: &AudioSamples) -> Result<MelSpectrogram> {
        let cfg = &self.config;
        if audio.sample_rate != cfg.sample_rate {
            return Err(LipframeError::InvalidConfig(format!(
                "mel frontend expects {} Hz audio, got {} Hz",
                cfg.sample_rate, audio.sample_rate
            )));
        }
        let n_frames = cfg.frame_count(audio.len());
        if n_frames == 0 {
            return Err(LipframeError::EmptySpectrogram {
                samples: audio.len(),
                win_length: cfg.win_length,
            });
        }

        let emphasized = preemphasis(&audio.samples, cfg.preemphasis);
        let n_freqs = cfg.n_freqs();

        let mut magnitudes = Array2::<f32>::zeros((n_freqs, n_frames));
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); cfg.n_fft];
        for frame in 0..n_frames {
            let start = frame * cfg.hop_length;
            let samples = &emphasized[start..start + cfg.win_length];

            fft_buf.fill(Complex::new(0.0, 0.0));
            for (slot, (s, w)) in fft_buf.iter_mut().zip(samples.iter().zip(&self.window)) {
                *slot = Complex::new(s * w, 0.0);
            }
            self.fft.process(&mut fft_buf);

            for (k, bin) in fft_buf.iter().take(n_freqs).enumerate() {
                magnitudes[[k, frame]] = bin.norm();
            }
        }

        let mut mel = self.filterbank.weights().dot(&magnitudes);

        let min_level = cfg.min_level_db;
        let max_abs = cfg.max_abs_value;
        let ref_level = cfg.ref_level_db;
        mel.mapv_inplace(|amp| {
            let db = 20.0 * amp.max(AMPLITUDE_FLOOR).log10() - ref_level;
            let scaled = (2.0 * max_abs) * (db - min_level) / (-min_level) - max_abs;
            scaled.clamp(-max_abs, max_abs)
        });

        debug!(samples = audio.len(), frames = n_frames, "mel spectrogram computed");
        Ok(MelSpectrogram::from_array(mel))
    }
}

fn preemphasis(samples: &[f32], coef: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev = 0.0f32;
    for (i, &s) in samples.iter().enumerate() {
        out.push(if i == 0 { s } else { s - coef * prev });
        prev = s;
    }
    out
}
