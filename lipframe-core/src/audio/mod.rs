//! Audio input: decoded samples, WAV loading and the mel frontend.
//!
//! Everything downstream of this module sees mono f32 PCM at
//! [`TARGET_SAMPLE_RATE`]. Multichannel sources are averaged to mono and
//! other sample rates are resampled with [`resample::RateConverter`].

pub mod mel;
pub mod resample;

use std::path::Path;

use tracing::info;

use crate::error::{LipframeError, Result};

/// Sample rate the mel frontend and audio encoder are defined at (Hz).
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct AudioSamples {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioSamples {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Resample to `target_rate`, returning `self` unchanged if already there.
    pub fn into_rate(self, target_rate: u32) -> Result<Self> {
        if self.sample_rate == target_rate {
            return Ok(self);
        }
        let samples = resample::resample(&self.samples, self.sample_rate, target_rate)?;
        Ok(Self::new(samples, target_rate))
    }
}

/// Decode a WAV file to mono f32 at [`TARGET_SAMPLE_RATE`].
///
/// # Errors
/// `AssetNotFound` if the file is missing, `InvalidWav` for unreadable
/// headers or sample data.
pub fn load_wav(path: impl AsRef<Path>) -> Result<AudioSamples> {
    let path = path.as_ref();
    let decoded = decode_wav(path)?;
    let source_rate = decoded.sample_rate;
    let audio = decoded.into_rate(TARGET_SAMPLE_RATE)?;
    info!(
        path = %path.display(),
        source_rate,
        samples = audio.len(),
        seconds = audio.duration_secs(),
        "audio loaded"
    );
    Ok(audio)
}

/// Decode a WAV file to mono f32 at its native sample rate.
pub fn decode_wav(path: &Path) -> Result<AudioSamples> {
    if !path.exists() {
        return Err(LipframeError::AssetNotFound {
            path: path.to_path_buf(),
        });
    }
    let invalid = |reason: String| LipframeError::InvalidWav {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = hound::WavReader::open(path).map_err(|e| invalid(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| invalid(e.to_string()))?,
        hound::SampleFormat::Int => {
            if !(8..=32).contains(&spec.bits_per_sample) {
                return Err(invalid(format!(
                    "unsupported integer depth of {} bits",
                    spec.bits_per_sample
                )));
            }
            // Full scale of a signed sample at this depth (8-bit comes back signed).
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| invalid(e.to_string()))?
        }
    };

    if channels == 1 {
        return Ok(AudioSamples::new(interleaved, spec.sample_rate));
    }

    let mono = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok(AudioSamples::new(mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in frames {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn loads_mono_16k_without_resampling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let frames: Vec<i16> = (0..1600).map(|i| ((i % 100) * 100) as i16).collect();
        write_wav(&path, 16_000, 1, &frames);

        let audio = load_wav(&path).unwrap();
        assert_eq!(audio.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(audio.len(), 1600);
        approx::assert_abs_diff_eq!(audio.samples[1], 100.0 / 32768.0, epsilon = 1e-6);
    }

    fn write_int_wav(path: &Path, bits_per_sample: u16, frames: &[i32]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in frames {
            if bits_per_sample == 8 {
                writer.write_sample(*s as i8).unwrap();
            } else {
                writer.write_sample(*s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn eight_and_twenty_four_bit_samples_use_their_own_full_scale() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("u8.wav");
        write_int_wav(&path, 8, &[127, -128, 0]);
        let audio = decode_wav(&path).unwrap();
        approx::assert_abs_diff_eq!(audio.samples[0], 127.0 / 128.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(audio.samples[1], -1.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(audio.samples[2], 0.0, epsilon = 1e-6);

        let path = dir.path().join("s24.wav");
        write_int_wav(&path, 24, &[8_388_607, -4_194_304]);
        let audio = decode_wav(&path).unwrap();
        approx::assert_abs_diff_eq!(audio.samples[0], 8_388_607.0 / 8_388_608.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(audio.samples[1], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 16_000, 2, &[1000, 3000, -2000, 2000]);

        let audio = decode_wav(&path).unwrap();
        assert_eq!(audio.len(), 2);
        approx::assert_abs_diff_eq!(audio.samples[0], 2000.0 / 32768.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(audio.samples[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn other_rates_are_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("48k.wav");
        write_wav(&path, 48_000, 1, &vec![0i16; 48_000]);

        let audio = load_wav(&path).unwrap();
        assert_eq!(audio.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(audio.len(), 16_000);
    }

    #[test]
    fn missing_and_garbage_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.wav");
        assert!(matches!(
            load_wav(&missing),
            Err(LipframeError::AssetNotFound { .. })
        ));

        let garbage = dir.path().join("garbage.wav");
        std::fs::write(&garbage, b"definitely not a riff header").unwrap();
        assert!(matches!(
            load_wav(&garbage),
            Err(LipframeError::InvalidWav { .. })
        ));
    }
}
