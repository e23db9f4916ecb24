//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Source WAVs arrive at whatever rate they were recorded at (44.1 kHz and
//! 48 kHz are common). The mel frontend is defined at 16 kHz, so every
//! decoded track passes through `RateConverter` once before analysis.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use crate::error::{LipframeError, Result};

/// Input frames handed to rubato per call.
pub const DEFAULT_CHUNK: usize = 1024;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds a partial input chunk between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    ratio: f64,
    /// Total input samples seen, used to trim the flushed tail.
    consumed: usize,
    produced: usize,
    /// `[1][output_frames_max]`
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `LipframeError::InvalidConfig` if rubato rejects the ratio.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 || chunk_size == 0 {
            return Err(LipframeError::InvalidConfig(format!(
                "resampler needs non-zero rates and chunk (from={source_rate} to={target_rate} chunk={chunk_size})"
            )));
        }

        let ratio = target_rate as f64 / source_rate as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                ratio,
                consumed: 0,
                produced: 0,
                output_buf: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| LipframeError::InvalidConfig(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        debug!(source_rate, target_rate, chunk_size, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            ratio,
            consumed: 0,
            produced: 0,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call or for
    /// [`RateConverter::finish`].
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.consumed += samples.len();
        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        let mut offset = 0;
        while self.input_buf.len() - offset >= self.chunk_size {
            let input_slice = &self.input_buf[offset..offset + self.chunk_size];
            let (_, produced) = resampler
                .process_into_buffer(&[input_slice], &mut self.output_buf, None)
                .map_err(|e| LipframeError::Other(anyhow::anyhow!("resampler process: {e}")))?;
            result.extend_from_slice(&self.output_buf[0][..produced]);
            offset += self.chunk_size;
        }
        self.input_buf.drain(..offset);
        self.produced += result.len();

        Ok(result)
    }

    /// Flush the buffered remainder, zero-padding it to a full chunk, and
    /// trim the total output to `round(consumed * ratio)` samples.
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        if self.resampler.is_none() {
            return Ok(Vec::new());
        }

        let expected = (self.consumed as f64 * self.ratio).round() as usize;
        let mut tail = Vec::new();
        // Two chunks of silence cover both the remainder and the filter delay.
        for _ in 0..2 {
            if self.produced + tail.len() >= expected {
                break;
            }
            let pad = self.chunk_size - self.input_buf.len() % self.chunk_size;
            let zeros = vec![0f32; pad];
            let consumed_before = self.consumed;
            let produced_before = self.produced;
            let out = self.process(&zeros)?;
            self.consumed = consumed_before;
            self.produced = produced_before;
            tail.extend(out);
        }

        let room = expected.saturating_sub(self.produced);
        tail.truncate(room);
        self.produced += tail.len();
        self.input_buf.clear();
        Ok(tail)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Resample a whole buffer in one go.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    let mut rc = RateConverter::new(source_rate, target_rate, DEFAULT_CHUNK)?;
    if rc.is_passthrough() {
        return Ok(samples.to_vec());
    }
    let mut out = rc.process(samples)?;
    out.extend(rc.finish()?);
    Ok(out)
}
