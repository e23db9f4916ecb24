//! Weight-free stand-ins for the audio encoder and the generator.
//!
//! Both are deterministic so the whole render path (windowing, pooling,
//! scheduling, compositing, output) can be exercised end-to-end without
//! model files.

use tracing::debug;

use crate::error::{LipframeError, Result};
use crate::features::ENCODER_EMBEDDING_DIM;
use crate::inference::{InferenceBackend, Tensor, TensorView, GENERATOR_INPUT};

/// Emits `mean(window) + j * 1e-3` for embedding slot `j`.
#[derive(Debug, Default)]
pub struct StubEncoder {
    calls: usize,
}

impl StubEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl InferenceBackend for StubEncoder {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubEncoder::warm_up: nothing to load");
        Ok(())
    }

    fn infer(&mut self, inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
        let window = inputs
            .first()
            .ok_or_else(|| LipframeError::Inference("stub encoder needs one input".into()))?;
        self.calls += 1;
        let mean = window.data.iter().sum::<f32>() / window.data.len().max(1) as f32;
        let data = (0..ENCODER_EMBEDDING_DIM)
            .map(|j| mean + j as f32 * 1e-3)
            .collect();
        Tensor::new(vec![1, ENCODER_EMBEDDING_DIM], data).map(|t| vec![t])
    }
}

/// Echoes the unmasked half of the image tensor back as the generated face.
#[derive(Debug, Default)]
pub struct StubGenerator {
    calls: usize,
}

impl StubGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl InferenceBackend for StubGenerator {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubGenerator::warm_up: nothing to load");
        Ok(())
    }

    fn infer(&mut self, inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
        let image = inputs
            .first()
            .ok_or_else(|| LipframeError::Inference("stub generator needs an image input".into()))?;
        let plane = GENERATOR_INPUT * GENERATOR_INPUT;
        let Some(unmasked) = image.data.get(..3 * plane) else {
            return Err(LipframeError::Inference(format!(
                "stub generator: image input has {} values, need {}",
                image.data.len(),
                3 * plane
            )));
        };
        self.calls += 1;
        Tensor::new(
            vec![1, 3, GENERATOR_INPUT, GENERATOR_INPUT],
            unmasked.to_vec(),
        )
        .map(|t| vec![t])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::AudioMode;
    use crate::inference::ShapeContract;

    #[test]
    fn encoder_satisfies_the_encoder_contract() {
        let input = Tensor::new(vec![1, 1, 80, 16], vec![2.0; 1280]).unwrap();
        let mut enc = StubEncoder::new();
        let out = ShapeContract::audio_encoder(80)
            .infer(&mut enc, &[input.view()])
            .unwrap();
        approx::assert_abs_diff_eq!(out[0].data[0], 2.0);
        approx::assert_abs_diff_eq!(out[0].data[10], 2.01, epsilon = 1e-6);
        assert_eq!(enc.calls(), 1);
    }

    #[test]
    fn generator_echoes_unmasked_channels() {
        let mut image = Tensor::zeros(&[1, 6, 320, 320]);
        image.data[5] = 0.25;
        image.data[3 * 320 * 320 + 5] = 0.75; // masked half is ignored
        let audio = Tensor::zeros(&[1, 32, 16, 16]);
        let mut gen = StubGenerator::new();
        let out = ShapeContract::generator(AudioMode::Ave)
            .infer(&mut gen, &[image.view(), audio.view()])
            .unwrap();
        assert_eq!(out[0].data[5], 0.25);
        assert_eq!(out[0].data.len(), 3 * 320 * 320);
    }
}
