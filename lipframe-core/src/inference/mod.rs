//! Inference capability boundary.
//!
//! The pipeline only ever sees [`InferenceBackend::infer`]: flat `f32`
//! tensors in, flat `f32` tensors out. Every call made by the pipeline goes
//! through a [`ShapeContract`], so a model exported with the wrong shapes
//! fails loudly at the first frame instead of producing garbage.
//!
//! `&mut self` on `infer` expresses that a runtime session is not shared:
//! concurrency comes from holding several backends in a [`SessionPool`],
//! one per worker, never from locking a single session.

pub mod session_pool;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;
pub use session_pool::{SessionLease, SessionPool};

use std::path::PathBuf;

use crate::error::{LipframeError, Result};
use crate::features::{AudioMode, ENCODER_EMBEDDING_DIM, MEL_WINDOW_FRAMES};

/// Side of the square image tensor fed to the generator.
pub const GENERATOR_INPUT: usize = 320;

/// Owned tensor: row-major data plus its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(LipframeError::ShapeMismatch {
                tensor: "tensor".into(),
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            shape: &self.shape,
            data: &self.data,
        }
    }
}

/// Borrowed tensor handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub shape: &'a [usize],
    pub data: &'a [f32],
}

impl<'a> TensorView<'a> {
    pub fn new(shape: &'a [usize], data: &'a [f32]) -> Self {
        Self { shape, data }
    }
}

/// Contract for inference backends.
pub trait InferenceBackend: Send + 'static {
    /// One-time warm-up: load weights and run a dummy pass if useful.
    /// Called once by [`SessionPool::new`] for every handle.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Run one forward pass. Inputs are positional.
    fn infer(&mut self, inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>>;
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }

    fn infer(&mut self, inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
        (**self).infer(inputs)
    }
}

/// Type-erased backend, for pools mixing runtime and stub sessions.
pub type DynBackend = Box<dyn InferenceBackend>;

/// Expected input and output shapes of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeContract {
    pub name: &'static str,
    pub inputs: Vec<Vec<usize>>,
    pub outputs: Vec<Vec<usize>>,
}

impl ShapeContract {
    /// `(1, 1, n_mels, 16)` → `(1, 512)`.
    pub fn audio_encoder(n_mels: usize) -> Self {
        Self {
            name: "audio encoder",
            inputs: vec![vec![1, 1, n_mels, MEL_WINDOW_FRAMES]],
            outputs: vec![vec![1, ENCODER_EMBEDDING_DIM]],
        }
    }

    /// `(1, 6, 320, 320)` + mode audio tensor → `(1, 3, 320, 320)`.
    pub fn generator(mode: AudioMode) -> Self {
        Self {
            name: "generator",
            inputs: vec![
                vec![1, 6, GENERATOR_INPUT, GENERATOR_INPUT],
                mode.audio_tensor_shape().to_vec(),
            ],
            outputs: vec![vec![1, 3, GENERATOR_INPUT, GENERATOR_INPUT]],
        }
    }

    pub fn check_inputs(&self, inputs: &[TensorView<'_>]) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            return Err(self.mismatch("input count", vec![self.inputs.len()], vec![inputs.len()]));
        }
        for (i, (view, expected)) in inputs.iter().zip(&self.inputs).enumerate() {
            if view.shape != expected.as_slice() {
                return Err(self.mismatch(&format!("input {i}"), expected.clone(), view.shape.to_vec()));
            }
            if view.data.len() != expected.iter().product::<usize>() {
                return Err(self.mismatch(
                    &format!("input {i} data"),
                    expected.clone(),
                    vec![view.data.len()],
                ));
            }
        }
        Ok(())
    }

    /// Extra trailing outputs are allowed; the declared ones must match.
    pub fn check_outputs(&self, outputs: &[Tensor]) -> Result<()> {
        if outputs.len() < self.outputs.len() {
            return Err(self.mismatch("output count", vec![self.outputs.len()], vec![outputs.len()]));
        }
        for (i, (tensor, expected)) in outputs.iter().zip(&self.outputs).enumerate() {
            if &tensor.shape != expected || tensor.data.len() != expected.iter().product::<usize>() {
                return Err(self.mismatch(&format!("output {i}"), expected.clone(), tensor.shape.clone()));
            }
        }
        Ok(())
    }

    /// Shape-checked forward pass.
    pub fn infer<B: InferenceBackend + ?Sized>(
        &self,
        backend: &mut B,
        inputs: &[TensorView<'_>],
    ) -> Result<Vec<Tensor>> {
        self.check_inputs(inputs)?;
        let outputs = backend.infer(inputs)?;
        self.check_outputs(&outputs)?;
        Ok(outputs)
    }

    fn mismatch(&self, what: &str, expected: Vec<usize>, actual: Vec<usize>) -> LipframeError {
        LipframeError::ShapeMismatch {
            tensor: format!("{} {what}", self.name),
            expected,
            actual,
        }
    }
}

/// Directory model files are looked up in: `LIPFRAME_MODEL_DIR`, else `./models`.
pub fn models_dir() -> PathBuf {
    std::env::var("LIPFRAME_MODEL_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("models"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Tensor>);

    impl InferenceBackend for Fixed {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }

        fn infer(&mut self, _inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn encoder_contract_accepts_matching_shapes() {
        let contract = ShapeContract::audio_encoder(80);
        let input = Tensor::zeros(&[1, 1, 80, 16]);
        let mut backend = Fixed(vec![Tensor::zeros(&[1, 512])]);
        let out = contract.infer(&mut backend, &[input.view()]).unwrap();
        assert_eq!(out[0].shape, vec![1, 512]);
    }

    #[test]
    fn wrong_input_shape_is_rejected_before_inference() {
        let contract = ShapeContract::audio_encoder(80);
        let input = Tensor::zeros(&[1, 1, 16, 80]);
        let mut backend = Fixed(vec![Tensor::zeros(&[1, 512])]);
        let err = contract.infer(&mut backend, &[input.view()]).unwrap_err();
        assert!(matches!(err, LipframeError::ShapeMismatch { .. }));
        assert!(err.to_string().contains("audio encoder input 0"));
    }

    #[test]
    fn wrong_output_shape_is_rejected() {
        let contract = ShapeContract::generator(AudioMode::Ave);
        let image = Tensor::zeros(&[1, 6, 320, 320]);
        let audio = Tensor::zeros(&[1, 32, 16, 16]);
        let mut backend = Fixed(vec![Tensor::zeros(&[1, 3, 256, 256])]);
        assert!(matches!(
            contract.infer(&mut backend, &[image.view(), audio.view()]),
            Err(LipframeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn generator_contract_follows_mode() {
        let contract = ShapeContract::generator(AudioMode::Wenet);
        assert_eq!(contract.inputs[1], vec![1, 256, 16, 32]);
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
    }
}
