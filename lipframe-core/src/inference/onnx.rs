//! ONNX Runtime backend via the `ort` crate.
//!
//! One `OnnxBackend` owns one single-threaded session. Parallelism comes
//! from putting one backend per core into a [`SessionPool`], which scales
//! better for these small per-frame graphs than one session with a large
//! intra-op thread pool.
//!
//! | Env var                        | Effect                               |
//! |--------------------------------|--------------------------------------|
//! | `LIPFRAME_ORT_INTRA_THREADS`   | intra-op threads per session (def. 1)|
//! | `LIPFRAME_ORT_OPT_LEVEL`       | `0`–`3`, graph optimisation level    |
//!
//! [`SessionPool`]: crate::inference::SessionPool

use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{debug, info};

use crate::error::{LipframeError, Result};
use crate::inference::{InferenceBackend, Tensor, TensorView};

fn intra_threads() -> usize {
    std::env::var("LIPFRAME_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, 32)
}

fn optimization_level() -> GraphOptimizationLevel {
    match std::env::var("LIPFRAME_ORT_OPT_LEVEL")
        .unwrap_or_default()
        .trim()
    {
        "0" => GraphOptimizationLevel::Disable,
        "1" => GraphOptimizationLevel::Level1,
        "2" => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

fn create_session(model_path: &Path) -> Result<Session> {
    let threads = intra_threads();
    let session = SessionBuilder::new()
        .map_err(|e| LipframeError::OnnxSession(e.to_string()))?
        .with_intra_threads(threads)
        .map_err(|e| LipframeError::OnnxSession(e.to_string()))?
        .with_inter_threads(1)
        .map_err(|e| LipframeError::OnnxSession(e.to_string()))?
        .with_optimization_level(optimization_level())
        .map_err(|e| LipframeError::OnnxSession(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| LipframeError::OnnxSession(e.to_string()))?;
    debug!(path = %model_path.display(), intra_threads = threads, "ONNX session created");
    Ok(session)
}

/// A single ONNX Runtime session, loaded on `warm_up`.
pub struct OnnxBackend {
    model_path: PathBuf,
    session: Option<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxBackend {
    /// # Errors
    /// `ModelNotFound` if `model_path` does not exist.
    pub fn new(model_path: impl Into<PathBuf>) -> Result<Self> {
        let model_path = model_path.into();
        if !model_path.exists() {
            return Err(LipframeError::ModelNotFound { path: model_path });
        }
        Ok(Self {
            model_path,
            session: None,
            input_names: Vec::new(),
            output_names: Vec::new(),
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

impl InferenceBackend for OnnxBackend {
    fn warm_up(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = create_session(&self.model_path)?;
        self.input_names = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        self.output_names = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        info!(
            path = %self.model_path.display(),
            inputs = ?self.input_names,
            outputs = ?self.output_names,
            "ONNX model loaded"
        );
        self.session = Some(session);
        Ok(())
    }

    fn infer(&mut self, inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
        let Some(session) = self.session.as_mut() else {
            return Err(LipframeError::OnnxSession(
                "model not loaded; call warm_up() first".into(),
            ));
        };
        if inputs.len() != self.input_names.len() {
            return Err(LipframeError::Inference(format!(
                "{} expects {} inputs, got {}",
                self.model_path.display(),
                self.input_names.len(),
                inputs.len()
            )));
        }

        let mut input_values: Vec<(String, SessionInputValue<'_>)> =
            Vec::with_capacity(inputs.len());
        for (name, view) in self.input_names.iter().zip(inputs) {
            let array = ArrayD::<f32>::from_shape_vec(IxDyn(view.shape), view.data.to_vec())
                .map_err(|e| LipframeError::Inference(e.to_string()))?;
            let value = Value::from_array(array)
                .map_err(|e: ort::Error| LipframeError::OnnxSession(e.to_string()))?;
            input_values.push((name.clone(), value.into()));
        }

        let outputs = session
            .run(input_values)
            .map_err(|e| LipframeError::OnnxSession(e.to_string()))?;

        let mut tensors = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = outputs.get(name.as_str()).ok_or_else(|| {
                LipframeError::OnnxSession(format!("output '{name}' missing from run"))
            })?;
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| LipframeError::OnnxSession(e.to_string()))?;
            let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
            tensors.push(Tensor::new(shape, data.to_vec())?);
        }
        Ok(tensors)
    }
}
