//! # lipframe-core
//!
//! Audio-driven talking-head frame synthesis SDK.
//!
//! ## Architecture
//!
//! ```text
//! WAV → AudioSamples (16 kHz) → MelSpectrogramEngine → FeatureWindowExtractor
//!                                                          │ audio encoder (SessionPool)
//!                                                          ▼
//!                                             EmbeddingSequence (N + 2)
//!                                                          │
//!          BatchScheduler ── per frame i ──► TemplateIndexSelector::index_at(i)
//!                                             FrameCompositor::prepare
//!                                             generator (SessionPool)
//!                                             FrameCompositor::composite
//!                                                          ▼
//!                                                 frame_<i:05>.jpg
//! ```
//!
//! Inference is reached only through [`InferenceBackend`]; the `onnx` feature
//! adds the ONNX Runtime implementation, the stubs in [`inference::stub`]
//! run the whole pipeline without model files.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod compositor;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod inference;
pub mod pool;
pub mod template;

// Convenience re-exports for downstream crates
pub use audio::mel::{MelConfig, MelSpectrogram, MelSpectrogramEngine};
pub use audio::{load_wav, AudioSamples};
pub use compositor::{CompositorConfig, FrameCompositor};
pub use engine::encode::AudioFeatureEngine;
pub use engine::{AudioSource, RenderConfig, RenderEngine, RenderJob, RenderSummary};
pub use error::{LipframeError, Result};
pub use events::{EngineStatus, RenderEvent};
pub use features::{AudioMode, EmbeddingSequence, FeatureWindowExtractor};
pub use inference::{DynBackend, InferenceBackend, SessionPool, ShapeContract};
pub use template::{CropRectCache, CropRegion, TemplateIndexSelector, TemplateSet};

#[cfg(feature = "onnx")]
pub use inference::OnnxBackend;
