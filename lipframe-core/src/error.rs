use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Stage of the per-frame render where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    LoadTemplate,
    AudioContext,
    Crop,
    Generate,
    Composite,
    Write,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStage::LoadTemplate => "template load",
            FrameStage::AudioContext => "audio context",
            FrameStage::Crop => "crop",
            FrameStage::Generate => "generation",
            FrameStage::Composite => "composite",
            FrameStage::Write => "write",
        };
        f.write_str(name)
    }
}

/// All errors produced by lipframe-core.
#[derive(Debug, Error)]
pub enum LipframeError {
    #[error("model file not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("asset not found: {path}")]
    AssetNotFound { path: PathBuf },

    #[error("invalid WAV file {path}: {reason}")]
    InvalidWav { path: PathBuf, reason: String },

    #[error("malformed landmark file {path}: {reason}")]
    MalformedLandmarks { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("audio too short for a spectrogram: {samples} samples < window of {win_length}")]
    EmptySpectrogram { samples: usize, win_length: usize },

    #[error("insufficient audio: {0}")]
    InsufficientAudio(String),

    #[error("tensor shape mismatch for {tensor}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("crop region {region:?} is empty inside a {width}x{height} image")]
    InvalidCrop {
        region: [i32; 4],
        width: u32,
        height: u32,
    },

    #[error("no cached crop rectangle for template index {0}")]
    CropRectMissing(usize),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("session pool is closed")]
    PoolClosed,

    #[error("frame {index} failed during {stage}: {source}")]
    Frame {
        index: usize,
        stage: FrameStage,
        #[source]
        source: Box<LipframeError>,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LipframeError {
    /// Attach the frame index and stage to a per-frame failure.
    pub fn at_frame(self, index: usize, stage: FrameStage) -> Self {
        match self {
            // Already tagged by an inner stage; keep the innermost context.
            tagged @ LipframeError::Frame { .. } => tagged,
            other => LipframeError::Frame {
                index,
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Frame index for per-frame failures.
    pub fn frame_index(&self) -> Option<usize> {
        match self {
            LipframeError::Frame { index, .. } => Some(*index),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LipframeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_context_names_index_and_stage() {
        let err = LipframeError::CropRectMissing(3).at_frame(41, FrameStage::Crop);
        assert_eq!(err.frame_index(), Some(41));
        let msg = err.to_string();
        assert!(msg.contains("frame 41"), "{msg}");
        assert!(msg.contains("crop"), "{msg}");
        assert!(msg.contains("template index 3"), "{msg}");
    }

    #[test]
    fn frame_context_is_not_nested_twice() {
        let err = LipframeError::Inference("boom".into())
            .at_frame(7, FrameStage::Generate)
            .at_frame(7, FrameStage::Write);
        match err {
            LipframeError::Frame { stage, .. } => assert_eq!(stage, FrameStage::Generate),
            other => panic!("unexpected {other:?}"),
        }
    }
}
