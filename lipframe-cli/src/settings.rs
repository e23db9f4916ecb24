//! Render settings: JSON config file, then command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lipframe_core::inference::models_dir;
use lipframe_core::{AudioMode, RenderConfig};

/// Flags that override the config file when given.
#[derive(Debug, Clone, Default)]
pub struct RenderOverrides {
    pub mode: Option<AudioMode>,
    pub fps: Option<u32>,
    pub batch_size: Option<usize>,
    pub workers: Option<usize>,
    pub sessions: Option<usize>,
    pub jpeg_quality: Option<u8>,
    pub start_frame: Option<usize>,
    pub max_frames: Option<usize>,
    pub use_parsing: bool,
    pub overwrite: bool,
}

impl RenderOverrides {
    pub fn apply(&self, config: &mut RenderConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.fps.is_some() {
            config.fps = self.fps;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(sessions) = self.sessions {
            config.sessions = sessions;
        }
        if let Some(quality) = self.jpeg_quality {
            config.jpeg_quality = quality;
        }
        if let Some(start) = self.start_frame {
            config.start_frame = start;
        }
        if self.max_frames.is_some() {
            config.max_frames = self.max_frames;
        }
        // Switches only ever turn these on; the file decides otherwise.
        config.use_parsing |= self.use_parsing;
        config.overwrite |= self.overwrite;
    }
}

/// Config file (or defaults) with `overrides` applied, validated.
pub fn load_render_config(path: Option<&Path>, overrides: &RenderOverrides) -> Result<RenderConfig> {
    let mut config = match path {
        Some(path) => RenderConfig::load(path)
            .with_context(|| format!("load render config {}", path.display()))?,
        None => RenderConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("invalid render settings")?;
    Ok(config)
}

/// Explicit model path, else `<LIPFRAME_MODEL_DIR>/<default_file>`.
pub fn model_path(explicit: Option<&Path>, default_file: &str) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| models_dir().join(default_file))
}

/// `stem.bin` unless `out` already names an extension.
pub fn bin_path(out: &Path) -> PathBuf {
    if out.extension().is_some() {
        out.to_path_buf()
    } else {
        out.with_extension("bin")
    }
}
