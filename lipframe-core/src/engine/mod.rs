//! `RenderEngine`: top-level orchestration of one render job.
//!
//! ## Lifecycle
//!
//! ```text
//! RenderEngine::new(config, encoder engine, generator pool)
//!     └─► render(job)
//!           ├─ Extracting   templates, crop cache, audio → embeddings
//!           ├─ Rendering    batches of frames → <out>.partial/frame_*.jpg
//!           └─ Finished     <out>.partial renamed onto <out>
//!                (Failed    staging directory removed, first error returned)
//!     └─► close()            every session destroyed
//! ```
//!
//! ## Threading
//!
//! `render` blocks the caller. Frames of one batch run on
//! `RenderConfig::workers` scoped threads that share the template set, the
//! embeddings and the compositor by reference; each worker holds a generator
//! session only for the duration of one inference call.

pub mod batch;
pub mod encode;
pub mod pipeline;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::load_wav;
use crate::audio::mel::MelConfig;
use crate::compositor::{CompositorConfig, FrameCompositor};
use crate::error::{LipframeError, Result};
use crate::events::{EngineStatus, RenderEvent};
use crate::features::exchange::read_features;
use crate::features::{AudioMode, EmbeddingSequence};
use crate::inference::{InferenceBackend, SessionPool, ShapeContract};
use crate::pool::tensor_pool;
use crate::template::{CropRectCache, TemplateIndexSelector, TemplateSet};

use batch::BatchScheduler;
use encode::AudioFeatureEngine;
use pipeline::{DiagnosticsSnapshot, FrameRenderer, PipelineDiagnostics};

/// Configuration for `RenderEngine`, loadable from a camelCase JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderConfig {
    /// Audio feature flavour of the generator. Default: `ave`.
    pub mode: AudioMode,
    /// Output frame rate. `None` uses the mode's rate (25, or 20 for `wenet`).
    pub fps: Option<u32>,
    /// Frames per batch. Batches run one after another. Default: 32.
    pub batch_size: usize,
    /// Worker threads per batch. `0` = available CPU cores.
    pub workers: usize,
    /// Inference sessions per model. `0` = one per worker.
    pub sessions: usize,
    /// JPEG quality, 1–100. Default: 95.
    pub jpeg_quality: u8,
    /// First template frame of the ping-pong range. Default: 0.
    pub start_frame: usize,
    /// Render at most this many frames.
    pub max_frames: Option<usize>,
    /// Keep hair/background pixels using `parsing/<n>.png` when present.
    pub use_parsing: bool,
    /// Replace a non-empty output directory instead of failing.
    pub overwrite: bool,
    pub compositor: CompositorConfig,
    pub mel: MelConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: AudioMode::Ave,
            fps: None,
            batch_size: 32,
            workers: 0,
            sessions: 0,
            jpeg_quality: 95,
            start_frame: 0,
            max_frames: None,
            use_parsing: false,
            overwrite: false,
            compositor: CompositorConfig::default(),
            mel: MelConfig::default(),
        }
    }
}

impl RenderConfig {
    /// Read a JSON config file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LipframeError::AssetNotFound {
                path: path.to_path_buf(),
            });
        }
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LipframeError::InvalidConfig("batchSize must be non-zero".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(LipframeError::InvalidConfig(format!(
                "jpegQuality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.fps == Some(0) {
            return Err(LipframeError::InvalidConfig("fps must be non-zero".into()));
        }
        if self.max_frames == Some(0) {
            return Err(LipframeError::InvalidConfig("maxFrames must be non-zero".into()));
        }
        self.mel.validate()?;
        self.compositor.validate()
    }

    pub fn resolved_fps(&self) -> u32 {
        self.fps.unwrap_or_else(|| self.mode.default_fps())
    }

    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn resolved_sessions(&self) -> usize {
        if self.sessions > 0 {
            self.sessions
        } else {
            self.resolved_workers()
        }
    }
}

/// Where the per-frame audio embeddings come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Decode, run the mel engine and the audio encoder (`ave` only).
    Wav(PathBuf),
    /// Precomputed embeddings in the `.bin` + `.json` exchange format.
    Features(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub template_dir: PathBuf,
    pub audio: AudioSource,
    pub output_dir: PathBuf,
    pub crop_cache: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RenderSummary {
    pub frames: usize,
    pub batches: usize,
    pub template_frames: usize,
    pub output_dir: PathBuf,
    pub elapsed: Duration,
    /// Image tensors allocated by the compositor pool (misses).
    pub tensor_allocations: usize,
    pub diagnostics: DiagnosticsSnapshot,
}

/// The top-level render handle.
///
/// `RenderEngine` is `Sync`; status and diagnostics can be read from another
/// thread while `render` runs.
pub struct RenderEngine<E, G> {
    config: RenderConfig,
    features: Option<AudioFeatureEngine<E>>,
    generators: SessionPool<G>,
    compositor: FrameCompositor,
    scheduler: BatchScheduler,
    diagnostics: Arc<PipelineDiagnostics>,
    status: Mutex<EngineStatus>,
    events: Option<Sender<RenderEvent>>,
}

impl<E: InferenceBackend, G: InferenceBackend> RenderEngine<E, G> {
    /// `features` may be `None` when every job brings precomputed features.
    pub fn new(
        config: RenderConfig,
        features: Option<AudioFeatureEngine<E>>,
        generators: SessionPool<G>,
    ) -> Result<Self> {
        config.validate()?;
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let features = features.map(|f| f.with_diagnostics(Arc::clone(&diagnostics)));
        let scheduler = BatchScheduler::new(config.batch_size, config.resolved_workers())?;
        let compositor = FrameCompositor::new(config.compositor.clone())?;
        info!(
            mode = %config.mode,
            fps = config.resolved_fps(),
            batch_size = scheduler.batch_size(),
            workers = scheduler.workers(),
            generator_sessions = generators.size(),
            "render engine ready"
        );
        Ok(Self {
            config,
            features,
            generators,
            compositor,
            scheduler,
            diagnostics,
            status: Mutex::new(EngineStatus::Idle),
            events: None,
        })
    }

    /// Deliver progress events on `tx`. A full or closed channel drops events.
    pub fn with_events(mut self, tx: Sender<RenderEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Render every frame of `job`.
    ///
    /// Frames land in `<output_dir>.partial` first; the directory is renamed
    /// onto `output_dir` only when all frames were written. On failure the
    /// staging directory is removed and the first error is returned.
    pub fn render(&self, job: &RenderJob) -> Result<RenderSummary> {
        let started = Instant::now();
        self.diagnostics.reset();
        match self.run(job, started) {
            Ok(summary) => {
                self.set_status(EngineStatus::Finished);
                self.emit(RenderEvent::Finished {
                    frames: summary.frames,
                    elapsed_ms: summary.elapsed.as_millis() as u64,
                });
                info!(
                    frames = summary.frames,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    out = %summary.output_dir.display(),
                    "render finished"
                );
                Ok(summary)
            }
            Err(e) => {
                self.set_status(EngineStatus::Failed);
                self.emit(RenderEvent::Failed {
                    frame: e.frame_index(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Destroy every inference session. Returns how many were destroyed.
    pub fn close(self) -> usize {
        let encoders = self.features.map(AudioFeatureEngine::close).unwrap_or(0);
        let generators = self.generators.close();
        debug!(encoders, generators, "render engine closed");
        encoders + generators
    }

    fn run(&self, job: &RenderJob, started: Instant) -> Result<RenderSummary> {
        self.set_status(EngineStatus::Extracting);
        let mode = self.config.mode;
        let fps = self.config.resolved_fps();

        let templates = TemplateSet::load(&job.template_dir)?;
        let start = self.config.start_frame;
        if start >= templates.len() {
            return Err(LipframeError::InvalidConfig(format!(
                "startFrame {start} outside template clip of {} frames",
                templates.len()
            )));
        }
        let selector = TemplateIndexSelector::with_offset(templates.len() - start, start)?;
        let crop_rects = job
            .crop_cache
            .as_deref()
            .map(CropRectCache::load)
            .transpose()?;

        let features = self.load_features(&job.audio, fps)?;
        let total = self
            .config
            .max_frames
            .map_or(features.len(), |max| features.len().min(max));
        if total == 0 {
            return Err(LipframeError::InsufficientAudio(
                "no frames to render".into(),
            ));
        }

        let staging = staging_dir(&job.output_dir)?;
        prepare_output(&job.output_dir, &staging, self.config.overwrite)?;

        let batches = self.scheduler.plan(total).len();
        self.set_status(EngineStatus::Rendering);
        self.emit(RenderEvent::Started {
            total_frames: total,
            total_batches: batches,
            mode,
            fps,
        });
        info!(
            frames = total,
            batches,
            templates = templates.len(),
            start_frame = start,
            staging = %staging.display(),
            "rendering"
        );

        let contract = ShapeContract::generator(mode);
        let audio_tensors = tensor_pool(mode.context_values());
        let renderer = FrameRenderer {
            templates: &templates,
            crop_rects: crop_rects.as_ref(),
            selector: &selector,
            features: &features,
            mode,
            compositor: &self.compositor,
            generators: &self.generators,
            contract: &contract,
            audio_tensors: &audio_tensors,
            out_dir: &staging,
            jpeg_quality: self.config.jpeg_quality,
            use_parsing: self.config.use_parsing,
            diagnostics: &self.diagnostics,
        };

        let outcome = self.scheduler.run(
            total,
            |i| renderer.render(i).map(|_| ()),
            |batch| {
                self.diagnostics
                    .batches_completed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(batch = batch.index, frames_done = batch.end, "batch completed");
                self.emit(RenderEvent::BatchCompleted {
                    batch: batch.index,
                    frames_done: batch.end,
                    total_frames: total,
                });
            },
        );
        if let Err(e) = outcome {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(staging = %staging.display(), "staging cleanup failed: {cleanup}");
            }
            return Err(e);
        }

        if job.output_dir.exists() {
            fs::remove_dir_all(&job.output_dir)?;
        }
        fs::rename(&staging, &job.output_dir)?;

        Ok(RenderSummary {
            frames: total,
            batches,
            template_frames: templates.len(),
            output_dir: job.output_dir.clone(),
            elapsed: started.elapsed(),
            tensor_allocations: self.compositor.tensor_allocations(),
            diagnostics: self.diagnostics.snapshot(),
        })
    }

    fn load_features(&self, audio: &AudioSource, fps: u32) -> Result<EmbeddingSequence> {
        let mode = self.config.mode;
        let sequence = match audio {
            AudioSource::Wav(path) => {
                if mode != AudioMode::Ave {
                    return Err(LipframeError::InvalidConfig(format!(
                        "{mode} embeddings are not produced in-process; pass a features file"
                    )));
                }
                let engine = self.features.as_ref().ok_or_else(|| {
                    LipframeError::InvalidConfig("no audio encoder configured".into())
                })?;
                let samples = load_wav(path)?.into_rate(engine.mel_config().sample_rate)?;
                engine.extract(&samples, fps)?
            }
            AudioSource::Features(path) => read_features(path, mode.embedding_dim())?,
        };
        if sequence.dim() != mode.embedding_dim() {
            return Err(LipframeError::ShapeMismatch {
                tensor: format!("{mode} embedding"),
                expected: vec![mode.embedding_dim()],
                actual: vec![sequence.dim()],
            });
        }
        Ok(sequence)
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.lock() = status;
    }

    fn emit(&self, event: RenderEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }
}

/// `<out>.partial`, next to `out`.
pub fn staging_dir(output_dir: &Path) -> Result<PathBuf> {
    let name = output_dir.file_name().ok_or_else(|| {
        LipframeError::InvalidConfig(format!(
            "output directory {} has no final component",
            output_dir.display()
        ))
    })?;
    let mut staged = name.to_os_string();
    staged.push(".partial");
    Ok(output_dir.with_file_name(staged))
}

fn prepare_output(output_dir: &Path, staging: &Path, overwrite: bool) -> Result<()> {
    if output_dir.exists() && !overwrite {
        let occupied = fs::read_dir(output_dir)?.next().is_some();
        if occupied {
            return Err(LipframeError::InvalidConfig(format!(
                "output directory {} is not empty; enable overwrite to replace it",
                output_dir.display()
            )));
        }
    }
    if staging.exists() {
        warn!(staging = %staging.display(), "removing stale staging directory");
        fs::remove_dir_all(staging)?;
    }
    fs::create_dir_all(staging)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_and_documented_values_hold() {
        let cfg = RenderConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.jpeg_quality, 95);
        assert_eq!(cfg.resolved_fps(), 25);
        assert!(cfg.resolved_workers() >= 1);
        assert_eq!(cfg.resolved_sessions(), cfg.resolved_workers());
    }

    #[test]
    fn config_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.json");
        fs::write(
            &path,
            r#"{"mode":"wenet","batchSize":8,"maxFrames":10,"compositor":{"channelOrder":"rgb"}}"#,
        )
        .unwrap();
        let cfg = RenderConfig::load(&path).unwrap();
        assert_eq!(cfg.mode, AudioMode::Wenet);
        assert_eq!(cfg.resolved_fps(), 20);
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.max_frames, Some(10));
        assert_eq!(cfg.jpeg_quality, 95);
        assert_eq!(cfg.mel, MelConfig::default());
    }

    #[test]
    fn invalid_config_values_are_rejected() {
        for cfg in [
            RenderConfig {
                batch_size: 0,
                ..RenderConfig::default()
            },
            RenderConfig {
                jpeg_quality: 0,
                ..RenderConfig::default()
            },
            RenderConfig {
                fps: Some(0),
                ..RenderConfig::default()
            },
        ] {
            assert!(matches!(cfg.validate(), Err(LipframeError::InvalidConfig(_))));
        }
        assert!(matches!(
            RenderConfig::load(Path::new("/nonexistent/render.json")),
            Err(LipframeError::AssetNotFound { .. })
        ));
    }

    #[test]
    fn staging_dir_sits_next_to_output() {
        assert_eq!(
            staging_dir(Path::new("/tmp/run/frames")).unwrap(),
            PathBuf::from("/tmp/run/frames.partial")
        );
        assert!(staging_dir(Path::new("/")).is_err());
    }

    #[test]
    fn non_empty_output_requires_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("old.jpg"), b"x").unwrap();
        let staging = staging_dir(&out).unwrap();

        assert!(prepare_output(&out, &staging, false).is_err());
        prepare_output(&out, &staging, true).unwrap();
        assert!(staging.is_dir());
    }
}
