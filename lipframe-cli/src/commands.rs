//! Subcommand implementations.

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use lipframe_core::features::exchange::{write_features, write_matrix};
use lipframe_core::inference::stub::{StubEncoder, StubGenerator};
use lipframe_core::{
    load_wav, AudioFeatureEngine, AudioSource, CropRectCache, DynBackend, MelConfig,
    MelSpectrogramEngine, RenderConfig, RenderEngine, RenderEvent, RenderJob, SessionPool,
    TemplateSet,
};
use tracing::{info, warn};

use crate::settings::{bin_path, model_path};

/// Which network a session pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    AudioEncoder,
    Generator,
}

impl ModelKind {
    fn default_file(self) -> &'static str {
        match self {
            ModelKind::AudioEncoder => "audio_encoder.onnx",
            ModelKind::Generator => "generator.onnx",
        }
    }

    fn stub(self) -> DynBackend {
        match self {
            ModelKind::AudioEncoder => Box::new(StubEncoder::new()),
            ModelKind::Generator => Box::new(StubGenerator::new()),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelKind::AudioEncoder => "audio encoder",
            ModelKind::Generator => "generator",
        })
    }
}

/// `size` warmed-up sessions of `kind`, from `model` or the stub.
pub fn session_pool(
    kind: ModelKind,
    model: Option<&Path>,
    stub: bool,
    size: usize,
) -> Result<SessionPool<DynBackend>> {
    if stub {
        return SessionPool::new(size, |_| Ok(kind.stub()))
            .with_context(|| format!("start stub {kind} pool"));
    }
    let path = model_path(model, kind.default_file());
    onnx_pool(kind, &path, size)
}

#[cfg(feature = "onnx")]
fn onnx_pool(kind: ModelKind, path: &Path, size: usize) -> Result<SessionPool<DynBackend>> {
    use lipframe_core::OnnxBackend;

    SessionPool::new(size, |_| {
        Ok(Box::new(OnnxBackend::new(path.to_path_buf())?) as DynBackend)
    })
    .with_context(|| format!("load {kind} model {}", path.display()))
}

#[cfg(not(feature = "onnx"))]
fn onnx_pool(kind: ModelKind, path: &Path, _size: usize) -> Result<SessionPool<DynBackend>> {
    anyhow::bail!(
        "cannot load {kind} model {}: built without the `onnx` feature (use --stub)",
        path.display()
    )
}

pub struct FeaturesArgs {
    pub audio: PathBuf,
    pub encoder: Option<PathBuf>,
    pub out: PathBuf,
    pub fps: u32,
    pub workers: usize,
    pub stub: bool,
}

pub fn features(args: FeaturesArgs) -> Result<()> {
    let encoders = session_pool(
        ModelKind::AudioEncoder,
        args.encoder.as_deref(),
        args.stub,
        args.workers,
    )?;
    let engine = AudioFeatureEngine::new(MelConfig::default(), encoders, args.workers)?;
    let samples = load_wav(&args.audio)
        .with_context(|| format!("load audio {}", args.audio.display()))?;
    let sequence = engine.extract(&samples, args.fps).context("extract features")?;

    let bin = bin_path(&args.out);
    write_features(&bin, &sequence).with_context(|| format!("write {}", bin.display()))?;
    info!(
        frames = sequence.len(),
        dim = sequence.dim(),
        out = %bin.display(),
        "features written"
    );
    engine.close();
    Ok(())
}

pub struct RenderArgs {
    pub template: PathBuf,
    pub audio: Option<PathBuf>,
    pub features: Option<PathBuf>,
    pub encoder: Option<PathBuf>,
    pub generator: Option<PathBuf>,
    pub out: PathBuf,
    pub crop_cache: Option<PathBuf>,
    pub stub: bool,
}

pub fn render(args: RenderArgs, config: RenderConfig) -> Result<()> {
    let audio = match (args.audio, args.features) {
        (Some(wav), None) => AudioSource::Wav(wav),
        (None, Some(bin)) => AudioSource::Features(bin),
        _ => anyhow::bail!("pass exactly one of --audio or --features"),
    };

    let sessions = config.resolved_sessions();
    let features = match &audio {
        AudioSource::Wav(_) => {
            let encoders = session_pool(
                ModelKind::AudioEncoder,
                args.encoder.as_deref(),
                args.stub,
                sessions,
            )?;
            Some(AudioFeatureEngine::new(
                config.mel.clone(),
                encoders,
                config.resolved_workers(),
            )?)
        }
        AudioSource::Features(_) => None,
    };
    let generators = session_pool(
        ModelKind::Generator,
        args.generator.as_deref(),
        args.stub,
        sessions,
    )?;

    let (tx, rx) = unbounded::<RenderEvent>();
    let engine = RenderEngine::new(config, features, generators)?.with_events(tx);

    let progress = thread::spawn(move || {
        for event in rx {
            match event {
                RenderEvent::BatchCompleted {
                    frames_done,
                    total_frames,
                    ..
                } => info!(
                    "rendered {frames_done}/{total_frames} frames ({:.0}%)",
                    100.0 * frames_done as f64 / total_frames.max(1) as f64
                ),
                RenderEvent::Failed { frame, message } => {
                    warn!(frame = ?frame, "render failed: {message}");
                }
                _ => {}
            }
        }
    });

    let job = RenderJob {
        template_dir: args.template,
        audio,
        output_dir: args.out,
        crop_cache: args.crop_cache,
    };
    let result = engine.render(&job);
    // Closing drops the event sender, which ends the progress thread.
    engine.close();
    if progress.join().is_err() {
        warn!("progress reporter panicked");
    }

    let summary = result.context("render failed")?;
    info!(
        frames = summary.frames,
        batches = summary.batches,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        generator_calls = summary.diagnostics.generator_calls,
        out = %summary.output_dir.display(),
        "done"
    );
    Ok(())
}

pub fn crop_cache(template: &Path, out: &Path) -> Result<()> {
    let templates = TemplateSet::load(template)
        .with_context(|| format!("load template {}", template.display()))?;
    let cache = CropRectCache::from_templates(&templates).context("derive crop regions")?;
    cache
        .save(out)
        .with_context(|| format!("write {}", out.display()))?;
    info!(frames = cache.len(), out = %out.display(), "crop cache written");
    Ok(())
}

/// Dump the normalised mel spectrogram as a `[frames][n_mels]` matrix.
pub fn mel(audio: &Path, out: &Path) -> Result<()> {
    let engine = MelSpectrogramEngine::new(MelConfig::default())?;
    let samples = load_wav(audio).with_context(|| format!("load audio {}", audio.display()))?;
    let mel = engine.process(&samples).context("compute mel spectrogram")?;
    let time_major: Vec<f32> = mel.as_array().t().iter().copied().collect();

    let bin = bin_path(out);
    write_matrix(&bin, mel.n_frames(), mel.n_mels(), &time_major)
        .with_context(|| format!("write {}", bin.display()))?;
    info!(frames = mel.n_frames(), n_mels = mel.n_mels(), out = %bin.display(), "mel written");
    Ok(())
}
