//! `lipframe`: command line host for lipframe-core.
//!
//! ```text
//! lipframe features   --audio a.wav --out aud_ave          # audio → embeddings
//! lipframe render     --template clip/ --audio a.wav --out frames/
//! lipframe crop-cache --template clip/ --out clip/crop_rects.json
//! lipframe mel        --audio a.wav --out mel              # debug dump
//! ```
//!
//! Logging goes through `tracing`; set `RUST_LOG` to change the filter.

mod commands;
mod settings;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use lipframe_core::AudioMode;
use tracing::info;

use commands::{FeaturesArgs, RenderArgs};
use settings::{load_render_config, RenderOverrides};

#[derive(Debug, Parser)]
#[command(name = "lipframe")]
#[command(about = "Audio-driven talking-head frame renderer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute padded audio embeddings and write them in the exchange format.
    Features {
        /// Input WAV file.
        #[arg(long)]
        audio: PathBuf,
        /// Audio encoder ONNX model (default: $LIPFRAME_MODEL_DIR/audio_encoder.onnx).
        #[arg(long)]
        encoder: Option<PathBuf>,
        /// Output stem; `.bin` and `.json` are written next to each other.
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 25)]
        fps: u32,
        /// Encoder sessions / threads (default: CPU cores).
        #[arg(long)]
        workers: Option<usize>,
        /// Use the deterministic stub encoder instead of a model.
        #[arg(long, default_value_t = false)]
        stub: bool,
    },
    /// Render one JPEG per output frame.
    Render(RenderCli),
    /// Precompute crop rectangles from template landmarks.
    CropCache {
        #[arg(long)]
        template: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Dump the normalised mel spectrogram of a WAV file.
    Mel {
        #[arg(long)]
        audio: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RenderCli {
    /// Template directory (full_body_img/, landmarks/, optional parsing/).
    #[arg(long)]
    template: PathBuf,
    /// Input WAV file (`ave` mode only).
    #[arg(long, conflicts_with = "features")]
    audio: Option<PathBuf>,
    /// Precomputed embeddings (`.bin` with `.json` sidecar).
    #[arg(long)]
    features: Option<PathBuf>,
    /// Audio encoder ONNX model.
    #[arg(long)]
    encoder: Option<PathBuf>,
    /// Generator ONNX model.
    #[arg(long)]
    generator: Option<PathBuf>,
    /// Output directory for frame_%05d.jpg.
    #[arg(long)]
    out: PathBuf,
    /// JSON render config; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    mode: Option<AudioMode>,
    #[arg(long)]
    fps: Option<u32>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    sessions: Option<usize>,
    #[arg(long)]
    jpeg_quality: Option<u8>,
    #[arg(long)]
    start_frame: Option<usize>,
    #[arg(long)]
    max_frames: Option<usize>,
    /// Crop rectangle cache written by `crop-cache`.
    #[arg(long)]
    crop_cache: Option<PathBuf>,
    /// Keep hair/background pixels using parsing/<n>.png.
    #[arg(long, default_value_t = false)]
    parsing: bool,
    /// Replace a non-empty output directory.
    #[arg(long, default_value_t = false)]
    overwrite: bool,
    /// Use deterministic stub models (no model files needed).
    #[arg(long, default_value_t = false)]
    stub: bool,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lipframe=info")),
        )
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "lipframe starting");

    match cli.command {
        Command::Features {
            audio,
            encoder,
            out,
            fps,
            workers,
            stub,
        } => commands::features(FeaturesArgs {
            audio,
            encoder,
            out,
            fps,
            workers: workers.unwrap_or_else(default_workers).max(1),
            stub,
        }),
        Command::Render(args) => {
            let overrides = RenderOverrides {
                mode: args.mode,
                fps: args.fps,
                batch_size: args.batch_size,
                workers: args.workers,
                sessions: args.sessions,
                jpeg_quality: args.jpeg_quality,
                start_frame: args.start_frame,
                max_frames: args.max_frames,
                use_parsing: args.parsing,
                overwrite: args.overwrite,
            };
            let config = load_render_config(args.config.as_deref(), &overrides)?;
            commands::render(
                RenderArgs {
                    template: args.template,
                    audio: args.audio,
                    features: args.features,
                    encoder: args.encoder,
                    generator: args.generator,
                    out: args.out,
                    crop_cache: args.crop_cache,
                    stub: args.stub,
                },
                config,
            )
        }
        Command::CropCache { template, out } => commands::crop_cache(&template, &out),
        Command::Mel { audio, out } => commands::mel(&audio, &out),
    }
}
