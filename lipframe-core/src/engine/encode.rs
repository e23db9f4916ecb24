//! Audio → padded embedding sequence.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use crate::audio::mel::{MelConfig, MelSpectrogram, MelSpectrogramEngine};
use crate::audio::AudioSamples;
use crate::engine::batch::BatchScheduler;
use crate::engine::pipeline::PipelineDiagnostics;
use crate::error::Result;
use crate::features::{EmbeddingSequence, FeatureWindowExtractor, MelWindow};
use crate::inference::{InferenceBackend, SessionPool, ShapeContract, TensorView};

/// Mel engine plus a pool of audio-encoder sessions.
pub struct AudioFeatureEngine<E> {
    mel: MelSpectrogramEngine,
    encoders: SessionPool<E>,
    contract: ShapeContract,
    scheduler: BatchScheduler,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl<E: InferenceBackend> AudioFeatureEngine<E> {
    /// `workers` threads share the encoder pool; one worker encodes in order
    /// on the calling thread.
    pub fn new(mel: MelConfig, encoders: SessionPool<E>, workers: usize) -> Result<Self> {
        let contract = ShapeContract::audio_encoder(mel.n_mels);
        let mel = MelSpectrogramEngine::new(mel)?;
        Ok(Self {
            mel,
            encoders,
            contract,
            scheduler: BatchScheduler::new(1, workers)?,
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        })
    }

    /// Count encoder calls into shared diagnostics.
    pub fn with_diagnostics(mut self, diagnostics: Arc<PipelineDiagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn mel_config(&self) -> &MelConfig {
        self.mel.config()
    }

    pub fn spectrogram(&self, audio: &AudioSamples) -> Result<MelSpectrogram> {
        self.mel.process(audio)
    }

    /// Mel → windows → encoder → padded sequence of `N + 2` embeddings.
    pub fn extract(&self, audio: &AudioSamples, fps: u32) -> Result<EmbeddingSequence> {
        let mel = self.mel.process(audio)?;
        let extractor = FeatureWindowExtractor::new(self.mel.config(), fps)?;
        let windows = extractor.frame_count(&mel)?;

        let sequence = if self.scheduler.workers() == 1 {
            extractor.build_embedding_sequence(&mel, |window| self.encode(window))?
        } else {
            let embeddings = self.scheduler.map_indexed(windows, |i| {
                let window = extractor.crop_window(&mel, i)?;
                self.encode(&window)
            })?;
            EmbeddingSequence::pad(embeddings)?
        };

        info!(
            seconds = audio.duration_secs(),
            mel_frames = mel.n_frames(),
            windows,
            frames = sequence.len(),
            "audio features extracted"
        );
        Ok(sequence)
    }

    fn encode(&self, window: &MelWindow) -> Result<Vec<f32>> {
        let shape = window.encoder_shape();
        let data = window.to_encoder_layout();
        let mut outputs = {
            let mut lease = self.encoders.acquire()?;
            self.contract
                .infer(&mut *lease, &[TensorView::new(&shape, &data)])?
        };
        self.diagnostics.encoder_calls.fetch_add(1, Ordering::Relaxed);
        Ok(outputs.swap_remove(0).data)
    }

    /// Destroy the encoder sessions.
    pub fn close(self) -> usize {
        self.encoders.close()
    }
}
