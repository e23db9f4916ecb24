//! Per-frame render path.
//!
//! ## Stages (per output frame `i`)
//!
//! ```text
//! 1. template index   = selector.index_at(i)
//! 2. load template    full_body_img/<t>.jpg (+ parsing/<t>.png)
//! 3. crop region      cache[t] or landmarks
//! 4. audio context    embeddings [i-8, i+8) → pooled tensor
//! 5. pack             FrameCompositor::prepare
//! 6. generate         generator lease, shape-checked
//! 7. composite        paste back into the template frame
//! 8. write            <staging>/frame_<i:05>.jpg
//! ```
//!
//! Every failure is tagged with the frame index and the stage it came from.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::trace;

use crate::compositor::FrameCompositor;
use crate::error::{FrameStage, LipframeError, Result};
use crate::features::{AudioMode, EmbeddingSequence};
use crate::inference::{InferenceBackend, SessionPool, ShapeContract, TensorView};
use crate::pool::TensorPool;
use crate::template::{CropRectCache, CropRegion, TemplateIndexSelector, TemplateSet};

pub struct PipelineDiagnostics {
    pub frames_rendered: AtomicUsize,
    pub encoder_calls: AtomicUsize,
    pub generator_calls: AtomicUsize,
    pub batches_completed: AtomicUsize,
    pub frame_errors: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            frames_rendered: AtomicUsize::new(0),
            encoder_calls: AtomicUsize::new(0),
            generator_calls: AtomicUsize::new(0),
            batches_completed: AtomicUsize::new(0),
            frame_errors: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_rendered.store(0, Ordering::Relaxed);
        self.encoder_calls.store(0, Ordering::Relaxed);
        self.generator_calls.store(0, Ordering::Relaxed);
        self.batches_completed.store(0, Ordering::Relaxed);
        self.frame_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            encoder_calls: self.encoder_calls.load(Ordering::Relaxed),
            generator_calls: self.generator_calls.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub frames_rendered: usize,
    pub encoder_calls: usize,
    pub generator_calls: usize,
    pub batches_completed: usize,
    pub frame_errors: usize,
}

/// Output file name for frame `index`.
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:05}.jpg")
}

/// Everything a worker needs to render one frame, borrowed for one run.
pub struct FrameRenderer<'a, G> {
    pub templates: &'a TemplateSet,
    pub crop_rects: Option<&'a CropRectCache>,
    pub selector: &'a TemplateIndexSelector,
    pub features: &'a EmbeddingSequence,
    pub mode: AudioMode,
    pub compositor: &'a FrameCompositor,
    pub generators: &'a SessionPool<G>,
    pub contract: &'a ShapeContract,
    pub audio_tensors: &'a TensorPool,
    pub out_dir: &'a Path,
    pub jpeg_quality: u8,
    pub use_parsing: bool,
    pub diagnostics: &'a PipelineDiagnostics,
}

impl<G: InferenceBackend> FrameRenderer<'_, G> {
    /// Render output frame `index` into `out_dir`.
    pub fn render(&self, index: usize) -> Result<PathBuf> {
        let result = self.render_inner(index);
        if result.is_err() {
            self.diagnostics.frame_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn render_inner(&self, index: usize) -> Result<PathBuf> {
        let template_idx = self.selector.index_at(index);
        let template = self.templates.frame(template_idx).ok_or_else(|| {
            LipframeError::InvalidConfig(format!(
                "template index {template_idx} outside clip of {} frames",
                self.templates.len()
            ))
            .at_frame(index, FrameStage::LoadTemplate)
        })?;

        let mut frame = load_rgb(&template.image_path)
            .map_err(|e| e.at_frame(index, FrameStage::LoadTemplate))?;
        let parsing = match (&template.parsing_path, self.use_parsing) {
            (Some(path), true) => {
                Some(load_rgb(path).map_err(|e| e.at_frame(index, FrameStage::LoadTemplate))?)
            }
            _ => None,
        };

        let region = match self.crop_rects {
            Some(cache) => cache.get(template_idx),
            None => CropRegion::from_landmarks(&template.landmarks),
        }
        .map_err(|e| e.at_frame(index, FrameStage::Crop))?;

        let mut audio = self.audio_tensors.checkout();
        self.features
            .context_into(index, &mut audio)
            .map_err(|e| e.at_frame(index, FrameStage::AudioContext))?;
        let audio_shape = self.mode.audio_tensor_shape();

        let prepared = self
            .compositor
            .prepare(&frame, region)
            .map_err(|e| e.at_frame(index, FrameStage::Crop))?;
        let image_shape = prepared.shape();

        let mut outputs = {
            let mut lease = self
                .generators
                .acquire()
                .map_err(|e| e.at_frame(index, FrameStage::Generate))?;
            self.contract
                .infer(
                    &mut *lease,
                    &[
                        TensorView::new(&image_shape, prepared.data()),
                        TensorView::new(&audio_shape, &audio),
                    ],
                )
                .map_err(|e| e.at_frame(index, FrameStage::Generate))?
        };
        self.diagnostics.generator_calls.fetch_add(1, Ordering::Relaxed);
        drop(audio);
        let generated = outputs.swap_remove(0);

        self.compositor
            .composite(&mut frame, &prepared, generated.view(), parsing.as_ref())
            .map_err(|e| e.at_frame(index, FrameStage::Composite))?;
        drop(prepared);

        let path = self.out_dir.join(frame_file_name(index));
        write_jpeg(&path, &frame, self.jpeg_quality)
            .map_err(|e| e.at_frame(index, FrameStage::Write))?;
        self.diagnostics.frames_rendered.fetch_add(1, Ordering::Relaxed);
        trace!(frame = index, template = template_idx, "frame written");
        Ok(path)
    }
}

fn load_rgb(path: &Path) -> Result<RgbImage> {
    if !path.exists() {
        return Err(LipframeError::AssetNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(image::open(path)?.to_rgb8())
}

/// Encode `frame` as baseline JPEG at `quality` (1–100).
pub fn write_jpeg(path: &Path, frame: &RgbImage, quality: u8) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(frame)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::CompositorConfig;
    use crate::inference::stub::StubGenerator;
    use crate::inference::{Tensor, GENERATOR_INPUT};
    use crate::pool::tensor_pool;
    use crate::template::test_support::landmark_text;
    use image::Rgb;
    use std::fs;

    fn write_template(root: &Path, frames: usize) {
        fs::create_dir_all(root.join("full_body_img")).unwrap();
        fs::create_dir_all(root.join("landmarks")).unwrap();
        for i in 0..frames {
            let img = RgbImage::from_pixel(96, 96, Rgb([40 * i as u8, 90, 160]));
            img.save(root.join("full_body_img").join(format!("{i}.jpg")))
                .unwrap();
            fs::write(
                root.join("landmarks").join(format!("{i}.lms")),
                landmark_text(16, 20, 64),
            )
            .unwrap();
        }
    }

    struct Fixture {
        templates: TemplateSet,
        selector: TemplateIndexSelector,
        features: EmbeddingSequence,
        compositor: FrameCompositor,
        generators: SessionPool<StubGenerator>,
        contract: ShapeContract,
        audio_tensors: TensorPool,
        diagnostics: PipelineDiagnostics,
    }

    impl Fixture {
        fn new(root: &Path, frames: usize) -> Self {
            write_template(root, frames);
            let templates = TemplateSet::load(root).unwrap();
            let selector = TemplateIndexSelector::new(templates.len()).unwrap();
            let mode = AudioMode::Ave;
            Self {
                templates,
                selector,
                features: EmbeddingSequence::from_flat(512, vec![0.1; 512 * 6]).unwrap(),
                compositor: FrameCompositor::new(CompositorConfig::default()).unwrap(),
                generators: SessionPool::new(1, |_| Ok(StubGenerator::new())).unwrap(),
                contract: ShapeContract::generator(mode),
                audio_tensors: tensor_pool(mode.context_values()),
                diagnostics: PipelineDiagnostics::default(),
            }
        }

        fn renderer<'a>(
            &'a self,
            out_dir: &'a Path,
            crop_rects: Option<&'a CropRectCache>,
        ) -> FrameRenderer<'a, StubGenerator> {
            FrameRenderer {
                templates: &self.templates,
                crop_rects,
                selector: &self.selector,
                features: &self.features,
                mode: AudioMode::Ave,
                compositor: &self.compositor,
                generators: &self.generators,
                contract: &self.contract,
                audio_tensors: &self.audio_tensors,
                out_dir,
                jpeg_quality: 95,
                use_parsing: true,
                diagnostics: &self.diagnostics,
            }
        }
    }

    #[test]
    fn renders_a_frame_with_template_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let fx = Fixture::new(&dir.path().join("tpl"), 3);

        let path = fx.renderer(&out, None).render(4).unwrap();
        assert_eq!(path.file_name().unwrap(), "frame_00004.jpg");
        let written = image::open(&path).unwrap();
        assert_eq!((written.width(), written.height()), (96, 96));

        let snap = fx.diagnostics.snapshot();
        assert_eq!(snap.frames_rendered, 1);
        assert_eq!(snap.generator_calls, 1);
        assert_eq!(fx.generators.in_use(), 0);
    }

    #[test]
    fn missing_crop_rect_is_tagged_with_frame_and_stage() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let fx = Fixture::new(&dir.path().join("tpl"), 3);
        let mut cache = CropRectCache::default();
        cache.insert(0, CropRegion::from_rect([16, 20, 80, 84]));

        let renderer = fx.renderer(&out, Some(&cache));
        assert!(renderer.render(0).is_ok());
        // Step 1 maps to template 1, which has no cached rectangle.
        let err = renderer.render(1).unwrap_err();
        match err {
            LipframeError::Frame {
                index,
                stage,
                source,
            } => {
                assert_eq!(index, 1);
                assert_eq!(stage, FrameStage::Crop);
                assert!(matches!(*source, LipframeError::CropRectMissing(1)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.diagnostics.snapshot().frame_errors, 1);
        assert!(!out.join(frame_file_name(1)).exists());
    }

    #[test]
    fn jpeg_writer_round_trips_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(frame_file_name(0));
        let img = RgbImage::from_pixel(33, 17, Rgb([1, 2, 3]));
        write_jpeg(&path, &img, 95).unwrap();
        let back = image::open(&path).unwrap();
        assert_eq!((back.width(), back.height()), (33, 17));
        assert_eq!(frame_file_name(12345), "frame_12345.jpg");
    }

    #[test]
    fn generator_shape_contract_guards_the_paste() {
        // A backend answering with the wrong size never reaches the compositor.
        struct Tiny;
        impl InferenceBackend for Tiny {
            fn warm_up(&mut self) -> Result<()> {
                Ok(())
            }
            fn infer(&mut self, _inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
                Ok(vec![Tensor::zeros(&[1, 3, GENERATOR_INPUT / 2, GENERATOR_INPUT / 2])])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let fx = Fixture::new(&dir.path().join("tpl"), 2);
        let tiny = SessionPool::new(1, |_| Ok(Tiny)).unwrap();
        let renderer = FrameRenderer {
            generators: &tiny,
            templates: &fx.templates,
            crop_rects: None,
            selector: &fx.selector,
            features: &fx.features,
            mode: AudioMode::Ave,
            compositor: &fx.compositor,
            contract: &fx.contract,
            audio_tensors: &fx.audio_tensors,
            out_dir: &out,
            jpeg_quality: 90,
            use_parsing: false,
            diagnostics: &fx.diagnostics,
        };
        let err = renderer.render(0).unwrap_err();
        assert!(matches!(
            err,
            LipframeError::Frame {
                stage: FrameStage::Generate,
                ..
            }
        ));
    }
}
