//! Face crop → generator tensor → pasted frame.
//!
//! ```text
//! template frame ──crop──► w×h ──resize──► 328×328 ──inner (4,4)──► 320×320
//!                                                                   │ pack original + masked
//!                                                                   ▼
//!                                                    (1, 6, 320, 320) in [0, 1]
//!                                                                   │ generator
//!                                                                   ▼
//! template frame ◄──paste── w×h ◄──resize── black 328×328 ◄──(4,4)── (1, 3, 320, 320)
//! ```
//!
//! The two resizes use the same cubic-class filter; the compositor never
//! falls back to nearest-neighbour.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{LipframeError, Result};
use crate::inference::{TensorView, GENERATOR_INPUT};
use crate::pool::{image_pool, tensor_pool, ImagePool, Pooled, TensorPool};
use crate::template::CropRegion;

/// Side of the canvas the crop is resized to before the inner cut.
pub const MODEL_CANVAS: u32 = 328;
/// Offset of the generator input inside the canvas.
pub const INNER_OFFSET: u32 = 4;

const PLANE: usize = GENERATOR_INPUT * GENERATOR_INPUT;
/// `(1, 6, 320, 320)`.
pub const IMAGE_TENSOR_LEN: usize = 6 * PLANE;

/// Channel order the generator was trained with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

impl ChannelOrder {
    /// RGB pixel index feeding tensor channel `c`.
    const fn source_channels(self) -> [usize; 3] {
        match self {
            ChannelOrder::Bgr => [2, 1, 0],
            ChannelOrder::Rgb => [0, 1, 2],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Interpolation {
    /// Cubic convolution, the closest match to OpenCV's `INTER_CUBIC`.
    #[default]
    CatmullRom,
    Lanczos3,
}

impl Interpolation {
    fn filter(self) -> FilterType {
        match self {
            Interpolation::CatmullRom => FilterType::CatmullRom,
            Interpolation::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Value range of the generator output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputScale {
    /// `[0, 1]`, multiplied by 255.
    #[default]
    Unit,
    /// Already `[0, 255]`.
    Byte,
}

impl OutputScale {
    fn factor(self) -> f32 {
        match self {
            OutputScale::Unit => 255.0,
            OutputScale::Byte => 1.0,
        }
    }
}

/// Mouth rectangle blacked out in the masked half, as `x, y, width, height`
/// inside the 320×320 input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for MaskRect {
    fn default() -> Self {
        Self {
            x: 5,
            y: 5,
            width: 310,
            height: 305,
        }
    }
}

impl MaskRect {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x
            && u64::from(x) < u64::from(self.x) + u64::from(self.width)
            && y >= self.y
            && u64::from(y) < u64::from(self.y) + u64::from(self.height)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompositorConfig {
    pub channel_order: ChannelOrder,
    pub interpolation: Interpolation,
    pub output_scale: OutputScale,
    pub mask: MaskRect,
}

impl CompositorConfig {
    pub fn validate(&self) -> Result<()> {
        let side = GENERATOR_INPUT as u32;
        if self.mask.width == 0
            || self.mask.height == 0
            || self.mask.x.checked_add(self.mask.width).map_or(true, |r| r > side)
            || self.mask.y.checked_add(self.mask.height).map_or(true, |b| b > side)
        {
            return Err(LipframeError::InvalidConfig(format!(
                "mask {:?} does not fit the {side}×{side} generator input",
                self.mask
            )));
        }
        Ok(())
    }
}

/// Crop region plus the packed generator image tensor for one frame.
pub struct PreparedFrame<'a> {
    /// Region after clipping to the frame; the paste target.
    pub region: CropRegion,
    tensor: Pooled<'a, Vec<f32>>,
}

impl PreparedFrame<'_> {
    pub fn shape(&self) -> [usize; 4] {
        [1, 6, GENERATOR_INPUT, GENERATOR_INPUT]
    }

    pub fn data(&self) -> &[f32] {
        &self.tensor
    }
}

/// Shared by all render workers; scratch buffers come from internal pools.
pub struct FrameCompositor {
    config: CompositorConfig,
    tensors: TensorPool,
    canvases: ImagePool,
}

impl FrameCompositor {
    pub fn new(config: CompositorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tensors: tensor_pool(IMAGE_TENSOR_LEN),
            canvases: image_pool(MODEL_CANVAS, MODEL_CANVAS),
        })
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    /// Tensor-pool misses so far; stays at the worker count in steady state.
    pub fn tensor_allocations(&self) -> usize {
        self.tensors.stats().allocations
    }

    /// Crop, resize and pack `frame` into the 6-channel generator input.
    ///
    /// # Errors
    /// `InvalidCrop` when `region` has no overlap with `frame`.
    pub fn prepare(&self, frame: &RgbImage, region: CropRegion) -> Result<PreparedFrame<'_>> {
        let region = region.clip_to(frame.width(), frame.height())?;
        let (x, y) = (region.x_min as u32, region.y_min as u32);
        let (w, h) = (region.width() as u32, region.height() as u32);

        let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
        let canvas = imageops::resize(
            &crop,
            MODEL_CANVAS,
            MODEL_CANVAS,
            self.config.interpolation.filter(),
        );

        let mut tensor = self.tensors.checkout();
        let channels = self.config.channel_order.source_channels();
        let side = GENERATOR_INPUT as u32;
        for py in 0..side {
            for px in 0..side {
                let pixel = canvas.get_pixel(px + INNER_OFFSET, py + INNER_OFFSET);
                let offset = py as usize * GENERATOR_INPUT + px as usize;
                let masked = self.config.mask.contains(px, py);
                for (c, &src) in channels.iter().enumerate() {
                    let v = f32::from(pixel[src]) / 255.0;
                    tensor[c * PLANE + offset] = v;
                    // Pool check-in zeroes the buffer, so masked pixels need no write.
                    if !masked {
                        tensor[(c + 3) * PLANE + offset] = v;
                    }
                }
            }
        }

        Ok(PreparedFrame { region, tensor })
    }

    /// Paste the generator output back over `prepared.region` of `frame`.
    ///
    /// With a `parsing` map, pixels painted pure red or pure white keep the
    /// template's original colour.
    pub fn composite(
        &self,
        frame: &mut RgbImage,
        prepared: &PreparedFrame<'_>,
        generated: TensorView<'_>,
        parsing: Option<&RgbImage>,
    ) -> Result<()> {
        let expected = [1, 3, GENERATOR_INPUT, GENERATOR_INPUT];
        if generated.shape != expected || generated.data.len() != 3 * PLANE {
            return Err(LipframeError::ShapeMismatch {
                tensor: "generator output".into(),
                expected: expected.to_vec(),
                actual: generated.shape.to_vec(),
            });
        }

        let mut canvas = self.canvases.checkout();
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([0, 0, 0]);
        }
        let channels = self.config.channel_order.source_channels();
        let scale = self.config.output_scale.factor();
        let side = GENERATOR_INPUT as u32;
        for py in 0..side {
            for px in 0..side {
                let offset = py as usize * GENERATOR_INPUT + px as usize;
                let mut rgb = [0u8; 3];
                for (c, &dst) in channels.iter().enumerate() {
                    rgb[dst] = (generated.data[c * PLANE + offset] * scale).clamp(0.0, 255.0) as u8;
                }
                canvas.put_pixel(px + INNER_OFFSET, py + INNER_OFFSET, Rgb(rgb));
            }
        }

        let region = prepared.region;
        let (w, h) = (region.width() as u32, region.height() as u32);
        let face = imageops::resize(&*canvas, w, h, self.config.interpolation.filter());

        match parsing {
            None => imageops::replace(frame, &face, i64::from(region.x_min), i64::from(region.y_min)),
            Some(parsing) => {
                let (x0, y0) = (region.x_min as u32, region.y_min as u32);
                for (fx, fy, pixel) in face.enumerate_pixels() {
                    let (tx, ty) = (x0 + fx, y0 + fy);
                    if parsing.get_pixel_checked(tx, ty).is_some_and(keeps_original) {
                        continue;
                    }
                    if let Some(target) = frame.get_pixel_mut_checked(tx, ty) {
                        *target = *pixel;
                    }
                }
            }
        }
        Ok(())
    }
}

fn keeps_original(label: &Rgb<u8>) -> bool {
    matches!(label.0, [255, 0, 0] | [255, 255, 255])
}
