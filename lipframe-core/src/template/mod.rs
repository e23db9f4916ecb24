//! Template clip on disk: frames, landmarks and the crop geometry derived
//! from them.
//!
//! ```text
//! <template>/
//!   full_body_img/0.jpg, 1.jpg, …
//!   landmarks/0.lms, 1.lms, …      one "x y" pair per line, ≥ 53 lines
//!   parsing/0.png, …               optional segmentation masks
//! ```

pub mod crop_cache;
pub mod selector;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LipframeError, Result};

pub use crop_cache::CropRectCache;
pub use selector::TemplateIndexSelector;

/// Landmarks a crop region needs: indices 1, 31 and 52.
pub const MIN_LANDMARKS: usize = 53;

const LM_LEFT: usize = 1;
const LM_RIGHT: usize = 31;
const LM_TOP: usize = 52;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Ordered facial landmarks of one template frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Landmarks {
    points: Vec<Point>,
}

impl Landmarks {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Parse `x y` pairs, one per line. Coordinates may be written as floats
    /// and are truncated toward zero.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let malformed = |reason: String| LipframeError::MalformedLandmarks {
            path: path.to_path_buf(),
            reason,
        };

        let mut points = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(x), Some(y)) = (fields.next(), fields.next()) else {
                return Err(malformed(format!("line {}: expected 'x y'", line_no + 1)));
            };
            let coord = |s: &str| {
                s.parse::<f32>()
                    .map(|v| v as i32)
                    .map_err(|e| malformed(format!("line {}: {e}", line_no + 1)))
            };
            points.push(Point {
                x: coord(x)?,
                y: coord(y)?,
            });
        }

        if points.len() < MIN_LANDMARKS {
            return Err(malformed(format!(
                "{} points, need at least {MIN_LANDMARKS}",
                points.len()
            )));
        }
        Ok(Self { points })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LipframeError::AssetNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::parse(&fs::read_to_string(path)?, path)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Point> {
        self.points.get(index).copied()
    }
}

/// Square face region `(x_min, y_min, x_max, y_max)`, max-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl CropRegion {
    /// Left edge from landmark 1, right from 31, top from 52; the bottom
    /// edge makes the region square.
    pub fn from_landmarks(lms: &Landmarks) -> Result<Self> {
        let pick = |i: usize| {
            lms.get(i).ok_or_else(|| LipframeError::MalformedLandmarks {
                path: PathBuf::new(),
                reason: format!("landmark {i} missing"),
            })
        };
        let x_min = pick(LM_LEFT)?.x;
        let y_min = pick(LM_TOP)?.y;
        let x_max = pick(LM_RIGHT)?.x;
        let y_max = x_max
            .checked_sub(x_min)
            .and_then(|width| y_min.checked_add(width))
            .ok_or_else(|| LipframeError::MalformedLandmarks {
                path: PathBuf::new(),
                reason: format!(
                    "crop region from x {x_min}..{x_max}, top {y_min} overflows"
                ),
            })?;
        Ok(Self {
            x_min,
            y_min,
            x_max,
            y_max,
        })
    }

    pub fn from_rect(rect: [i32; 4]) -> Self {
        Self {
            x_min: rect[0],
            y_min: rect[1],
            x_max: rect[2],
            y_max: rect[3],
        }
    }

    pub fn as_rect(&self) -> [i32; 4] {
        [self.x_min, self.y_min, self.x_max, self.y_max]
    }

    pub fn width(&self) -> i32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> i32 {
        self.y_max.saturating_sub(self.y_min)
    }

    /// Intersect with a `width × height` image.
    ///
    /// # Errors
    /// `InvalidCrop` when nothing of the region lies inside the image.
    pub fn clip_to(&self, width: u32, height: u32) -> Result<Self> {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        let clipped = Self {
            x_min: self.x_min.clamp(0, w),
            y_min: self.y_min.clamp(0, h),
            x_max: self.x_max.clamp(0, w),
            y_max: self.y_max.clamp(0, h),
        };
        if clipped.width() <= 0 || clipped.height() <= 0 {
            return Err(LipframeError::InvalidCrop {
                region: self.as_rect(),
                width,
                height,
            });
        }
        Ok(clipped)
    }
}

/// One template frame: image on disk plus its parsed landmarks.
#[derive(Debug, Clone)]
pub struct TemplateFrame {
    pub index: usize,
    pub image_path: PathBuf,
    pub parsing_path: Option<PathBuf>,
    pub landmarks: Landmarks,
}

/// Every frame of a template clip, landmarks pre-loaded.
///
/// Immutable after `load`; shared between render workers behind an `Arc`.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    root: PathBuf,
    frames: Vec<TemplateFrame>,
}

impl TemplateSet {
    /// Scan `root` and load every frame's landmarks.
    ///
    /// Frames are numbered `0..n` where `n` is the number of `.jpg` files in
    /// `full_body_img/`; a gap in the numbering or a missing landmark file is
    /// a startup error.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let img_dir = root.join("full_body_img");
        let lms_dir = root.join("landmarks");
        let parsing_dir = root.join("parsing");
        for dir in [&img_dir, &lms_dir] {
            if !dir.is_dir() {
                return Err(LipframeError::AssetNotFound { path: dir.clone() });
            }
        }

        let count = fs::read_dir(&img_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg"))
            })
            .count();
        if count == 0 {
            return Err(LipframeError::AssetNotFound {
                path: img_dir.join("0.jpg"),
            });
        }

        let mut frames = Vec::with_capacity(count);
        for index in 0..count {
            let image_path = img_dir.join(format!("{index}.jpg"));
            if !image_path.exists() {
                return Err(LipframeError::AssetNotFound { path: image_path });
            }
            let landmarks = Landmarks::load(&lms_dir.join(format!("{index}.lms")))?;
            let parsing_path = Some(parsing_dir.join(format!("{index}.png"))).filter(|p| p.exists());
            frames.push(TemplateFrame {
                index,
                image_path,
                parsing_path,
                landmarks,
            });
        }

        info!(
            root = %root.display(),
            frames = frames.len(),
            with_parsing = frames.iter().filter(|f| f.parsing_path.is_some()).count(),
            "template loaded"
        );
        Ok(Self { root, frames })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&TemplateFrame> {
        self.frames.get(index)
    }

    pub fn frames(&self) -> &[TemplateFrame] {
        &self.frames
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Landmark text whose crop region is `(x, y) .. (x + size, y + size)`.
    pub fn landmark_text(x: i32, y: i32, size: i32) -> String {
        let mut lines = Vec::new();
        for i in 0..MIN_LANDMARKS {
            let (px, py) = match i {
                LM_LEFT => (x, y + 40),
                LM_RIGHT => (x + size, y + 40),
                LM_TOP => (x + size / 2, y),
                _ => (x + 1, y + 1),
            };
            lines.push(format!("{px}.0 {py}.0"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::landmark_text;
    use super::*;

    #[test]
    fn parses_float_coordinates_by_truncation() {
        let mut text = landmark_text(10, 20, 100);
        text.push_str("\n12.9 -3.7\n");
        let lms = Landmarks::parse(&text, Path::new("x.lms")).unwrap();
        assert_eq!(lms.len(), 54);
        assert_eq!(lms.get(53), Some(Point { x: 12, y: -3 }));
    }

    #[test]
    fn too_few_points_is_malformed() {
        let text = "1 2\n3 4\n";
        let err = Landmarks::parse(text, Path::new("short.lms")).unwrap_err();
        assert!(matches!(err, LipframeError::MalformedLandmarks { .. }));
        assert!(err.to_string().contains("short.lms"));
    }

    #[test]
    fn garbage_coordinates_are_malformed() {
        let text = landmark_text(0, 0, 10).replacen("1.0", "one", 1);
        assert!(matches!(
            Landmarks::parse(&text, Path::new("bad.lms")),
            Err(LipframeError::MalformedLandmarks { .. })
        ));
    }

    #[test]
    fn crop_region_is_square_from_three_landmarks() {
        let lms = Landmarks::parse(&landmark_text(30, 50, 120), Path::new("a.lms")).unwrap();
        let region = CropRegion::from_landmarks(&lms).unwrap();
        assert_eq!(region.as_rect(), [30, 50, 150, 170]);
        assert_eq!(region.width(), region.height());
    }

    #[test]
    fn extreme_landmark_coordinates_are_malformed_not_a_panic() {
        let mut points = vec![Point { x: 0, y: 0 }; MIN_LANDMARKS];
        points[LM_LEFT] = Point { x: -10, y: 0 };
        points[LM_RIGHT] = Point { x: i32::MAX, y: 0 };
        assert!(matches!(
            CropRegion::from_landmarks(&Landmarks::new(points.clone())),
            Err(LipframeError::MalformedLandmarks { .. })
        ));

        points[LM_LEFT] = Point { x: 0, y: 0 };
        points[LM_RIGHT] = Point { x: 100, y: 0 };
        points[LM_TOP] = Point { x: 50, y: i32::MAX - 10 };
        assert!(matches!(
            CropRegion::from_landmarks(&Landmarks::new(points)),
            Err(LipframeError::MalformedLandmarks { .. })
        ));
        assert_eq!(CropRegion::from_rect([i32::MIN, 0, i32::MAX, 1]).width(), i32::MAX);
    }

    #[test]
    fn clipping_keeps_the_inside_and_rejects_empty_regions() {
        let region = CropRegion::from_rect([-10, 20, 50, 80]);
        assert_eq!(region.clip_to(40, 60).unwrap().as_rect(), [0, 20, 40, 60]);
        assert!(matches!(
            CropRegion::from_rect([50, 50, 50, 90]).clip_to(100, 100),
            Err(LipframeError::InvalidCrop { .. })
        ));
        assert!(CropRegion::from_rect([200, 0, 260, 60])
            .clip_to(100, 100)
            .is_err());
    }

    #[test]
    fn template_set_requires_landmarks_for_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let img_dir = dir.path().join("full_body_img");
        let lms_dir = dir.path().join("landmarks");
        fs::create_dir_all(&img_dir).unwrap();
        fs::create_dir_all(&lms_dir).unwrap();
        for i in 0..3 {
            image::RgbImage::new(8, 8)
                .save(img_dir.join(format!("{i}.jpg")))
                .unwrap();
        }
        for i in 0..2 {
            fs::write(lms_dir.join(format!("{i}.lms")), landmark_text(1, 1, 4)).unwrap();
        }
        assert!(matches!(
            TemplateSet::load(dir.path()),
            Err(LipframeError::AssetNotFound { .. })
        ));

        fs::write(lms_dir.join("2.lms"), landmark_text(1, 1, 4)).unwrap();
        let set = TemplateSet::load(dir.path()).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.frame(2).unwrap().parsing_path.is_none());
    }
}
