//! Precomputed crop rectangles keyed by template index.
//!
//! Stored as `{"<index>": {"rect": [x1, y1, x2, y2]}}` so the same template
//! geometry can be reused across many renders without re-reading landmarks.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LipframeError, Result};
use crate::template::{CropRegion, TemplateSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CropEntry {
    rect: [i32; 4],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CropRectCache {
    rects: BTreeMap<usize, CropRegion>,
}

impl CropRectCache {
    /// Crop regions of every template frame, from its landmarks.
    pub fn from_templates(templates: &TemplateSet) -> Result<Self> {
        let rects = templates
            .frames()
            .iter()
            .map(|f| CropRegion::from_landmarks(&f.landmarks).map(|r| (f.index, r)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { rects })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LipframeError::AssetNotFound {
                path: path.to_path_buf(),
            });
        }
        let raw: BTreeMap<String, CropEntry> = serde_json::from_str(&fs::read_to_string(path)?)?;
        let mut rects = BTreeMap::new();
        for (key, entry) in raw {
            let index = key.trim().parse::<usize>().map_err(|_| {
                LipframeError::InvalidConfig(format!(
                    "crop cache {}: key '{key}' is not a frame index",
                    path.display()
                ))
            })?;
            rects.insert(index, CropRegion::from_rect(entry.rect));
        }
        info!(path = %path.display(), rects = rects.len(), "crop cache loaded");
        Ok(Self { rects })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw: BTreeMap<String, CropEntry> = self
            .rects
            .iter()
            .map(|(i, r)| (i.to_string(), CropEntry { rect: r.as_rect() }))
            .collect();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&raw)?)?;
        info!(path = %path.display(), rects = self.rects.len(), "crop cache written");
        Ok(())
    }

    pub fn insert(&mut self, index: usize, region: CropRegion) {
        self.rects.insert(index, region);
    }

    /// # Errors
    /// `CropRectMissing` if `index` has no cached rectangle.
    pub fn get(&self, index: usize) -> Result<CropRegion> {
        self.rects
            .get(&index)
            .copied()
            .ok_or(LipframeError::CropRectMissing(index))
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }
}
