//! On-disk feature exchange: raw little-endian f32 plus a JSON sidecar.
//!
//! `aud_ave.bin` holds `num_frames * feature_size` floats; `aud_ave.json`
//! describes them:
//!
//! ```json
//! { "num_frames": 49, "feature_size": 512, "shape": [49, 512] }
//! ```

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LipframeError, Result};
use crate::features::EmbeddingSequence;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSidecar {
    pub num_frames: usize,
    pub feature_size: usize,
    pub shape: Vec<usize>,
}

impl FeatureSidecar {
    pub fn for_matrix(num_frames: usize, feature_size: usize) -> Self {
        Self {
            num_frames,
            feature_size,
            shape: vec![num_frames, feature_size],
        }
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let product: usize = self.shape.iter().product();
        if self.shape.is_empty() || product != self.num_frames * self.feature_size {
            return Err(LipframeError::ShapeMismatch {
                tensor: path.display().to_string(),
                expected: vec![self.num_frames, self.feature_size],
                actual: self.shape.clone(),
            });
        }
        Ok(())
    }
}

/// Sidecar path for a `.bin` feature file (`x.bin` → `x.json`).
pub fn sidecar_path(bin: &Path) -> PathBuf {
    bin.with_extension("json")
}

/// Write a flat `[rows][cols]` matrix and its sidecar.
pub fn write_matrix(bin: &Path, rows: usize, cols: usize, data: &[f32]) -> Result<()> {
    if data.len() != rows * cols {
        return Err(LipframeError::ShapeMismatch {
            tensor: bin.display().to_string(),
            expected: vec![rows, cols],
            actual: vec![data.len()],
        });
    }
    if let Some(parent) = bin.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut out = BufWriter::new(fs::File::create(bin)?);
    for v in data {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;

    let sidecar = FeatureSidecar::for_matrix(rows, cols);
    fs::write(sidecar_path(bin), serde_json::to_string_pretty(&sidecar)?)?;
    info!(path = %bin.display(), rows, cols, "features written");
    Ok(())
}

/// Write a padded embedding sequence.
pub fn write_features(bin: &Path, seq: &EmbeddingSequence) -> Result<()> {
    write_matrix(bin, seq.len(), seq.dim(), seq.as_flat())
}

/// Read a feature file, validating it against its sidecar when present.
///
/// Without a sidecar, `fallback_dim` decides the row width.
pub fn read_features(bin: &Path, fallback_dim: usize) -> Result<EmbeddingSequence> {
    if !bin.exists() {
        return Err(LipframeError::AssetNotFound {
            path: bin.to_path_buf(),
        });
    }
    let bytes = fs::read(bin)?;
    if bytes.len() % 4 != 0 {
        return Err(LipframeError::ShapeMismatch {
            tensor: bin.display().to_string(),
            expected: vec![bytes.len() / 4 * 4],
            actual: vec![bytes.len()],
        });
    }
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    let sidecar_file = sidecar_path(bin);
    let dim = if sidecar_file.exists() {
        let sidecar: FeatureSidecar = serde_json::from_str(&fs::read_to_string(&sidecar_file)?)?;
        sidecar.validate(bin)?;
        if sidecar.num_frames * sidecar.feature_size != data.len() {
            return Err(LipframeError::ShapeMismatch {
                tensor: bin.display().to_string(),
                expected: vec![sidecar.num_frames, sidecar.feature_size],
                actual: vec![data.len()],
            });
        }
        sidecar.feature_size
    } else {
        fallback_dim
    };

    let seq = EmbeddingSequence::from_flat(dim, data)?;
    info!(path = %bin.display(), frames = seq.len(), dim, "features loaded");
    Ok(seq)
}
