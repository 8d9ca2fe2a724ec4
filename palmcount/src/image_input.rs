use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Check if a path names a GeoTIFF raster (`.tif` / `.tiff`, any case).
///
/// Other raster types are ignored on purpose so the normalized `_temp_rgb.jpg`
/// copies written next to the inputs never get picked up as inputs themselves.
pub fn is_tiff_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            matches!(ext_lower.as_str(), "tif" | "tiff")
        })
        .unwrap_or(false)
}

/// Find all TIFF files directly inside a directory (non-recursive), sorted by name
pub fn find_tiffs_in_directory(dir_path: &Path) -> Result<Vec<PathBuf>> {
    let mut image_files = Vec::new();

    let entries = fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read folder {}", dir_path.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_tiff_file(&path) {
            image_files.push(path);
        }
    }

    image_files.sort();
    Ok(image_files)
}

/// Parse the files-mode JSON argument: a non-empty array of path strings.
///
/// Non-string entries and paths without a TIFF extension are dropped. Paths that
/// do not exist are kept; they fail individually during the batch.
pub fn parse_file_list(files_json: &str) -> Result<Vec<PathBuf>, ConfigError> {
    let value: serde_json::Value = serde_json::from_str(files_json)?;
    let entries = match value.as_array() {
        Some(entries) if !entries.is_empty() => entries,
        _ => return Err(ConfigError::EmptyFileList),
    };

    let files: Vec<PathBuf> = entries
        .iter()
        .filter_map(|entry| entry.as_str())
        .map(PathBuf::from)
        .filter(|path| is_tiff_file(path))
        .collect();

    if files.is_empty() {
        return Err(ConfigError::NoTiffPaths);
    }
    Ok(files)
}
