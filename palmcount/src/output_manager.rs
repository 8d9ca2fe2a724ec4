//! Output path management for both batch modes.
//!
//! Folder mode writes vector outputs into the scanned folder and previews into
//! `folder/annotated/`. Files mode gives every image its own sibling folder
//! `{stem}_{model}` holding both. Every artifact name is collision-checked so an
//! existing file is never overwritten.

use std::path::{Path, PathBuf};

/// Where a batch puts its artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLayout {
    /// Outputs beside the inputs in `root`, previews in `root/annotated`
    Folder { root: PathBuf },
    /// One `{stem}_{model_tag}` folder per image, next to the image
    PerImage { model_tag: String },
}

impl OutputLayout {
    pub fn per_image(model_name: &str) -> Self {
        OutputLayout::PerImage {
            model_tag: sanitize_model_name(model_name),
        }
    }
}

/// Output path management for one input image
pub struct OutputManager<'a> {
    layout: &'a OutputLayout,
    input_path: &'a Path,
}

impl<'a> OutputManager<'a> {
    pub fn new(layout: &'a OutputLayout, input_path: &'a Path) -> Self {
        Self { layout, input_path }
    }

    /// Get the input file stem (filename without extension)
    fn input_stem(&self) -> String {
        self.input_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string())
    }

    /// Folder receiving the vector outputs
    pub fn output_dir(&self) -> PathBuf {
        match self.layout {
            OutputLayout::Folder { root } => root.clone(),
            OutputLayout::PerImage { model_tag } => self
                .input_path
                .parent()
                .unwrap_or(Path::new("."))
                .join(format!("{}_{}", self.input_stem(), model_tag)),
        }
    }

    /// Folder receiving the annotated preview
    pub fn preview_dir(&self) -> PathBuf {
        match self.layout {
            OutputLayout::Folder { root } => root.join("annotated"),
            OutputLayout::PerImage { .. } => self.output_dir(),
        }
    }

    /// Create the output folder and return it
    pub fn prepare_output_dir(&self) -> std::io::Result<PathBuf> {
        let dir = self.output_dir();
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Free path for the canonical GeoJSON: `{stem}.geojson`, then `{stem}_1.geojson`, ...
    pub fn canonical_vector_path(&self) -> PathBuf {
        unique_path(&self.output_dir(), &self.input_stem(), "geojson")
    }

    /// Free path for the preview: `{stem}_annotated.jpg`, then `{stem}_annotated_1.jpg`, ...
    /// Creates the preview folder.
    pub fn preview_path(&self) -> std::io::Result<PathBuf> {
        let dir = self.preview_dir();
        std::fs::create_dir_all(&dir)?;
        Ok(unique_path(
            &dir,
            &format!("{}_annotated", self.input_stem()),
            "jpg",
        ))
    }
}

/// Free path for a file derived from `canonical` with another extension.
///
/// Uses the canonical file's stem so `plot_1.geojson` yields `plot_1.kml`.
pub fn derived_path(canonical: &Path, extension: &str) -> PathBuf {
    derived_group_path(canonical, &[extension])
}

/// Free path for a set of files sharing one stem, such as `.shp/.shx/.dbf`.
///
/// Stems are tried in turn until no member of the set exists; the returned path
/// carries the first extension.
pub fn derived_group_path(canonical: &Path, extensions: &[&str]) -> PathBuf {
    let dir = canonical.parent().unwrap_or(Path::new("."));
    let stem = canonical
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let primary = extensions.first().copied().unwrap_or("out");
    let is_free = |candidate: &str| {
        extensions
            .iter()
            .all(|ext| !dir.join(format!("{candidate}.{ext}")).exists())
    };

    if is_free(&stem) {
        return dir.join(format!("{stem}.{primary}"));
    }
    (1u64..)
        .map(|counter| format!("{stem}_{counter}"))
        .find(|candidate| is_free(candidate))
        .map(|candidate| dir.join(format!("{candidate}.{primary}")))
        .unwrap_or_else(|| dir.join(format!("{stem}.{primary}")))
}

/// First of `{stem}.{ext}`, `{stem}_1.{ext}`, `{stem}_2.{ext}`, ... that does not exist
pub fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{extension}"));
    if !first.exists() {
        return first;
    }
    (1u64..)
        .map(|counter| dir.join(format!("{stem}_{counter}.{extension}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

/// Folder-safe model name: path and reserved characters become `_`
pub fn sanitize_model_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        "model".to_string()
    } else {
        trimmed.to_string()
    }
}
