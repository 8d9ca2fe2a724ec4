//! Input raster validation and pixel-format normalization.
//!
//! The detection engine only ever sees 8-bit RGB. Rasters stored in any other
//! layout (palette, grayscale, alpha, CMYK, 16-bit) get a normalized JPEG copy
//! beside the original that lives exactly as long as the `PreparedImage`.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, ImageReader};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::error::ImageFailure;

const NORMALIZED_JPEG_QUALITY: u8 = 95;

/// Facts about one input raster, captured before inference
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub original_pixel_format: ColorType,
}

/// Temporary normalized copy, removed when dropped
#[derive(Debug)]
pub struct TempImage {
    path: PathBuf,
}

impl TempImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed temporary image {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "Failed to remove temporary image {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

#[derive(Debug)]
pub struct PreparedImage {
    pub record: ImageRecord,
    normalized: Option<TempImage>,
}

impl PreparedImage {
    /// The raster the detection engine should read
    pub fn inference_path(&self) -> &Path {
        self.normalized
            .as_ref()
            .map(TempImage::path)
            .unwrap_or(&self.record.path)
    }

    pub fn was_normalized(&self) -> bool {
        self.normalized.is_some()
    }
}

/// Path of the normalized copy for `path`: `{stem}_temp_rgb.jpg` in the same folder
pub fn temp_rgb_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    path.with_file_name(format!("{stem}_temp_rgb.jpg"))
}

pub fn describe_color_type(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 => "L8",
        ColorType::La8 => "La8",
        ColorType::Rgb8 => "Rgb8",
        ColorType::Rgba8 => "Rgba8",
        ColorType::L16 => "L16",
        ColorType::La16 => "La16",
        ColorType::Rgb16 => "Rgb16",
        ColorType::Rgba16 => "Rgba16",
        ColorType::Rgb32F => "Rgb32F",
        ColorType::Rgba32F => "Rgba32F",
        _ => "unknown",
    }
}

fn load_image(path: &Path) -> Result<DynamicImage, ImageFailure> {
    let invalid = |reason: String| ImageFailure::InvalidImage {
        path: path.to_path_buf(),
        reason,
    };

    let reader = ImageReader::open(path)
        .map_err(|e| invalid(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| invalid(e.to_string()))?;
    reader.decode().map_err(|e| invalid(e.to_string()))
}

fn write_normalized_copy(img: &DynamicImage, target: &Path) -> Result<(), ImageFailure> {
    let rgb = img.to_rgb8();
    let file = File::create(target).map_err(|e| ImageFailure::InvalidImage {
        path: target.to_path_buf(),
        reason: format!("could not create normalized copy: {e}"),
    })?;
    let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), NORMALIZED_JPEG_QUALITY);
    encoder
        .encode_image(&rgb)
        .map_err(|e| ImageFailure::InvalidImage {
            path: target.to_path_buf(),
            reason: format!("could not write normalized copy: {e}"),
        })
}

/// Open the raster, record its geometry and pixel format, and normalize it to
/// 8-bit RGB when needed.
pub fn validate_and_preprocess(path: &Path) -> Result<PreparedImage, ImageFailure> {
    if !path.is_file() {
        return Err(ImageFailure::NotAFile);
    }

    let img = load_image(path)?;
    let record = ImageRecord {
        path: path.to_path_buf(),
        width: img.width(),
        height: img.height(),
        original_pixel_format: img.color(),
    };

    if record.original_pixel_format == ColorType::Rgb8 {
        return Ok(PreparedImage {
            record,
            normalized: None,
        });
    }

    let target = temp_rgb_path(path);
    // Guard first so a half-written copy is removed as well.
    let guard = TempImage {
        path: target.clone(),
    };
    write_normalized_copy(&img, &target)?;
    log::debug!(
        "Normalized {} from {} to Rgb8",
        path.display(),
        describe_color_type(record.original_pixel_format)
    );

    Ok(PreparedImage {
        record,
        normalized: Some(guard),
    })
}
