//! Annotated preview rendering.

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::color_utils::symbols;
use crate::config::OutputToggles;
use crate::detection_obj::{ClassNames, Detection};

const TEXT_SCALE: f32 = 20.0;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
/// Glyph box used to size label chips when no font could be loaded
const FALLBACK_GLYPH: (u32, u32) = (11, 15);

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/noto/NotoSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
    "C:\\Windows\\Fonts\\segoeui.ttf",
];

static LABEL_FONT: OnceLock<Option<FontVec>> = OnceLock::new();

fn font_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = std::env::var_os("PALMCOUNT_FONT").filter(|p| !p.is_empty()) {
        candidates.push(PathBuf::from(path));
    }
    candidates.extend(FONT_CANDIDATES.iter().map(PathBuf::from));
    candidates
}

fn load_font() -> Option<FontVec> {
    for path in font_candidates() {
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        match FontVec::try_from_vec(bytes) {
            Ok(font) => {
                log::debug!("Preview labels use font {}", path.display());
                return Some(font);
            }
            Err(e) => log::debug!("Skipping font {}: {e}", path.display()),
        }
    }
    log::warn!(
        "{}No TrueType font found (set PALMCOUNT_FONT); preview labels are drawn without text",
        symbols::warning()
    );
    None
}

fn label_font() -> Option<&'static FontVec> {
    LABEL_FONT.get_or_init(load_font).as_ref()
}

/// Box color per class id
pub fn class_color(class_id: u32) -> Rgb<u8> {
    match class_id {
        0 => Rgb([255, 0, 0]),
        1 => Rgb([0, 255, 0]),
        2 => Rgb([0, 0, 255]),
        3 => Rgb([0, 255, 255]),
        4 => Rgb([255, 0, 255]),
        5 => Rgb([255, 255, 0]),
        _ => Rgb([128, 128, 128]),
    }
}

/// Caption for a box: `label: 0.87`, `label`, `0.87`, or nothing
pub fn label_text(
    detection: &Detection,
    names: &ClassNames,
    show_labels: bool,
    show_conf: bool,
) -> Option<String> {
    match (show_labels, show_conf) {
        (true, true) => Some(format!(
            "{}: {:.2}",
            names.label(detection.class_id),
            detection.confidence
        )),
        (true, false) => Some(names.label(detection.class_id)),
        (false, true) => Some(format!("{:.2}", detection.confidence)),
        (false, false) => None,
    }
}

/// Draw a `width`-thick rectangle outline centered on the box edges
fn draw_thick_rect(img: &mut RgbImage, detection: &Detection, width: u32, color: Rgb<u8>) {
    let x1 = detection.x1.round() as i32;
    let y1 = detection.y1.round() as i32;
    let x2 = detection.x2.round() as i32;
    let y2 = detection.y2.round() as i32;

    let width = width.max(1) as i32;
    let inner = width / 2;
    for offset in -inner..(width - inner) {
        let w = (x2 - x1) + 2 * offset;
        let h = (y2 - y1) + 2 * offset;
        if w <= 0 || h <= 0 {
            continue;
        }
        let rect = Rect::at(x1 - offset, y1 - offset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(img, rect, color);
    }
}

fn draw_caption(img: &mut RgbImage, detection: &Detection, caption: &str, color: Rgb<u8>) {
    let scale = PxScale::from(TEXT_SCALE);
    let font = label_font();
    let (text_width, text_height) = match font {
        Some(font) => text_size(scale, font, caption),
        None => (
            FALLBACK_GLYPH.0 * caption.chars().count() as u32,
            FALLBACK_GLYPH.1,
        ),
    };

    let chip_height = text_height + 10;
    let x = detection.x1.max(0.0) as i32;
    // Above the box when there is room, otherwise just inside its top edge
    let top = detection.y1 as i32 - chip_height as i32;
    let y = if top >= 0 { top } else { detection.y1.max(0.0) as i32 };

    let chip = Rect::at(x, y).of_size(text_width.max(1) + 4, chip_height);
    draw_filled_rect_mut(img, chip, color);

    if let Some(font) = font {
        draw_text_mut(img, TEXT_COLOR, x + 2, y + 3, scale, font, caption);
    }
}

/// Draw every detection onto `img`
pub fn draw_detections(
    img: &mut RgbImage,
    detections: &[Detection],
    names: &ClassNames,
    toggles: &OutputToggles,
) {
    for detection in detections {
        let color = class_color(detection.class_id);
        draw_thick_rect(img, detection, toggles.line_width, color);
        if let Some(caption) =
            label_text(detection, names, toggles.show_labels, toggles.show_conf)
        {
            draw_caption(img, detection, &caption, color);
        }
    }
}

/// Render the annotated preview of `source` and save it as JPEG at `output_path`
pub fn save_annotated_preview(
    source: &Path,
    detections: &[Detection],
    names: &ClassNames,
    toggles: &OutputToggles,
    output_path: &Path,
) -> Result<()> {
    let mut img = image::open(source)
        .with_context(|| format!("Failed to read {}", source.display()))?
        .into_rgb8();
    draw_detections(&mut img, detections, names, toggles);
    img.save_with_format(output_path, image::ImageFormat::Jpeg)
        .with_context(|| format!("Failed to save {}", output_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_class_colors() {
        assert_eq!(class_color(0), Rgb([255, 0, 0]));
        assert_eq!(class_color(1), Rgb([0, 255, 0]));
        assert_eq!(class_color(2), Rgb([0, 0, 255]));
        assert_eq!(class_color(3), Rgb([0, 255, 255]));
        assert_eq!(class_color(4), Rgb([255, 0, 255]));
        assert_eq!(class_color(5), Rgb([255, 255, 0]));
        assert_eq!(class_color(6), Rgb([128, 128, 128]));
        assert_eq!(class_color(99), Rgb([128, 128, 128]));
    }

    #[test]
    fn test_label_text_variants() {
        let names = ClassNames::default_palm();
        let detection = Detection::new(0.0, 0.0, 1.0, 1.0, 0.8712, 0);
        assert_eq!(
            label_text(&detection, &names, true, true).as_deref(),
            Some("abnormal: 0.87")
        );
        assert_eq!(
            label_text(&detection, &names, true, false).as_deref(),
            Some("abnormal")
        );
        assert_eq!(
            label_text(&detection, &names, false, true).as_deref(),
            Some("0.87")
        );
        assert_eq!(label_text(&detection, &names, false, false), None);

        let unknown = Detection::new(0.0, 0.0, 1.0, 1.0, 0.5, 9);
        assert_eq!(
            label_text(&unknown, &names, true, false).as_deref(),
            Some("class_9")
        );
    }

    #[test]
    fn test_boxes_are_drawn_in_class_color() {
        let mut img = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        let toggles = OutputToggles {
            show_labels: false,
            show_conf: false,
            line_width: 3,
            ..OutputToggles::default()
        };
        let detections = vec![Detection::new(20.0, 20.0, 60.0, 60.0, 0.9, 1)];
        draw_detections(&mut img, &detections, &ClassNames::default_palm(), &toggles);

        assert_eq!(*img.get_pixel(20, 40), Rgb([0, 255, 0]));
        assert_eq!(*img.get_pixel(19, 40), Rgb([0, 255, 0]));
        assert_eq!(*img.get_pixel(40, 40), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_save_preview_writes_jpeg() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("plot.png");
        RgbImage::from_pixel(64, 64, Rgb([30, 90, 30]))
            .save(&source)
            .unwrap();
        let output = temp_dir.path().join("plot_annotated.jpg");

        save_annotated_preview(
            &source,
            &[Detection::new(5.0, 30.0, 40.0, 60.0, 0.75, 0)],
            &ClassNames::default_palm(),
            &OutputToggles::default(),
            &output,
        )
        .unwrap();

        let written = image::open(&output).unwrap();
        assert_eq!((written.width(), written.height()), (64, 64));
    }
}
