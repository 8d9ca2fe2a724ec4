use anyhow::Result;
use image::RgbImage;
use ndarray::{Array, Array4, IxDyn};

const PAD_VALUE: f32 = 114.0 / 255.0;

/// How a source image was placed inside the square model input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl LetterboxInfo {
    /// Map a point from model-input space back to source-image space
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Letterbox `img` into a `target_size` square with gray padding and convert it
/// to a normalized NCHW tensor.
pub fn preprocess_image(
    img: &RgbImage,
    target_size: u32,
) -> Result<(Array<f32, IxDyn>, LetterboxInfo)> {
    let (orig_width, orig_height) = img.dimensions();
    if orig_width == 0 || orig_height == 0 {
        return Err(anyhow::anyhow!("Cannot preprocess an empty image"));
    }

    let max_dim = orig_width.max(orig_height);
    let scale = (target_size as f32) / (max_dim as f32);
    let new_width = ((orig_width as f32 * scale).round() as u32).clamp(1, target_size);
    let new_height = ((orig_height as f32 * scale).round() as u32).clamp(1, target_size);

    let resized;
    let source = if new_width == orig_width && new_height == orig_height {
        img
    } else {
        resized = image::imageops::resize(
            img,
            new_width,
            new_height,
            image::imageops::FilterType::Triangle,
        );
        &resized
    };

    // Center the resized image
    let x_offset = (target_size - new_width) / 2;
    let y_offset = (target_size - new_height) / 2;

    let size = target_size as usize;
    let mut input = Array4::<f32>::from_elem((1, 3, size, size), PAD_VALUE);
    for (x, y, pixel) in source.enumerate_pixels() {
        let tx = (x + x_offset) as usize;
        let ty = (y + y_offset) as usize;
        for c in 0..3 {
            input[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
        }
    }

    let info = LetterboxInfo {
        scale: new_width as f32 / orig_width as f32,
        pad_x: x_offset as f32,
        pad_y: y_offset as f32,
    };

    Ok((input.into_dyn(), info))
}

/// All-zero input used for liveness and verification passes
pub fn zero_input(size: u32) -> Array<f32, IxDyn> {
    let size = size as usize;
    Array::zeros(IxDyn(&[1, 3, size, size]))
}

/// Round up to the next multiple of the model stride
pub fn align_to_stride(size: u32) -> u32 {
    const STRIDE: u32 = 32;
    size.div_ceil(STRIDE).max(1) * STRIDE
}
