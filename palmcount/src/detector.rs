//! Detection engine: the model capability and its ONNX Runtime implementation.
//!
//! The orchestrator only talks to the [`Detector`] trait. Production uses
//! [`OnnxDetector`]; tests substitute scripted detectors.

use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::{RunOptions, Session};
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;
use crate::config::InferenceParams;
use crate::detection_obj::{ClassNames, Detection};
use crate::onnx_session::{
    arena_device, arena_shrink_options, class_names_from_session, create_onnx_session,
    load_with_fallback, run_model, Backend, DeviceSelection, ModelInputSpec, SessionConfig,
};
use crate::yolo_postprocessing::{postprocess_output, DecodeParams, TilePlacement};
use crate::yolo_preprocessing::{align_to_stride, preprocess_image};

/// Result of one `predict` call.
///
/// Small images come back as one bulk result; large images are streamed as a
/// lazy, single-pass sequence of per-tile batches.
pub enum Prediction<'a> {
    Bulk(Vec<Detection>),
    Streamed(Box<dyn Iterator<Item = Result<Vec<Detection>>> + 'a>),
}

impl Prediction<'_> {
    /// Fold every batch into one detection list.
    ///
    /// `on_batch` is called with the 1-based batch number after each batch
    /// arrives; a bulk result counts as a single batch.
    pub fn flatten(self, mut on_batch: impl FnMut(usize)) -> Result<Vec<Detection>> {
        match self {
            Prediction::Bulk(detections) => {
                on_batch(1);
                Ok(detections)
            }
            Prediction::Streamed(batches) => {
                let mut all = Vec::new();
                for (index, batch) in batches.enumerate() {
                    all.extend(batch?);
                    on_batch(index + 1);
                }
                Ok(all)
            }
        }
    }
}

/// Anything that turns an image into detections
pub trait Detector {
    fn names(&self) -> &ClassNames;

    fn backend(&self) -> Backend;

    fn predict<'a>(
        &'a mut self,
        image_path: &Path,
        params: &InferenceParams,
    ) -> Result<Prediction<'a>>;

    /// Release cached resources between images
    fn reclaim(&mut self) {}
}

/// Pixels shared by neighbouring tiles, so a tree on a seam is seen whole by one of them
pub const TILE_OVERLAP: u32 = 256;

/// A rectangle of the source image processed in one forward pass.
///
/// Tiles overlap; each one owns the centroids in `[own_x0, own_x1) x [own_y0, own_y1)`,
/// and those owned regions partition the image so every tree is counted once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub own_x0: u32,
    pub own_x1: u32,
    pub own_y0: u32,
    pub own_y1: u32,
}

impl TileRect {
    /// Whether the detection's centroid falls in this tile's owned region
    pub fn owns(&self, detection: &Detection) -> bool {
        let (cx, cy) = detection.centroid();
        cx >= f64::from(self.own_x0)
            && cx < f64::from(self.own_x1)
            && cy >= f64::from(self.own_y0)
            && cy < f64::from(self.own_y1)
    }
}

/// One axis of the tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u32,
    len: u32,
    own_start: u32,
    own_end: u32,
}

fn tile_spans(total: u32, tile: u32, overlap: u32) -> Vec<Span> {
    let tile = tile.max(1);
    let step = tile - overlap.min(tile / 2);

    let mut starts = vec![0u32];
    while let Some(&last) = starts.last() {
        if last + tile >= total {
            break;
        }
        starts.push(last + step);
    }

    let ends: Vec<u32> = starts.iter().map(|&start| (start + tile).min(total)).collect();
    // Neighbouring tiles split their overlap at its midpoint
    let seam = |i: usize| starts[i + 1] + (ends[i] - starts[i + 1]) / 2;

    (0..starts.len())
        .map(|i| Span {
            start: starts[i],
            len: ends[i] - starts[i],
            own_start: if i == 0 { 0 } else { seam(i - 1) },
            own_end: if i + 1 == starts.len() { u32::MAX } else { seam(i) },
        })
        .collect()
}

/// Row-major grid of at most `tile`-sized rectangles covering the image, with
/// neighbours sharing `overlap` pixels. Edge tiles are smaller when needed.
pub fn tile_grid(width: u32, height: u32, tile: u32, overlap: u32) -> Vec<TileRect> {
    let columns = tile_spans(width, tile, overlap);
    tile_spans(height, tile, overlap)
        .into_iter()
        .flat_map(|row| {
            columns.iter().map(move |col| TileRect {
                x: col.start,
                y: row.start,
                width: col.len,
                height: row.len,
                own_x0: col.own_start,
                own_x1: col.own_end,
                own_y0: row.own_start,
                own_y1: row.own_end,
            })
        })
        .collect()
}

pub fn needs_tiling(width: u32, height: u32, imgsz: u32) -> bool {
    width > imgsz || height > imgsz
}

/// Detections an image may still produce across its tiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBudget {
    remaining: usize,
}

impl TileBudget {
    pub fn new(max_det: usize) -> Self {
        Self { remaining: max_det }
    }

    pub fn is_spent(&self) -> bool {
        self.remaining == 0
    }

    /// Keep the detections `tile` owns, most confident first, within the remaining budget
    pub fn settle(&mut self, tile: &TileRect, detections: Vec<Detection>) -> Vec<Detection> {
        let mut kept: Vec<Detection> = detections.into_iter().filter(|d| tile.owns(d)).collect();
        kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        kept.truncate(self.remaining);
        self.remaining -= kept.len();
        kept
    }
}

/// Run `primary`; when it fails on the GPU, run `cpu` exactly once instead.
/// CPU failures are returned as they are.
pub fn retry_once_on_cpu<T>(
    backend: Backend,
    primary: impl FnOnce() -> Result<T>,
    cpu: impl FnOnce() -> Result<T>,
) -> Result<T> {
    match primary() {
        Ok(value) => Ok(value),
        Err(e) if backend == Backend::Gpu => {
            log::warn!("{}Prediction failed: {e:#}", symbols::warning());
            log::warn!("{}Retrying on CPU...", symbols::warning());
            cpu().context("Prediction failed on CPU retry")
        }
        Err(e) => Err(e),
    }
}

/// One-shot request to shrink a session's memory arena on its next run
#[derive(Debug, Default)]
struct PendingReclaim(bool);

impl PendingReclaim {
    fn request(&mut self) {
        self.0 = true;
    }

    fn take(&mut self) -> bool {
        std::mem::take(&mut self.0)
    }
}

struct ModelSession {
    session: Session,
    backend: Backend,
    input: ModelInputSpec,
    reclaim: PendingReclaim,
}

impl ModelSession {
    fn new(session: Session, backend: Backend) -> Result<Self> {
        let input = ModelInputSpec::from_session(&session)?;
        Ok(Self {
            session,
            backend,
            input,
            reclaim: PendingReclaim::default(),
        })
    }

    /// Model input side for a region whose longest side is `region_side`
    fn input_size(&self, region_side: u32) -> u32 {
        self.input.fixed_size.unwrap_or_else(|| align_to_stride(region_side))
    }

    /// Options for the next run: arena shrinkage once after a reclaim request
    fn run_options(&mut self) -> Option<RunOptions> {
        if !self.reclaim.take() {
            return None;
        }
        match arena_shrink_options(self.backend) {
            Ok(options) => Some(options),
            Err(e) => {
                log::debug!("Skipping arena shrinkage: {e:#}");
                None
            }
        }
    }

    fn detect(
        &mut self,
        region: &RgbImage,
        offset: (u32, u32),
        full_size: (u32, u32),
        params: &InferenceParams,
        names: &ClassNames,
    ) -> Result<Vec<Detection>> {
        let input_size = self.input_size(region.width().max(region.height()));
        let (input, letterbox) = preprocess_image(region, input_size)?;
        let options = self.run_options();
        let output = run_model(&mut self.session, &self.input.name, input, options.as_ref())?;

        let decode = DecodeParams {
            confidence_threshold: params.confidence,
            num_classes: names.len(),
        };
        let placement = TilePlacement {
            letterbox,
            offset_x: offset.0 as f32,
            offset_y: offset.1 as f32,
            image_width: full_size.0,
            image_height: full_size.1,
        };
        postprocess_output(
            &output,
            &decode,
            &placement,
            params.iou_threshold,
            params.max_det,
        )
    }
}

fn cpu_session<'s>(
    slot: &'s mut Option<ModelSession>,
    model_path: &Path,
) -> Result<&'s mut ModelSession> {
    if slot.is_none() {
        let session = create_onnx_session(model_path, &SessionConfig::on(Backend::Cpu))?;
        *slot = Some(ModelSession::new(session, Backend::Cpu)?);
    }
    slot.as_mut()
        .ok_or_else(|| anyhow::anyhow!("CPU fallback session unavailable"))
}

/// YOLO-style detector running through ONNX Runtime
pub struct OnnxDetector {
    model_path: PathBuf,
    primary: ModelSession,
    cpu_fallback: Option<ModelSession>,
    names: ClassNames,
}

impl OnnxDetector {
    /// Load the model on the selected backend, degrading to CPU when the GPU
    /// session cannot be built or fails its liveness pass.
    pub fn load(model_path: &Path, selection: &DeviceSelection) -> Result<Self> {
        let (session, backend) = load_with_fallback(model_path, selection)?;
        let names = class_names_from_session(&session);
        let primary = ModelSession::new(session, backend)?;

        log::info!(
            "Model classes: {}",
            names
                .iter()
                .map(|(id, name)| format!("{id}={name}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        match primary.input.fixed_size {
            Some(size) => log::debug!("Model input fixed at {size}x{size}"),
            None => log::debug!("Model input is dynamic"),
        }

        Ok(Self {
            model_path: model_path.to_path_buf(),
            primary,
            cpu_fallback: None,
            names,
        })
    }

    /// Run one region, retrying once on CPU when the GPU call fails
    fn detect_region(
        &mut self,
        region: &RgbImage,
        offset: (u32, u32),
        full_size: (u32, u32),
        params: &InferenceParams,
    ) -> Result<Vec<Detection>> {
        let names = &self.names;
        let primary = &mut self.primary;
        let fallback = &mut self.cpu_fallback;
        let model_path = self.model_path.as_path();

        retry_once_on_cpu(
            primary.backend,
            || primary.detect(region, offset, full_size, params, names),
            || cpu_session(fallback, model_path)?.detect(region, offset, full_size, params, names),
        )
    }
}

struct TileStream<'a> {
    detector: &'a mut OnnxDetector,
    image: RgbImage,
    tiles: std::vec::IntoIter<TileRect>,
    budget: TileBudget,
    params: InferenceParams,
}

impl Iterator for TileStream<'_> {
    type Item = Result<Vec<Detection>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.budget.is_spent() && !self.tiles.as_slice().is_empty() {
            log::debug!(
                "Detection cap of {} reached, skipping {} remaining tiles",
                self.params.max_det,
                self.tiles.len()
            );
            self.tiles = Vec::new().into_iter();
        }

        let tile = self.tiles.next()?;
        let region =
            image::imageops::crop_imm(&self.image, tile.x, tile.y, tile.width, tile.height)
                .to_image();
        let full_size = self.image.dimensions();
        let detections =
            self.detector
                .detect_region(&region, (tile.x, tile.y), full_size, &self.params);
        Some(detections.map(|detections| self.budget.settle(&tile, detections)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.tiles.len()))
    }
}

impl Detector for OnnxDetector {
    fn names(&self) -> &ClassNames {
        &self.names
    }

    fn backend(&self) -> Backend {
        self.primary.backend
    }

    fn predict<'a>(
        &'a mut self,
        image_path: &Path,
        params: &InferenceParams,
    ) -> Result<Prediction<'a>> {
        let image = image::open(image_path)
            .with_context(|| format!("Failed to read {}", image_path.display()))?
            .into_rgb8();
        let (width, height) = image.dimensions();

        if !needs_tiling(width, height, params.imgsz) {
            let detections = self.detect_region(&image, (0, 0), (width, height), params)?;
            return Ok(Prediction::Bulk(detections));
        }

        let tiles = tile_grid(width, height, params.imgsz, TILE_OVERLAP);
        log::debug!(
            "{}x{} exceeds inference size {}, streaming {} tiles",
            width,
            height,
            params.imgsz,
            tiles.len()
        );
        Ok(Prediction::Streamed(Box::new(TileStream {
            detector: self,
            image,
            tiles: tiles.into_iter(),
            budget: TileBudget::new(params.max_det),
            params: params.clone(),
        })))
    }

    /// Shrink the active session's memory arena on its next run and drop the
    /// CPU fallback session if one was created
    fn reclaim(&mut self) {
        self.primary.reclaim.request();
        log::debug!(
            "Arena shrinkage requested on {}",
            arena_device(self.primary.backend)
        );
        if self.cpu_fallback.take().is_some() {
            log::debug!("Released CPU fallback session");
        }
    }
}
