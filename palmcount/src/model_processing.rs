//! Batch orchestration: the per-image loop shared by both inference modes.
//!
//! Every image runs through `Pending -> Validating -> Inferring -> Exporting`
//! and ends as an explicit [`ImageOutcome`]. A failed image becomes a failure
//! progress record and the loop moves on; only protocol write errors abort the
//! batch.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::annotate::save_annotated_preview;
use crate::color_utils::{progress::create_batch_progress_bar, symbols};
use crate::config::RunConfig;
use crate::detection_obj::{Detection, DetectionCounts};
use crate::detector::Detector;
use crate::error::ImageFailure;
use crate::geo::{feature_collection, load_world_transform, plan_geo_output, project};
use crate::image_preprocessing::validate_and_preprocess;
use crate::output_manager::{OutputLayout, OutputManager};
use crate::progress::{ProgressRecord, ProgressSink, SummaryRecord};
use crate::vector_export::{write_vector_outputs, VectorOutputs};

/// Resources are reclaimed on the backend after every this many images
pub const RECLAIM_INTERVAL: usize = 5;

pub const MILESTONE_EXPORTING: &str = "Generating GeoJSON & outputs...";

/// Images to process and where their outputs go
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub images: Vec<PathBuf>,
    pub layout: OutputLayout,
}

impl BatchPlan {
    pub fn folder(root: &Path, images: Vec<PathBuf>) -> Self {
        Self {
            images,
            layout: OutputLayout::Folder {
                root: root.to_path_buf(),
            },
        }
    }

    pub fn files(images: Vec<PathBuf>, model_name: &str) -> Self {
        Self {
            images,
            layout: OutputLayout::per_image(model_name),
        }
    }

    fn is_files_mode(&self) -> bool {
        matches!(self.layout, OutputLayout::PerImage { .. })
    }
}

/// Lifecycle stage of one image. The failed end state is `ImageOutcome::Failed`,
/// which keeps the stage the image had reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Pending,
    Validating,
    Inferring,
    Exporting,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSuccess {
    pub counts: DetectionCounts,
    pub detections: usize,
    pub output_folder: PathBuf,
    pub vectors: VectorOutputs,
    pub preview: Option<PathBuf>,
}

#[derive(Debug)]
pub enum ImageOutcome {
    Succeeded(ImageSuccess),
    Failed {
        /// Stage the image was in when it failed
        state: ImageState,
        failure: ImageFailure,
    },
}

/// Batch-scoped counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchAggregator {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_abnormal: usize,
    pub total_normal: usize,
}

impl ImageSuccess {
    /// File names of every artifact written for the image
    fn artifact_names(&self) -> Vec<String> {
        [
            &self.vectors.geojson,
            &self.vectors.kml,
            &self.vectors.shapefile,
            &self.preview,
        ]
        .into_iter()
        .flatten()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .collect()
    }
}

impl BatchAggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: &ImageOutcome) {
        match outcome {
            ImageOutcome::Succeeded(success) => {
                self.successful += 1;
                self.total_abnormal += success.counts.abnormal;
                self.total_normal += success.counts.normal;
            }
            ImageOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn summary(&self) -> SummaryRecord {
        SummaryRecord {
            done: true,
            successful: self.successful,
            failed: self.failed,
            total: self.total,
            total_abnormal: self.total_abnormal,
            total_normal: self.total_normal,
        }
    }
}

/// Status text of a failure record
pub fn failure_status(failure: &ImageFailure, files_mode: bool) -> String {
    if !files_mode {
        return format!("Error: {failure}");
    }
    match failure {
        ImageFailure::NotAFile => "Error: not a file".to_string(),
        ImageFailure::InvalidImage { .. } => "Invalid image".to_string(),
        other => other.to_string(),
    }
}

fn display_name(path: &Path, files_mode: bool) -> String {
    if files_mode {
        path.to_string_lossy().to_string()
    } else {
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string())
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Per-image view of the batch used to build records
struct ImageContext<'a> {
    index: usize,
    path: &'a Path,
    plan: &'a BatchPlan,
    config: &'a RunConfig,
}

impl ImageContext<'_> {
    fn files_mode(&self) -> bool {
        self.plan.is_files_mode()
    }

    fn milestone(&self, status: String, aggregate: &BatchAggregator) -> ProgressRecord {
        ProgressRecord {
            processed: self.index,
            total: aggregate.total,
            current_file: display_name(self.path, true),
            status,
            abnormal_count: 0,
            normal_count: 0,
            successful: aggregate.successful,
            failed: aggregate.failed,
            output_folder: Some(None),
        }
    }

    fn final_record(&self, outcome: &ImageOutcome, aggregate: &BatchAggregator) -> ProgressRecord {
        let files_mode = self.files_mode();
        let (status, counts, folder) = match outcome {
            ImageOutcome::Succeeded(success) => (
                "OK".to_string(),
                success.counts,
                Some(absolute(&success.output_folder).to_string_lossy().to_string()),
            ),
            ImageOutcome::Failed { failure, .. } => (
                failure_status(failure, files_mode),
                DetectionCounts::default(),
                None,
            ),
        };

        ProgressRecord {
            processed: self.index + 1,
            total: aggregate.total,
            current_file: display_name(self.path, files_mode),
            status,
            abnormal_count: counts.abnormal,
            normal_count: counts.normal,
            successful: aggregate.successful,
            failed: aggregate.failed,
            output_folder: files_mode.then_some(folder),
        }
    }
}

fn emit_milestone<S: ProgressSink + ?Sized>(sink: &mut S, record: &ProgressRecord) {
    if let Err(e) = sink.progress(record) {
        log::warn!("{}Failed to emit milestone: {e:#}", symbols::warning());
    }
}

/// Write the vector outputs and preview for one image. Failures are logged per artifact.
fn export_artifacts(
    ctx: &ImageContext<'_>,
    names: &crate::detection_obj::ClassNames,
    detections: &[Detection],
    output_manager: &OutputManager<'_>,
) -> (VectorOutputs, Option<PathBuf>) {
    let toggles = &ctx.config.outputs;

    let vectors = match plan_geo_output(load_world_transform(ctx.path), detections) {
        Ok(world) => {
            let points = project(detections, &world, names);
            let collection = feature_collection(&points);
            let canonical = output_manager.canonical_vector_path();
            match write_vector_outputs(&collection, &canonical, toggles) {
                Ok(vectors) => vectors,
                Err(e) => {
                    log::warn!(
                        "  {} Failed to save GeoJSON: {e:#}",
                        symbols::operation_failed()
                    );
                    VectorOutputs::default()
                }
            }
        }
        Err(skip) => {
            log::info!("  {} {skip}", symbols::skipped());
            VectorOutputs::default()
        }
    };

    let preview = if toggles.save_annotated {
        let written = output_manager
            .preview_path()
            .map_err(anyhow::Error::from)
            .and_then(|path| {
                save_annotated_preview(ctx.path, detections, names, toggles, &path).map(|()| path)
            });
        match written {
            Ok(path) => {
                log::info!(
                    "  {} Annotated image saved: {}",
                    symbols::artifact_saved(),
                    path.file_name().unwrap_or_default().to_string_lossy()
                );
                Some(path)
            }
            Err(e) => {
                log::warn!(
                    "  {} Failed to save annotated image: {e:#}",
                    symbols::operation_failed()
                );
                None
            }
        }
    } else {
        None
    };

    (vectors, preview)
}

fn advance(state: &mut ImageState, next: ImageState) {
    log::trace!("  {state:?} -> {next:?}");
    *state = next;
}

fn process_image<D, S>(
    detector: &mut D,
    ctx: &ImageContext<'_>,
    aggregate: &BatchAggregator,
    sink: &mut S,
) -> ImageOutcome
where
    D: Detector + ?Sized,
    S: ProgressSink + ?Sized,
{
    let mut state = ImageState::Pending;
    let fail = |state: ImageState, failure: ImageFailure| ImageOutcome::Failed { state, failure };
    let files_mode = ctx.files_mode();
    let output_manager = OutputManager::new(&ctx.plan.layout, ctx.path);

    if files_mode && !ctx.path.is_file() {
        log::warn!(
            "  {} Not a file: {}",
            symbols::operation_failed(),
            ctx.path.display()
        );
        return fail(state, ImageFailure::NotAFile);
    }

    let output_folder = match output_manager.prepare_output_dir() {
        Ok(dir) => dir,
        Err(source) => {
            return fail(
                state,
                ImageFailure::OutputFolder {
                    path: output_manager.output_dir(),
                    source,
                },
            )
        }
    };

    advance(&mut state, ImageState::Validating);
    log::info!("  [1/4] Validating image...");
    let prepared = match validate_and_preprocess(ctx.path) {
        Ok(prepared) => prepared,
        Err(failure) => {
            log::warn!("  {} Invalid image: {failure}", symbols::operation_failed());
            return fail(state, failure);
        }
    };
    log::debug!(
        "  {}x{} pixels{}",
        prepared.record.width,
        prepared.record.height,
        if prepared.was_normalized() {
            " (normalized to 8-bit RGB)"
        } else {
            ""
        }
    );

    advance(&mut state, ImageState::Inferring);
    log::info!("  [2/4] Running inference...");
    let detections = {
        let prediction = detector.predict(prepared.inference_path(), &ctx.config.inference);
        let folded = prediction.and_then(|prediction| {
            prediction.flatten(|batch| {
                if files_mode {
                    log::info!("  [2/4] Inference batch {batch}...");
                    let record = ctx.milestone(format!("Inference batch {batch}..."), aggregate);
                    emit_milestone(sink, &record);
                }
            })
        });
        match folded {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!("  {} Inference failed: {e:#}", symbols::operation_failed());
                return fail(state, ImageFailure::Inference(e));
            }
        }
    };

    advance(&mut state, ImageState::Exporting);
    log::info!("  [3/4] Inference done. {MILESTONE_EXPORTING}");
    if files_mode {
        let record = ctx.milestone(MILESTONE_EXPORTING.to_string(), aggregate);
        emit_milestone(sink, &record);
    }

    let counts = DetectionCounts::from_detections(&detections);
    let (vectors, preview) = export_artifacts(ctx, detector.names(), &detections, &output_manager);

    // The normalized copy is removed here, before the image is reported
    drop(prepared);
    advance(&mut state, ImageState::Done);
    log::info!(
        "  [4/4] {} Detection: {} abnormal, {} normal",
        symbols::completed_successfully(),
        counts.abnormal,
        counts.normal
    );

    ImageOutcome::Succeeded(ImageSuccess {
        counts,
        detections: detections.len(),
        output_folder,
        vectors,
        preview,
    })
}

/// Process every image in order, emit one progress record per image and then
/// the summary record.
pub fn run_batch<D, S>(
    detector: &mut D,
    plan: &BatchPlan,
    config: &RunConfig,
    sink: &mut S,
) -> Result<SummaryRecord>
where
    D: Detector + ?Sized,
    S: ProgressSink + ?Sized,
{
    let total = plan.images.len();
    let mut aggregate = BatchAggregator::new(total);
    let pb = create_batch_progress_bar(total);

    log::info!(
        "Found {total} image file(s) to process on {}",
        detector.backend()
    );

    for (index, path) in plan.images.iter().enumerate() {
        let ctx = ImageContext {
            index,
            path,
            plan,
            config,
        };
        let name = display_name(path, false);
        pb.set_message(name.clone());
        log::info!(
            "{} Processing [{}/{}]: {}",
            symbols::image_start(),
            index + 1,
            total,
            name
        );

        let outcome = process_image(detector, &ctx, &aggregate, sink);
        aggregate.record(&outcome);
        match &outcome {
            ImageOutcome::Succeeded(success) => log::debug!(
                "  {} detection(s), wrote [{}] to {}",
                success.detections,
                success.artifact_names().join(", "),
                success.output_folder.display()
            ),
            ImageOutcome::Failed { state, failure } => log::warn!(
                "{} Error processing {} while {:?}: {failure}",
                symbols::operation_failed(),
                name,
                state
            ),
        }

        sink.progress(&ctx.final_record(&outcome, &aggregate))?;
        pb.inc(1);

        if (index + 1) % RECLAIM_INTERVAL == 0 {
            log::debug!("Reclaiming backend resources after {} images", index + 1);
            detector.reclaim();
        }
    }
    pb.finish_and_clear();

    let summary = aggregate.summary();
    sink.summary(&summary)?;

    if summary.failed == 0 {
        log::info!(
            "{} Processed {} image(s): {} abnormal, {} normal",
            symbols::completed_successfully(),
            summary.successful,
            summary.total_abnormal,
            summary.total_normal
        );
    } else if summary.successful > 0 {
        log::warn!(
            "{}{} of {} images failed to process",
            symbols::completed_partially_successfully(),
            summary.failed,
            summary.total
        );
    } else {
        log::error!(
            "{} All {} images failed to process",
            symbols::operation_failed(),
            summary.total
        );
    }

    Ok(summary)
}
