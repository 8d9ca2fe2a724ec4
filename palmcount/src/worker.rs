//! Entry points of the two inference modes.
//!
//! Both resolve their inputs and the device, load the detector once and hand
//! the batch to [`run_batch`]. Anything that fails before the batch starts is
//! fatal and returned as an error.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::color_utils::symbols;
use crate::config::RunConfig;
use crate::convert::ensure_model_exists;
use crate::detector::OnnxDetector;
use crate::image_input::{find_tiffs_in_directory, parse_file_list};
use crate::model_processing::{run_batch, BatchPlan};
use crate::onnx_session::{cuda_available, determine_optimal_device, DeviceSelection};
use crate::progress::JsonLineReporter;

/// `--infer <folder> <model_path> <config_json>`; returns the process exit code
pub fn run_infer_folder(folder: &Path, model_path: &Path, config_json: &str) -> Result<i32> {
    let config = RunConfig::from_json(config_json).context("Invalid config JSON")?;
    ensure_model_exists(model_path)?;

    if !folder.is_dir() {
        bail!("Not a directory: {}", folder.display());
    }
    let images = find_tiffs_in_directory(folder)?;
    if images.is_empty() {
        bail!("No .tif/.tiff images found in {}", folder.display());
    }

    let plan = BatchPlan::folder(folder, images);
    execute(plan, model_path, &config)
}

/// `--infer-files <files_json> <model_path> <model_name> <config_json>`
pub fn run_infer_files(
    files_json: &str,
    model_path: &Path,
    model_name: &str,
    config_json: &str,
) -> Result<i32> {
    let config = RunConfig::from_json(config_json).context("Invalid config JSON")?;
    let images = parse_file_list(files_json).context("Invalid file list")?;
    ensure_model_exists(model_path)?;

    let plan = BatchPlan::files(images, model_name);
    execute(plan, model_path, &config)
}

fn select_device(config: &RunConfig) -> DeviceSelection {
    let selection = determine_optimal_device(config.device, cuda_available());
    log::info!(
        "{} Device: {} ({})",
        symbols::system_setup(),
        selection.backend,
        selection.reason
    );
    selection
}

fn execute(plan: BatchPlan, model_path: &Path, config: &RunConfig) -> Result<i32> {
    log::info!(
        "{} imgsz: {} | conf: {} | IoU: {} | max_det: {}",
        symbols::system_setup(),
        config.inference.imgsz,
        config.inference.confidence,
        config.inference.iou_threshold,
        config.inference.max_det
    );

    let selection = select_device(config);
    let mut detector = OnnxDetector::load(model_path, &selection)
        .with_context(|| format!("Failed to load model {}", model_path.display()))?;

    let mut reporter = JsonLineReporter::stdout();
    let summary = run_batch(&mut detector, &plan, config, &mut reporter)?;
    Ok(summary.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bad_config_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let err = run_infer_folder(temp_dir.path(), &temp_dir.path().join("m.onnx"), "{oops")
            .unwrap_err();
        assert!(format!("{err:#}").contains("Invalid config JSON"));
    }

    #[test]
    fn test_missing_model_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let err = run_infer_folder(temp_dir.path(), &temp_dir.path().join("m.onnx"), "{}")
            .unwrap_err();
        assert!(err.to_string().contains("Model file not found"));
    }

    #[test]
    fn test_empty_folder_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let model = temp_dir.path().join("m.onnx");
        std::fs::write(&model, b"not a model").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();

        let err = run_infer_folder(temp_dir.path(), &model, "{}").unwrap_err();
        assert!(err.to_string().contains("No .tif/.tiff images"));
    }

    #[test]
    fn test_file_list_without_tiffs_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let model = temp_dir.path().join("m.onnx");
        std::fs::write(&model, b"not a model").unwrap();

        let err = run_infer_files(r#"["a.png", "b.jpg"]"#, &model, "palm", "{}").unwrap_err();
        assert!(format!("{err:#}").contains("Invalid file list"));
    }
}
