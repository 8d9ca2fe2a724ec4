//! Convert mode: build a GPU session once and serialize its optimized graph.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;
use crate::onnx_session::{
    create_onnx_session, cuda_available, verify_forward_pass, Backend, ModelInputSpec,
    SessionConfig, LIVENESS_INPUT_SIZE,
};

/// Arguments of `--convert`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRequest {
    pub model_in: PathBuf,
    pub model_out: PathBuf,
    pub inference_size: u32,
}

impl ConvertRequest {
    /// Build from the raw CLI values: `model_in model_out [inference_size]`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let (model_in, model_out, size) = match values {
            [model_in, model_out] => (model_in, model_out, None),
            [model_in, model_out, size] => (model_in, model_out, Some(size)),
            _ => bail!("--convert expects <model_in> <model_out> [inference_size]"),
        };

        let inference_size = match size {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|size| *size > 0)
                .with_context(|| format!("Invalid inference size: {raw}"))?,
            None => LIVENESS_INPUT_SIZE,
        };

        Ok(Self {
            model_in: PathBuf::from(model_in),
            model_out: PathBuf::from(model_out),
            inference_size,
        })
    }

    /// Side of the verification pass on dynamic-input models
    pub fn verification_size(&self) -> u32 {
        self.inference_size.min(LIVENESS_INPUT_SIZE)
    }
}

/// Load `model_in` on the GPU, verify it, and write the optimized graph to `model_out`
pub fn run_convert(request: &ConvertRequest) -> Result<()> {
    if !cuda_available() {
        bail!("CUDA is not available; conversion requires a GPU");
    }
    ensure_model_exists(&request.model_in)?;

    if let Some(parent) = request
        .model_out
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    log::info!(
        "{} Converting {} (inference size {})",
        symbols::system_setup(),
        request.model_in.display(),
        request.inference_size
    );

    let config = SessionConfig {
        backend: Backend::Gpu,
        optimized_model_path: Some(request.model_out.clone()),
    };
    let mut session = create_onnx_session(&request.model_in, &config)?;
    let spec = ModelInputSpec::from_session(&session)?;
    verify_forward_pass(&mut session, &spec, request.verification_size())
        .context("Converted model failed its verification pass")?;

    let size = std::fs::metadata(&request.model_out)
        .with_context(|| {
            format!(
                "Optimized model was not written to {}",
                request.model_out.display()
            )
        })?
        .len();
    log::info!(
        "{} Optimized model saved: {} ({:.1} MB)",
        symbols::artifact_saved(),
        request.model_out.display(),
        size as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

pub(crate) fn ensure_model_exists(model_path: &Path) -> Result<()> {
    if !model_path.is_file() {
        bail!("Model file not found: {}", model_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_inference_size_defaults_to_640() {
        let request = ConvertRequest::from_args(&args(&["in.onnx", "out.onnx"])).unwrap();
        assert_eq!(request.inference_size, 640);
        assert_eq!(request.model_out, PathBuf::from("out.onnx"));
    }

    #[test]
    fn test_verification_size_is_capped() {
        let request =
            ConvertRequest::from_args(&args(&["in.onnx", "out.onnx", "12800"])).unwrap();
        assert_eq!(request.inference_size, 12800);
        assert_eq!(request.verification_size(), 640);

        let request = ConvertRequest::from_args(&args(&["in.onnx", "out.onnx", "320"])).unwrap();
        assert_eq!(request.verification_size(), 320);
    }

    #[test]
    fn test_invalid_inference_size_is_rejected() {
        assert!(ConvertRequest::from_args(&args(&["in.onnx", "out.onnx", "big"])).is_err());
        assert!(ConvertRequest::from_args(&args(&["in.onnx", "out.onnx", "0"])).is_err());
        assert!(ConvertRequest::from_args(&args(&["in.onnx"])).is_err());
    }

    #[test]
    fn test_missing_model_is_reported() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let err = ensure_model_exists(&temp_dir.path().join("absent.onnx")).unwrap_err();
        assert!(err.to_string().contains("Model file not found"));
    }
}
