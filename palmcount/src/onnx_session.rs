use crate::color_utils::symbols;
use crate::config::DevicePreference;
use crate::detection_obj::ClassNames;
use crate::yolo_preprocessing::zero_input;
use anyhow::Result;
use log::Level;
use ndarray::{Array, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider},
    logging::LogLevel,
    session::{builder::GraphOptimizationLevel, RunOptions, Session},
    value::Value,
};
use std::path::{Path, PathBuf};

/// Side used for liveness passes on models with a dynamic input size
pub const LIVENESS_INPUT_SIZE: u32 = 640;

fn log_level_from_ort(level: LogLevel) -> Level {
    match level {
        LogLevel::Verbose => Level::Trace,
        LogLevel::Info => Level::Trace,
        LogLevel::Warning => Level::Debug,
        LogLevel::Error => Level::Info,
        LogLevel::Fatal => Level::Error,
    }
}

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // ONNX Runtime's info level is closer to our trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info => LogLevel::Error,
        Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

/// Compute backend a session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cpu,
    Gpu,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Cpu => f.write_str("cpu"),
            Backend::Gpu => f.write_str("cuda"),
        }
    }
}

/// Device selection result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub backend: Backend,
    pub reason: String,
}

/// Resolve the requested device against what the machine offers.
///
/// Never fails: a GPU request on a machine without CUDA degrades to CPU.
pub fn determine_optimal_device(
    requested: DevicePreference,
    gpu_available: bool,
) -> DeviceSelection {
    match (requested, gpu_available) {
        (DevicePreference::Cpu, _) => DeviceSelection {
            backend: Backend::Cpu,
            reason: "Using CPU (user selection)".to_string(),
        },
        (DevicePreference::Cuda, true) => DeviceSelection {
            backend: Backend::Gpu,
            reason: "Using CUDA (user selection)".to_string(),
        },
        (DevicePreference::Cuda, false) => DeviceSelection {
            backend: Backend::Cpu,
            reason: "CUDA requested but not available, using CPU".to_string(),
        },
        (DevicePreference::Auto, true) => DeviceSelection {
            backend: Backend::Gpu,
            reason: "CUDA provider available, using GPU".to_string(),
        },
        (DevicePreference::Auto, false) => DeviceSelection {
            backend: Backend::Cpu,
            reason: "CUDA provider not available, using CPU".to_string(),
        },
    }
}

/// Whether the CUDA execution provider is built in and loadable.
///
/// This does not prove a device exists; that is only known once a session
/// registers the provider, which is why GPU sessions get a liveness pass.
pub fn cuda_available() -> bool {
    match CUDAExecutionProvider::default().is_available() {
        Ok(available) => available,
        Err(e) => {
            log::debug!("Failed to query CUDA availability: {e}");
            false
        }
    }
}

/// Configuration for creating ONNX sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backend: Backend,
    /// When set, the optimized graph is serialized here while the session is built
    pub optimized_model_path: Option<PathBuf>,
}

impl SessionConfig {
    pub fn on(backend: Backend) -> Self {
        Self {
            backend,
            optimized_model_path: None,
        }
    }
}

/// Create an ONNX Runtime session for a model file
pub fn create_onnx_session(model_path: &Path, config: &SessionConfig) -> Result<Session> {
    let execution_providers = match config.backend {
        // Registration failures must surface so the caller can fall back to CPU
        Backend::Gpu => vec![CUDAExecutionProvider::default().build().error_on_failure()],
        Backend::Cpu => vec![CPUExecutionProvider::default().build()],
    };

    let ort_log_level = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ]
    .into_iter()
    .find(|&lvl| log::log_enabled!(lvl))
    .map(ort_level_from_log)
    .unwrap_or(LogLevel::Fatal);

    let mut builder = Session::builder()
        .map_err(|e| anyhow::anyhow!("Failed to create session builder: {}", e))?
        .with_logger(Box::new(|level, _, _, _, msg| {
            let log_level = log_level_from_ort(level);
            log::log!(log_level, "[onnx] {msg}")
        }))
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?
        .with_log_level(ort_log_level)
        .map_err(|e| anyhow::anyhow!("Failed to set log level: {}", e))?
        .with_execution_providers(execution_providers)
        .map_err(|e| anyhow::anyhow!("Failed to set execution providers: {}", e))?;

    if let Some(optimized_path) = &config.optimized_model_path {
        builder = builder
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(|e| anyhow::anyhow!("Failed to set optimization level: {}", e))?
            .with_optimized_model_path(optimized_path)
            .map_err(|e| anyhow::anyhow!("Failed to set optimized model path: {}", e))?;
    }

    let session = builder.commit_from_file(model_path).map_err(|e| {
        anyhow::anyhow!("Failed to load model {}: {}", model_path.display(), e)
    })?;

    log::debug!(
        "{} Session created on {} for {}",
        symbols::system_setup(),
        config.backend,
        model_path.display()
    );
    Ok(session)
}

/// Input binding of a detection model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInputSpec {
    pub name: String,
    /// Square side when the graph pins the spatial dimensions, `None` when dynamic
    pub fixed_size: Option<u32>,
}

impl ModelInputSpec {
    pub fn from_session(session: &Session) -> Result<Self> {
        let input_md = session
            .inputs
            .first()
            .ok_or_else(|| anyhow::anyhow!("Model has no inputs"))?;

        let fixed_size = match &input_md.input_type {
            ort::value::ValueType::Tensor { shape, .. } => {
                let dims = shape.to_vec();
                log::debug!("Input: {}, shape: {:?}", input_md.name, dims);
                fixed_side(&dims)
            }
            other => {
                return Err(anyhow::anyhow!(
                    "Unexpected input type for {}: {:?}",
                    input_md.name,
                    other
                ))
            }
        };

        Ok(Self {
            name: input_md.name.clone(),
            fixed_size,
        })
    }

    /// Side to use for a zero-tensor verification pass
    pub fn liveness_size(&self, dynamic_size: u32) -> u32 {
        self.fixed_size.unwrap_or(dynamic_size)
    }
}

/// Square side of an NCHW shape, `None` when either spatial dimension is symbolic
fn fixed_side(dims: &[i64]) -> Option<u32> {
    match dims {
        [_, _, h, w] if *h > 0 && *w > 0 => Some((*h).max(*w) as u32),
        _ => None,
    }
}

/// ONNX Runtime device string whose memory arena a run should shrink
pub fn arena_device(backend: Backend) -> &'static str {
    match backend {
        Backend::Cpu => "cpu:0",
        Backend::Gpu => "gpu:0",
    }
}

/// Run options that release unused arena memory on `backend` when the run ends
pub fn arena_shrink_options(backend: Backend) -> Result<RunOptions> {
    let mut options =
        RunOptions::new().map_err(|e| anyhow::anyhow!("Failed to create run options: {}", e))?;
    options
        .add_config_entry("memory.enable_memory_arena_shrinkage", arena_device(backend))
        .map_err(|e| anyhow::anyhow!("Failed to enable arena shrinkage: {}", e))?;
    Ok(options)
}

/// Run one forward pass and return the first output as an owned array.
///
/// With `options`, the run uses them (for example to shrink the memory arena).
pub fn run_model(
    session: &mut Session,
    input_name: &str,
    input: Array<f32, IxDyn>,
    options: Option<&RunOptions>,
) -> Result<Array<f32, IxDyn>> {
    let output_name = session
        .outputs
        .first()
        .map(|output| output.name.clone())
        .ok_or_else(|| anyhow::anyhow!("Model has no outputs"))?;

    let input_value = Value::from_array(input)
        .map_err(|e| anyhow::anyhow!("Failed to create input value: {}", e))?;
    let inputs = ort::inputs![input_name => &input_value];

    match options {
        Some(options) => {
            let outputs = session
                .run_with_options(inputs, options)
                .map_err(|e| anyhow::anyhow!("Failed to run inference: {}", e))?;
            let output_view = outputs[output_name.as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| anyhow::anyhow!("Failed to extract output array: {}", e))?;
            Ok(output_view.to_owned())
        }
        None => {
            let outputs = session
                .run(inputs)
                .map_err(|e| anyhow::anyhow!("Failed to run inference: {}", e))?;
            let output_view = outputs[output_name.as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| anyhow::anyhow!("Failed to extract output array: {}", e))?;
            Ok(output_view.to_owned())
        }
    }
}

/// Zero-tensor forward pass proving the session can execute
pub fn verify_forward_pass(
    session: &mut Session,
    spec: &ModelInputSpec,
    size: u32,
) -> Result<()> {
    let size = spec.liveness_size(size);
    let output = run_model(session, &spec.name, zero_input(size), None)?;
    log::debug!(
        "Verification pass at {size}x{size} produced output {:?}",
        output.shape()
    );
    Ok(())
}

/// Class-name table from the model's `names` metadata, defaulting to abnormal/normal
pub fn class_names_from_session(session: &Session) -> ClassNames {
    let raw = session
        .metadata()
        .ok()
        .and_then(|metadata| metadata.custom("names").ok().flatten());

    match raw.as_deref().and_then(ClassNames::parse_metadata) {
        Some(names) => names,
        None => {
            log::debug!("Model has no usable `names` metadata, using default class table");
            ClassNames::default_palm()
        }
    }
}

/// Load with `load_gpu` when the GPU is preferred, falling back to `load_cpu`
/// when that fails. CPU preference goes straight to `load_cpu`.
pub fn load_preferring_gpu<S>(
    preferred: Backend,
    load_gpu: impl FnOnce() -> Result<S>,
    load_cpu: impl FnOnce() -> Result<S>,
) -> Result<(S, Backend)> {
    if preferred == Backend::Gpu {
        match load_gpu() {
            Ok(loaded) => return Ok((loaded, Backend::Gpu)),
            Err(e) => {
                log::warn!(
                    "{}CUDA error, falling back to CPU: {e:#}",
                    symbols::warning()
                );
            }
        }
    }
    Ok((load_cpu()?, Backend::Cpu))
}

/// Load a model on the selected backend.
///
/// GPU sessions are checked with a zero-tensor pass; if building or running the
/// GPU session fails, the model is reloaded on CPU.
pub fn load_with_fallback(
    model_path: &Path,
    selection: &DeviceSelection,
) -> Result<(Session, Backend)> {
    let (session, backend) = load_preferring_gpu(
        selection.backend,
        || {
            let mut session = create_onnx_session(model_path, &SessionConfig::on(Backend::Gpu))?;
            let spec = ModelInputSpec::from_session(&session)?;
            verify_forward_pass(&mut session, &spec, LIVENESS_INPUT_SIZE)?;
            Ok(session)
        },
        || create_onnx_session(model_path, &SessionConfig::on(Backend::Cpu)),
    )?;

    match backend {
        Backend::Gpu => log::info!("{} Model loaded on GPU successfully", symbols::model_loaded()),
        Backend::Cpu => log::info!("{} Model loaded on CPU", symbols::model_loaded()),
    }
    Ok((session, backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_preference_always_selects_cpu() {
        for gpu in [true, false] {
            let selection = determine_optimal_device(DevicePreference::Cpu, gpu);
            assert_eq!(selection.backend, Backend::Cpu);
        }
    }

    #[test]
    fn test_gpu_preference_without_gpu_degrades_to_cpu() {
        let selection = determine_optimal_device(DevicePreference::Cuda, false);
        assert_eq!(selection.backend, Backend::Cpu);
        assert!(selection.reason.contains("not available"));

        let selection = determine_optimal_device(DevicePreference::Cuda, true);
        assert_eq!(selection.backend, Backend::Gpu);
    }

    #[test]
    fn test_auto_prefers_gpu() {
        assert_eq!(
            determine_optimal_device(DevicePreference::Auto, true).backend,
            Backend::Gpu
        );
        assert_eq!(
            determine_optimal_device(DevicePreference::Auto, false).backend,
            Backend::Cpu
        );
    }

    #[test]
    fn test_fixed_side() {
        assert_eq!(fixed_side(&[1, 3, 640, 640]), Some(640));
        assert_eq!(fixed_side(&[1, 3, -1, -1]), None);
        assert_eq!(fixed_side(&[-1, 3, 1024, 1024]), Some(1024));
        assert_eq!(fixed_side(&[1, 3]), None);
    }

    #[test]
    fn test_liveness_size_prefers_fixed_input() {
        let fixed = ModelInputSpec {
            name: "images".to_string(),
            fixed_size: Some(1024),
        };
        assert_eq!(fixed.liveness_size(640), 1024);

        let dynamic = ModelInputSpec {
            name: "images".to_string(),
            fixed_size: None,
        };
        assert_eq!(dynamic.liveness_size(640), 640);
    }

    #[test]
    fn test_auto_reason_names_the_provider() {
        let selection = determine_optimal_device(DevicePreference::Auto, true);
        assert!(selection.reason.contains("provider"));
    }

    #[test]
    fn test_failed_gpu_load_falls_back_to_cpu() {
        let cpu_loads = std::cell::Cell::new(0);
        let (loaded, backend) = load_preferring_gpu(
            Backend::Gpu,
            || Err::<&str, _>(anyhow::anyhow!("liveness pass failed")),
            || {
                cpu_loads.set(cpu_loads.get() + 1);
                Ok("cpu session")
            },
        )
        .unwrap();
        assert_eq!(backend, Backend::Cpu);
        assert_eq!(loaded, "cpu session");
        assert_eq!(cpu_loads.get(), 1);
    }

    #[test]
    fn test_healthy_gpu_load_skips_cpu() {
        let (loaded, backend) = load_preferring_gpu(
            Backend::Gpu,
            || Ok("gpu session"),
            || -> Result<&str> { panic!("CPU must not be loaded") },
        )
        .unwrap();
        assert_eq!((loaded, backend), ("gpu session", Backend::Gpu));
    }

    #[test]
    fn test_cpu_preference_never_tries_gpu() {
        let (_, backend) = load_preferring_gpu(
            Backend::Cpu,
            || -> Result<()> { panic!("GPU must not be loaded") },
            || Ok(()),
        )
        .unwrap();
        assert_eq!(backend, Backend::Cpu);
    }

    #[test]
    fn test_cpu_load_failure_is_fatal() {
        let result = load_preferring_gpu(
            Backend::Gpu,
            || Err::<(), _>(anyhow::anyhow!("no device")),
            || Err(anyhow::anyhow!("corrupt model")),
        );
        assert!(format!("{:#}", result.unwrap_err()).contains("corrupt model"));
    }

    #[test]
    fn test_arena_device_follows_backend() {
        assert_eq!(arena_device(Backend::Cpu), "cpu:0");
        assert_eq!(arena_device(Backend::Gpu), "gpu:0");
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(Backend::Cpu.to_string(), "cpu");
        assert_eq!(Backend::Gpu.to_string(), "cuda");
    }
}
