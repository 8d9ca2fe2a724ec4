//! Typed failures for the recoverable and configuration error paths.
//!
//! Fatal process-level failures travel as `anyhow::Error`; the types here are the
//! ones the batch loop inspects to build status strings.

use std::path::PathBuf;

/// Why one image could not be processed.
///
/// Every variant is recoverable at batch scope: the orchestrator converts it
/// into a failure progress record and moves on to the next image.
#[derive(Debug, thiserror::Error)]
pub enum ImageFailure {
    #[error("not a file")]
    NotAFile,

    #[error("invalid image {}: {reason}", path.display())]
    InvalidImage { path: PathBuf, reason: String },

    #[error("could not prepare output folder {}: {source}", path.display())]
    OutputFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
}

/// Problems with the configuration or file-list JSON handed to the worker.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config JSON must be an object")]
    NotAnObject,

    #[error("option `{key}` has an invalid value `{value}`: {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("files JSON must be a non-empty array of .tif paths")]
    EmptyFileList,

    #[error("no .tif/.tiff paths in files JSON")]
    NoTiffPaths,
}
