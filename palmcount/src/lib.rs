pub mod annotate;
pub mod color_utils;
pub mod config;
pub mod convert;
pub mod detection_obj;
pub mod detector;
pub mod error;
pub mod geo;
pub mod image_input;
pub mod image_preprocessing;
pub mod model_processing;
pub mod onnx_session;
pub mod output_manager;
pub mod progress;
pub mod vector_export;
pub mod worker;
pub mod yolo_postprocessing;
pub mod yolo_preprocessing;
