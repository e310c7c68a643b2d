//! facematch-core — face detection, recognition and matching.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings,
//! both running via ONNX Runtime for CPU inference. Matching is plain
//! Euclidean distance over the embeddings.

pub mod alignment;
pub mod annotate;
pub mod detector;
pub mod extractor;
pub mod matching;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use annotate::{annotate, Annotated, AnnotateError};
pub use detector::FaceDetector;
pub use extractor::{ExtractionError, Extractor, OnnxExtractor};
pub use matching::{Comparison, MatchError, WinnerSelection, DEFAULT_SAME_IDENTITY_THRESHOLD};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Detection, Embedding, Match, Metadata};

/// Default location of the ONNX model files: `$XDG_DATA_HOME/facematch/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("facematch").join("models")
}

/// `$XDG_DATA_HOME`, falling back to `~/.local/share`.
pub fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
}
