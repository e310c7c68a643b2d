//! Image bytes → detected faces with embeddings.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

impl ExtractionError {
    /// Whether the failure is the caller's input (bad image, no face) rather
    /// than a fault in the models.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::NoFaceDetected | Self::Detector(DetectorError::EmptyImage)
        )
    }
}

/// Converts an encoded image into zero or more face detections.
///
/// Zero faces above `min_confidence` is `Ok(vec![])`, not an error. The order
/// of the returned detections carries no meaning.
pub trait Extractor: Send {
    fn extract(&mut self, image: &[u8], min_confidence: f32) -> Result<Vec<Detection>, ExtractionError>;
}

/// Decode any supported image format into RGB8.
pub fn decode_rgb(image: &[u8]) -> Result<RgbImage, ExtractionError> {
    Ok(image::load_from_memory(image)?.to_rgb8())
}

/// SCRFD + ArcFace pipeline.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    /// Load both models; fails fast if either file is missing.
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, ExtractionError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self::new(detector, recognizer))
    }
}

impl Extractor for OnnxExtractor {
    fn extract(&mut self, image: &[u8], min_confidence: f32) -> Result<Vec<Detection>, ExtractionError> {
        let rgb = decode_rgb(image)?;
        let faces = self.detector.detect(&rgb, min_confidence)?;

        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            let embedding = self.recognizer.extract(&rgb, &bbox)?;
            detections.push(Detection { bbox, embedding });
        }

        tracing::debug!(
            width = rgb.width(),
            height = rgb.height(),
            faces = detections.len(),
            "extracted face embeddings"
        );
        Ok(detections)
    }
}
