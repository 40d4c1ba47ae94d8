//! The face-encoding seam: image in, one embedding per detected face out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Produces face embeddings for every face found in an image.
///
/// Embeddings come back in detection order (most confident face first).
/// An image with no faces yields an empty vector, not an error.
pub trait FaceEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, EncoderError>;
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, EncoderError> {
        (**self).encode(image)
    }
}

/// SCRFD detection followed by ArcFace embedding of each face.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEncoder {
    pub const SCRFD_MODEL_FILE: &'static str = "det_10g.onnx";
    pub const ARCFACE_MODEL_FILE: &'static str = "w600k_r50.onnx";

    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }

    /// Load both models from their conventional file names in `model_dir`.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self, EncoderError> {
        Self::load(
            &model_dir.join(Self::SCRFD_MODEL_FILE).to_string_lossy(),
            &model_dir.join(Self::ARCFACE_MODEL_FILE).to_string_lossy(),
        )
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, EncoderError> {
        let faces = self.detector.detect(image)?;
        tracing::debug!(faces = faces.len(), "detected faces");

        let mut embeddings = Vec::with_capacity(faces.len());
        for face in faces.iter().filter(|f| f.landmarks.is_some()) {
            embeddings.push(self.recognizer.extract(image, face)?);
        }
        Ok(embeddings)
    }
}
