//! Face encoding capability: image in, (box, template) pairs out.

use std::path::{Path, PathBuf};

use image::RgbImage;
use parking_lot::Mutex;
use thiserror::Error;

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Detects every face in an image and encodes each into a template.
///
/// Results are ordered by detector confidence, highest first.
pub trait FaceEncoder: Send + Sync {
    fn encode(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, EncoderError>;
}

/// SCRFD + ArcFace. Sessions need `&mut`, so each sits behind a mutex.
pub struct OnnxFaceEncoder {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxFaceEncoder {
    pub fn load(model_dir: &Path) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, EncoderError> {
        let boxes = self.detector.lock().detect(image)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut recognizer = self.recognizer.lock();
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            match recognizer.extract(image, &bbox) {
                Ok(template) => faces.push(DetectedFace { bbox, template }),
                // Boxes clipped entirely off-frame carry no face to encode.
                Err(RecognizerError::EmptyCrop) => {
                    tracing::debug!(?bbox, "skipping face box outside the image");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(faces)
    }
}

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("rollcall/models")
}
