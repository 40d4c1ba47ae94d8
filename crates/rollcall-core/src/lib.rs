//! rollcall-core: face-recognition attendance tracking.
//!
//! Builds a known-face index from a directory of labelled images, matches
//! captured frames against it (SCRFD + ArcFace via ONNX Runtime), and keeps
//! an append-only CSV attendance ledger with backup/restore helpers.

pub mod alignment;
pub mod backup;
pub mod credentials;
pub mod detector;
pub mod encoder;
pub mod index;
pub mod ledger;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use backup::{BackupEntry, BackupError, BackupStore, Summary};
pub use encoder::{EncoderError, FaceEncoder, OnnxFaceEncoder};
pub use index::{IndexCache, IndexError, IndexPolicy, KnownFace, KnownFaceIndex};
pub use ledger::{AttendanceRecord, Ledger, LedgerError, MarkOutcome, Status};
pub use matcher::{FaceMatcher, Recognition};
pub use types::{BoundingBox, CosineMatcher, Embedding, EuclideanMatcher, Matcher};

use std::path::PathBuf;

/// Default directory searched for the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::encoder::{EncoderError, FaceEncoder};
    use crate::types::Embedding;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    /// Deterministic encoder: the top-left pixel is the "face".
    ///
    /// A black pixel means no face; any other colour becomes a 3-d
    /// embedding. A second face is reported when the top-right pixel
    /// differs from the top-left one and is not black.
    pub struct PixelEncoder;

    impl FaceEncoder for PixelEncoder {
        fn encode(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, EncoderError> {
            let first = image.get_pixel(0, 0).0;
            let second = image.get_pixel(image.width() - 1, 0).0;
            let mut pixels = vec![first];
            if second != first {
                pixels.push(second);
            }
            Ok(pixels
                .into_iter()
                .filter(|p| *p != [0, 0, 0])
                .map(|p| Embedding::new(p.iter().map(|&v| v as f32).collect()))
                .collect())
        }
    }

    pub fn solid(color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(4, 4, Rgb(color))
    }

    pub fn two_faces(first: [u8; 3], second: [u8; 3]) -> RgbImage {
        let mut img = RgbImage::from_pixel(4, 4, Rgb(first));
        img.put_pixel(3, 0, Rgb(second));
        img
    }

    /// Write a lossless face image; the format always comes from content.
    pub fn write_face(path: &Path, color: [u8; 3]) {
        solid(color)
            .save_with_format(path, image::ImageFormat::Png)
            .unwrap();
    }
}
