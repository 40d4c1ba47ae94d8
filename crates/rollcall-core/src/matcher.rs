//! Match a captured frame against the known-face index.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::index::KnownFaceIndex;
use crate::types::{Embedding, Matcher};
use image::RgbImage;

/// Outcome of one recognition attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    /// A detected face matched a known face.
    Matched { name: String, score: f32 },
    /// Faces were detected but none matched.
    NoMatch { faces: usize },
    /// The frame contained no detectable face.
    NoFace,
}

impl Recognition {
    pub fn name(&self) -> Option<&str> {
        match self {
            Recognition::Matched { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// First-match face lookup using a pairwise [`Matcher`] decision.
pub struct FaceMatcher {
    matcher: Box<dyn Matcher + Send>,
}

impl FaceMatcher {
    pub fn new(matcher: impl Matcher + Send + 'static) -> Self {
        Self {
            matcher: Box::new(matcher),
        }
    }

    /// Encode `frame` and match its faces against `index`.
    pub fn recognize<E: FaceEncoder + ?Sized>(
        &self,
        encoder: &mut E,
        frame: &RgbImage,
        index: &KnownFaceIndex,
    ) -> Result<Recognition, EncoderError> {
        let probes = encoder.encode(frame)?;
        Ok(self.match_embeddings(&probes, index))
    }

    /// Scan probes in detection order and known faces in index order,
    /// returning the first accepted pair.
    pub fn match_embeddings(&self, probes: &[Embedding], index: &KnownFaceIndex) -> Recognition {
        if probes.is_empty() {
            return Recognition::NoFace;
        }

        for probe in probes {
            for known in index.faces() {
                if self.matcher.is_match(&known.embedding, probe) {
                    return Recognition::Matched {
                        name: known.name.clone(),
                        score: self.matcher.score(&known.embedding, probe),
                    };
                }
            }
        }

        Recognition::NoMatch {
            faces: probes.len(),
        }
    }
}
