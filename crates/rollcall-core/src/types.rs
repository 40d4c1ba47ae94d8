use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let inter_h =
            ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Embeddings of different dimension are unrelated: 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between two embeddings; infinite when the
    /// dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Pairwise match decision between a known face and a probe.
///
/// Implementations wrap one distance measure and one fixed threshold, so a
/// decision is a plain boolean and never depends on the rest of the gallery.
pub trait Matcher {
    /// Raw score for the pair, in the matcher's own unit.
    fn score(&self, known: &Embedding, probe: &Embedding) -> f32;

    /// Whether the pair counts as the same person.
    fn is_match(&self, known: &Embedding, probe: &Embedding) -> bool;
}

/// Accepts pairs whose cosine similarity reaches `min_similarity`.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub min_similarity: f32,
}

impl CosineMatcher {
    /// Default acceptance threshold for L2-normalized ArcFace embeddings.
    pub const DEFAULT_THRESHOLD: f32 = 0.40;
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            min_similarity: Self::DEFAULT_THRESHOLD,
        }
    }
}

impl Matcher for CosineMatcher {
    fn score(&self, known: &Embedding, probe: &Embedding) -> f32 {
        known.similarity(probe)
    }

    fn is_match(&self, known: &Embedding, probe: &Embedding) -> bool {
        self.score(known, probe) >= self.min_similarity
    }
}

/// Accepts pairs whose Euclidean distance is at most `max_distance`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub max_distance: f32,
}

impl EuclideanMatcher {
    /// Conventional tolerance for 128-d dlib-style encodings.
    pub const DEFAULT_TOLERANCE: f32 = 0.6;
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            max_distance: Self::DEFAULT_TOLERANCE,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn score(&self, known: &Embedding, probe: &Embedding) -> f32 {
        known.euclidean_distance(probe)
    }

    fn is_match(&self, known: &Embedding, probe: &Embedding) -> bool {
        self.score(known, probe) <= self.max_distance
    }
}
