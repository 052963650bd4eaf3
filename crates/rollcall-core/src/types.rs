use serde::{Deserialize, Serialize};
use std::fmt;

/// Label reported for a face that matched no reference encoding.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Face region in frame pixel coordinates, in (top, right, bottom, left) order
/// as emitted by the upstream detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Fixed-length face feature vector (128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Processes every dimension; a zero-norm vector yields 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
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

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found in a frame by the external detector. Lives for a single
/// frame's processing only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub encoding: Embedding,
}

/// Outcome of resolving a single face.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Unknown,
    Known(String),
}

impl Identity {
    /// The label, or `None` for an unrecognized face.
    pub fn label(&self) -> Option<&str> {
        match self {
            Identity::Unknown => None,
            Identity::Known(label) => Some(label),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Unknown => f.write_str(UNKNOWN_LABEL),
            Identity::Known(label) => f.write_str(label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_deserializes_from_plain_array() {
        let e: Embedding = serde_json::from_str("[0.5, -0.25]").unwrap();
        assert_eq!(e.values, vec![0.5, -0.25]);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::Unknown.to_string(), "Unknown");
        assert_eq!(Identity::Known("Alice".into()).to_string(), "Alice");
        assert_eq!(Identity::Known("Alice".into()).label(), Some("Alice"));
        assert_eq!(Identity::Unknown.label(), None);
    }

    #[test]
    fn test_bbox_dimensions() {
        let b = BoundingBox { top: 10, right: 60, bottom: 90, left: 20 };
        assert_eq!(b.width(), 40);
        assert_eq!(b.height(), 80);
    }
}
