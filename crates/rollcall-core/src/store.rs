//! Reference encoding gallery, loaded once at startup.
//!
//! The on-disk artifact is JSON with two parallel arrays:
//! `{"names": ["Alice", ...], "encodings": [[0.1, ...], ...]}`.
//! Entry order is preserved and defines the resolver's tie-break order.

use crate::types::Embedding;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("encodings file not found: {0}")]
    NotFound(String),
    #[error("failed to read encodings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed encodings file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("encodings file has {names} names but {encodings} encodings")]
    LengthMismatch { names: usize, encodings: usize },
    #[error("encodings file contains no reference encodings")]
    Empty,
    #[error("reference encoding {index} has an empty label")]
    EmptyLabel { index: usize },
    #[error("reference encoding {index} label {label:?} has surrounding whitespace")]
    PaddedLabel { index: usize, label: String },
    #[error("reference encoding {index} is empty")]
    EmptyVector { index: usize },
    #[error("reference encoding {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("reference encoding {index} contains a non-finite value")]
    NonFinite { index: usize },
}

#[derive(Deserialize)]
struct EncodingsFile {
    names: Vec<String>,
    encodings: Vec<Vec<f32>>,
}

/// One labelled reference encoding. Several may share a label.
#[derive(Debug, Clone)]
pub struct ReferenceEncoding {
    pub label: String,
    pub embedding: Embedding,
}

/// Immutable gallery of reference encodings.
#[derive(Debug, Clone)]
pub struct EncodingStore {
    references: Vec<ReferenceEncoding>,
    dimension: usize,
}

impl EncodingStore {
    /// Load and validate the encodings artifact at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }

        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let store = Self::from_json(&raw)?;

        tracing::info!(
            path = %path.display(),
            references = store.len(),
            identities = store.identity_count(),
            dimension = store.dimension,
            "loaded encodings"
        );

        Ok(store)
    }

    /// Parse an encodings artifact from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        let file: EncodingsFile = serde_json::from_str(raw)?;
        if file.names.len() != file.encodings.len() {
            return Err(StoreError::LengthMismatch {
                names: file.names.len(),
                encodings: file.encodings.len(),
            });
        }

        Self::from_references(
            file.names
                .into_iter()
                .zip(file.encodings)
                .map(|(label, values)| ReferenceEncoding {
                    label,
                    embedding: Embedding::new(values),
                })
                .collect(),
        )
    }

    /// Build a store from already-paired references, preserving their order.
    pub fn from_references(references: Vec<ReferenceEncoding>) -> Result<Self, StoreError> {
        let first = references.first().ok_or(StoreError::Empty)?;
        let dimension = first.embedding.dimension();

        for (index, r) in references.iter().enumerate() {
            if r.label.trim().is_empty() {
                return Err(StoreError::EmptyLabel { index });
            }
            // Token text is compared trimmed, so a padded label could never verify.
            if r.label.trim() != r.label {
                return Err(StoreError::PaddedLabel {
                    index,
                    label: r.label.clone(),
                });
            }
            let actual = r.embedding.dimension();
            if actual == 0 {
                return Err(StoreError::EmptyVector { index });
            }
            if actual != dimension {
                return Err(StoreError::DimensionMismatch {
                    index,
                    expected: dimension,
                    actual,
                });
            }
            if r.embedding.values.iter().any(|v| !v.is_finite()) {
                return Err(StoreError::NonFinite { index });
            }
        }

        Ok(Self {
            references,
            dimension,
        })
    }

    pub fn references(&self) -> &[ReferenceEncoding] {
        &self.references
    }

    pub fn get(&self, index: usize) -> Option<&ReferenceEncoding> {
        self.references.get(index)
    }

    /// Feature vector length shared by every reference.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Distinct labels with their reference counts, in first-seen order.
    pub fn labels(&self) -> Vec<(&str, usize)> {
        let mut out: Vec<(&str, usize)> = Vec::new();
        for r in &self.references {
            match out.iter_mut().find(|(label, _)| *label == r.label) {
                Some((_, count)) => *count += 1,
                None => out.push((&r.label, 1)),
            }
        }
        out
    }

    pub fn identity_count(&self) -> usize {
        self.labels().len()
    }
}
