//! Embedding vectors and the similarity functions defined over them.
//!
//! Vectors are stored as `f32` (the width embedders emit) and every derived
//! quantity is accumulated in `f64`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Model version ───────────────────────────────────────────────────────────

/// Tag identifying the model that produced a vector. Vectors carrying
/// different tags are not directly comparable.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ModelVersion(String);

impl ModelVersion {
  pub fn new(tag: impl Into<String>) -> Self { Self(tag.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ModelVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ─── Embedding ───────────────────────────────────────────────────────────────

/// A fixed-dimensionality vector together with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
  pub values:        Vec<f32>,
  pub model_version: ModelVersion,
}

impl Embedding {
  pub fn new(values: Vec<f32>, model_version: ModelVersion) -> Self {
    Self { values, model_version }
  }

  pub fn dimension(&self) -> usize { self.values.len() }

  /// Check that `other` can be compared with `self`.
  ///
  /// Length mismatches always fail. A model-version mismatch fails in strict
  /// mode and otherwise returns `Ok(true)` so the caller can report it.
  pub fn comparable_with(&self, other: &Embedding, strict: bool) -> Result<bool> {
    if self.dimension() != other.dimension() {
      return Err(Error::DimensionMismatch {
        expected: self.dimension(),
        found:    other.dimension(),
      });
    }
    if self.model_version == other.model_version {
      return Ok(false);
    }
    if strict {
      return Err(Error::ModelVersionMismatch {
        expected: self.model_version.clone(),
        found:    other.model_version.clone(),
      });
    }
    Ok(true)
  }
}

// ─── Metric ──────────────────────────────────────────────────────────────────

/// Similarity metrics supported by the index. Every score is monotonically
/// decreasing in dissimilarity.
///
/// The index stores unit-normalised vectors, so all three metrics rank
/// candidates identically; only the scale of the score differs. Names
/// deserialise case-insensitively through [`FromStr`].
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum SimilarityMetric {
  #[default]
  Cosine,
  /// `1 / (1 + ‖a − b‖)`, so identical vectors score 1. On unit vectors
  /// this is a monotone function of cosine.
  Euclidean,
  /// Equal to cosine on unit vectors.
  InnerProduct,
}

impl SimilarityMetric {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Cosine => "cosine",
      Self::Euclidean => "euclidean",
      Self::InnerProduct => "inner_product",
    }
  }

  pub fn score(self, a: &[f32], b: &[f32]) -> f64 {
    match self {
      Self::Cosine => cosine_similarity(a, b),
      Self::Euclidean => 1.0 / (1.0 + euclidean_distance(a, b)),
      Self::InnerProduct => dot(a, b),
    }
  }
}

impl FromStr for SimilarityMetric {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "cosine" => Ok(Self::Cosine),
      "euclidean" | "l2" => Ok(Self::Euclidean),
      "inner_product" | "dot" => Ok(Self::InnerProduct),
      other => Err(Error::Configuration(format!(
        "unsupported similarity metric: {other:?}"
      ))),
    }
  }
}

impl TryFrom<String> for SimilarityMetric {
  type Error = Error;

  fn try_from(s: String) -> Result<Self> { s.parse() }
}

// ─── Kernels ─────────────────────────────────────────────────────────────────

pub fn dot(a: &[f32], b: &[f32]) -> f64 {
  a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum()
}

pub fn l2_norm(a: &[f32]) -> f64 { dot(a, a).sqrt() }

/// Cosine similarity in `[-1, 1]`. Zero-magnitude or empty inputs yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
  if a.is_empty() || a.len() != b.len() {
    return 0.0;
  }
  let denom = l2_norm(a) * l2_norm(b);
  if denom == 0.0 {
    return 0.0;
  }
  (dot(a, b) / denom).clamp(-1.0, 1.0)
}

/// `1 − cosine_similarity`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
  1.0 - cosine_similarity(a, b)
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
  a.iter()
    .zip(b)
    .map(|(x, y)| {
      let d = f64::from(*x) - f64::from(*y);
      d * d
    })
    .sum::<f64>()
    .sqrt()
}

/// Scale to unit length. Zero vectors are returned unchanged.
pub fn normalized(values: &[f32]) -> Vec<f32> {
  let norm = l2_norm(values);
  if norm == 0.0 {
    return values.to_vec();
  }
  values.iter().map(|v| (f64::from(*v) / norm) as f32).collect()
}

/// Unit-normalised element-wise mean of two vectors of equal length.
pub fn mean_normalized(a: &[f32], b: &[f32]) -> Vec<f32> {
  let mean: Vec<f32> = a.iter().zip(b).map(|(x, y)| (x + y) / 2.0).collect();
  normalized(&mean)
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;

  fn emb(values: &[f32], tag: &str) -> Embedding {
    Embedding::new(values.to_vec(), ModelVersion::new(tag))
  }

  #[test]
  fn cosine_of_orthogonal_vectors_is_zero() {
    assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-12);
  }

  #[test]
  fn zero_vectors_do_not_produce_nan() {
    let s = cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]);
    assert_eq!(s, 0.0);
    assert_eq!(normalized(&[0.0, 0.0]), vec![0.0, 0.0]);
  }

  #[test]
  fn metric_names_parse() {
    assert_eq!("Cosine".parse::<SimilarityMetric>().unwrap(), SimilarityMetric::Cosine);
    assert_eq!(
      "inner_product".parse::<SimilarityMetric>().unwrap(),
      SimilarityMetric::InnerProduct
    );
    let err = "manhattan".parse::<SimilarityMetric>().unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::Configuration);
  }

  #[test]
  fn metric_names_deserialize_case_insensitively() {
    let metric: SimilarityMetric = serde_json::from_str("\"Inner_Product\"").unwrap();
    assert_eq!(metric, SimilarityMetric::InnerProduct);
    assert_eq!(serde_json::to_string(&SimilarityMetric::InnerProduct).unwrap(), "\"inner_product\"");
    assert!(serde_json::from_str::<SimilarityMetric>("\"manhattan\"").is_err());
  }

  #[test]
  fn comparability_rules() {
    let a = emb(&[1.0, 0.0], "v1");
    assert!(!a.comparable_with(&emb(&[0.0, 1.0], "v1"), true).unwrap());
    assert!(a.comparable_with(&emb(&[0.0, 1.0], "v2"), false).unwrap());
    assert!(a.comparable_with(&emb(&[0.0, 1.0], "v2"), true).is_err());
    let err = a.comparable_with(&emb(&[0.0, 1.0, 0.0], "v1"), false).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 2, found: 3 }));
  }

  proptest! {
    #[test]
    fn self_similarity_is_maximal_for_unit_vectors(
      a in prop::collection::vec(-10.0f32..10.0, 8),
      b in prop::collection::vec(-10.0f32..10.0, 8),
    ) {
      prop_assume!(l2_norm(&a) > 1e-3 && l2_norm(&b) > 1e-3);
      let (a, b) = (normalized(&a), normalized(&b));
      for metric in [
        SimilarityMetric::Cosine,
        SimilarityMetric::Euclidean,
        SimilarityMetric::InnerProduct,
      ] {
        prop_assert!(metric.score(&a, &a) + 1e-6 >= metric.score(&a, &b));
      }
    }
  }
}
