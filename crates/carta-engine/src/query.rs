//! Request and result types for [`Carta`](crate::Carta) searches.

use std::collections::BTreeMap;

use carta_core::{
  conversation::{ConversationId, Node, Role},
  index::IndexAttributes,
  pair::Pair,
  score::{Signal, WeightSet},
  vector::{Embedding, ModelVersion, SimilarityMetric},
};
use serde::{Deserialize, Serialize};

// ─── Similarity ──────────────────────────────────────────────────────────────

/// Nearest-neighbour search over node (or pair) embeddings.
///
/// `None` fields fall back to the configured defaults or apply no filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityQuery {
  pub embedding:        Embedding,
  pub conversation:     Option<ConversationId>,
  pub limit:            Option<usize>,
  /// Minimum score a hit must reach.
  pub threshold:        Option<f64>,
  pub metric:           Option<SimilarityMetric>,
  /// Author role filter; ignored by pair search.
  pub role:             Option<Role>,
  pub mainline:         Option<bool>,
  pub max_branch_depth: Option<usize>,
}

impl SimilarityQuery {
  pub fn new(embedding: Embedding) -> Self {
    Self {
      embedding,
      conversation: None,
      limit: None,
      threshold: None,
      metric: None,
      role: None,
      mainline: None,
      max_branch_depth: None,
    }
  }

  #[must_use]
  pub fn in_conversation(mut self, id: impl Into<ConversationId>) -> Self {
    self.conversation = Some(id.into());
    self
  }

  #[must_use]
  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  #[must_use]
  pub fn threshold(mut self, threshold: f64) -> Self {
    self.threshold = Some(threshold);
    self
  }

  #[must_use]
  pub fn metric(mut self, metric: SimilarityMetric) -> Self {
    self.metric = Some(metric);
    self
  }

  /// Whether an indexed entity passes the structural filters.
  pub(crate) fn admits(&self, attrs: &IndexAttributes) -> bool {
    let role_ok = match (&self.role, &attrs.role) {
      (Some(want), Some(role)) => want == role,
      _ => true,
    };
    role_ok
      && self.mainline.is_none_or(|m| m == attrs.is_mainline)
      && self.max_branch_depth.is_none_or(|d| attrs.branch_depth <= d)
  }

  pub(crate) fn is_filtered(&self) -> bool {
    self.role.is_some() || self.mainline.is_some() || self.max_branch_depth.is_some()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHit {
  pub node:          Node,
  pub score:         f64,
  pub model_version: ModelVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairHit {
  pub pair:          Pair,
  pub score:         f64,
  pub model_version: ModelVersion,
}

// ─── Composite ───────────────────────────────────────────────────────────────

/// Similarity search re-ranked by a weighted composite of node metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeQuery {
  pub similarity: SimilarityQuery,
  /// Overrides `query.composite_weights` for this request.
  pub weights:    Option<WeightSet>,
}

impl CompositeQuery {
  pub fn new(similarity: SimilarityQuery) -> Self { Self { similarity, weights: None } }

  #[must_use]
  pub fn weights(mut self, weights: WeightSet) -> Self {
    self.weights = Some(weights);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeHit {
  pub node:       Node,
  /// Raw similarity score.
  pub similarity: f64,
  pub combined:   f64,
  /// Normalised value of every signal that contributed.
  pub components: BTreeMap<Signal, f64>,
}

// ─── Patterns ────────────────────────────────────────────────────────────────

/// Cross-conversation search for nodes resembling `embedding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternQuery {
  pub embedding:      Embedding,
  /// Conversations whose nodes must not appear.
  #[serde(default)]
  pub exclude:        Vec<ConversationId>,
  pub limit:          Option<usize>,
  pub min_similarity: Option<f64>,
  pub metric:         Option<SimilarityMetric>,
}

impl PatternQuery {
  pub fn new(embedding: Embedding) -> Self {
    Self { embedding, exclude: Vec::new(), limit: None, min_similarity: None, metric: None }
  }

  #[must_use]
  pub fn excluding(mut self, ids: impl IntoIterator<Item = ConversationId>) -> Self {
    self.exclude.extend(ids);
    self
  }

  #[must_use]
  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternHit {
  pub node:       Node,
  pub similarity: f64,
  /// `similarity · (1 + boost · spark)`; spark counts as 0 when unknown.
  pub score:      f64,
}
