//! Prompt/response pairs, one per qualifying parent→child edge.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
  conversation::{ConversationId, NodeId},
  vector::Embedding,
};

/// Identifier of a pair, derived from its edge so that an edge can never
/// carry two pairs.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PairId(String);

impl PairId {
  pub fn for_edge(prompt: &NodeId, response: &NodeId) -> Self {
    Self(format!("{prompt}_{response}"))
  }

  /// Rebuild from a stored identifier.
  pub fn from_stored(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for PairId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Derived numeric signals of a pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairMetrics {
  pub coherence_score:              Option<f64>,
  /// Distance between this pair's embedding and the previous pair's.
  pub semantic_drift:               Option<f64>,
  pub drift_from_root:              Option<f64>,
  /// Signed projection of (response − prompt) onto the abstraction axis.
  pub abstraction_delta:            Option<f64>,
  pub dialogic_continuity:          Option<f64>,
  pub relative_entropy_to_siblings: Option<f64>,
  pub downstream_spark_factor:      Option<f64>,
  /// Seconds between prompt and response.
  pub turn_latency:                 Option<f64>,
  pub time_since_previous_pair:     Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
  pub id:                          PairId,
  pub conversation_id:             ConversationId,
  pub prompt_id:                   NodeId,
  pub response_id:                 NodeId,
  pub is_mainline:                 bool,
  pub is_alternate:                bool,
  /// The response has no continuation.
  pub is_terminal_arc:             bool,
  /// Other responses to the same prompt.
  pub alternative_count:           usize,
  pub branch_depth:                usize,
  pub divergence_point:            Option<NodeId>,
  pub divergence_turn:             Option<usize>,
  pub exchange_position_in_branch: usize,
  pub turn_number:                 usize,
  pub embedding:                   Option<Embedding>,
  /// `true` when the embedding was averaged from the two node vectors
  /// rather than supplied by the embedder.
  pub embedding_derived:           bool,
  pub metrics:                     PairMetrics,
}
