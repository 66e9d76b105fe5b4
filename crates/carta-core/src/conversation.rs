//! Conversations and their nodes.
//!
//! A node's structural fields are fixed when it is inserted. Its metric
//! fields are derived later by the metrics engine and may be overwritten any
//! number of times; until then they are `None`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vector::{Embedding, ModelVersion};

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Identifier of a node, as assigned by the export the parser read.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for NodeId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for NodeId {
  fn from(s: String) -> Self { Self(s) }
}

/// Identifier of a conversation.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  /// A fresh random identifier, for exports that carry none.
  pub fn generate() -> Self { Self(uuid::Uuid::new_v4().hyphenated().to_string()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ConversationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ConversationId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

// ─── Role ────────────────────────────────────────────────────────────────────

/// Author role of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
  System,
  User,
  Assistant,
  Tool,
  Custom(String),
}

impl Role {
  pub fn as_str(&self) -> &str {
    match self {
      Self::System => "system",
      Self::User => "user",
      Self::Assistant => "assistant",
      Self::Tool => "tool",
      Self::Custom(s) => s,
    }
  }
}

impl From<String> for Role {
  fn from(s: String) -> Self {
    match s.to_ascii_lowercase().as_str() {
      "system" => Self::System,
      "user" => Self::User,
      "assistant" => Self::Assistant,
      "tool" => Self::Tool,
      _ => Self::Custom(s),
    }
  }
}

impl From<&str> for Role {
  fn from(s: &str) -> Self { Self::from(s.to_owned()) }
}

impl From<Role> for String {
  fn from(role: Role) -> Self { role.as_str().to_owned() }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ─── Generation type ─────────────────────────────────────────────────────────

/// How a node came to exist relative to its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationType {
  /// The conversation root.
  InitialPrompt,
  /// The first user message under its parent.
  UserContinuation,
  /// A user message written alongside an earlier user sibling.
  Edit,
  /// The first response under its parent.
  StandardResponse,
  /// A response produced alongside an earlier response sibling.
  Regeneration,
  Other,
}

impl GenerationType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::InitialPrompt => "initial_prompt",
      Self::UserContinuation => "user_continuation",
      Self::Edit => "edit",
      Self::StandardResponse => "standard_response",
      Self::Regeneration => "regeneration",
      Self::Other => "other",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "initial_prompt" => Some(Self::InitialPrompt),
      "user_continuation" => Some(Self::UserContinuation),
      "edit" => Some(Self::Edit),
      "standard_response" => Some(Self::StandardResponse),
      "regeneration" => Some(Self::Regeneration),
      "other" => Some(Self::Other),
      _ => None,
    }
  }
}

// ─── Conversation ────────────────────────────────────────────────────────────

/// A conversation envelope. The tree itself lives in its nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
  pub id:                      ConversationId,
  pub title:                   String,
  pub created_at:              DateTime<Utc>,
  pub updated_at:              DateTime<Utc>,
  pub root_id:                 Option<NodeId>,
  /// Tip of the mainline.
  pub current_node:            Option<NodeId>,
  /// Mean branch entropy over the conversation's divergence points.
  pub tension_score:           Option<f64>,
  pub embedding_model_version: ModelVersion,
  pub default_model_slug:      Option<String>,
}

// ─── Node ────────────────────────────────────────────────────────────────────

/// Derived numeric signals of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
  pub distance_from_parent:      Option<f64>,
  pub avg_sibling_distance:      Option<f64>,
  pub drift_since_root:          Option<f64>,
  pub drift_acceleration:        Option<f64>,
  /// Entropy of this node's children's pairwise distances.
  pub branch_entropy:            Option<f64>,
  pub sibling_continuation_rate: Option<f64>,
  pub cognitive_load:            Option<f64>,
  pub spark_factor:              Option<f64>,
  pub seconds_since_parent:      Option<f64>,
  pub edit_chain_depth:          Option<u32>,
  pub turn_density_ratio:        Option<f64>,
  /// Mean distance of this node's children to the node itself.
  pub sibling_convergence:       Option<f64>,
  /// Distance to the embedding of the mainline divergence point.
  pub distance_from_mainline:    Option<f64>,
}

/// A single message in a conversation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub id:                        NodeId,
  pub conversation_id:           ConversationId,
  /// `None` only for the root.
  pub parent_id:                 Option<NodeId>,
  pub role:                      Role,
  pub content:                   String,
  pub content_type:              String,
  pub created_at:                DateTime<Utc>,
  pub embedding:                 Option<Embedding>,
  pub is_mainline:               bool,
  pub is_terminal:               bool,
  /// Number of other children of the same parent; refreshed as siblings
  /// are added.
  pub sibling_count:             usize,
  /// Hops from the mainline divergence point; 0 iff mainline.
  pub branch_depth:              usize,
  /// Ancestor ids from the root down to the parent.
  pub ancestor_path:             Vec<NodeId>,
  /// 1-based depth; the root is turn 1.
  pub turn_number:               usize,
  pub generation_type:           GenerationType,
  pub mainline_divergence_point: Option<NodeId>,
  pub replaced_node_id:          Option<NodeId>,
  pub metrics:                   NodeMetrics,
}

impl Node {
  pub fn is_root(&self) -> bool { self.parent_id.is_none() }

  /// Number of edges between the root and this node.
  pub fn depth(&self) -> usize { self.ancestor_path.len() }
}
