//! Ingestion of parser output into a [`ConversationTree`].
//!
//! The parser delivers one [`IngestBatch`] per conversation: metadata plus an
//! ordered list of node tuples in which every parent precedes its children.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
  config::EmbeddingConfig,
  conversation::{Conversation, ConversationId, NodeId, Role},
  tree::ConversationTree,
  vector::{Embedding, ModelVersion},
  Result, Violation,
};

/// Conversation-level metadata extracted by the parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationMeta {
  /// Generated when the export carries none.
  #[serde(default)]
  pub id:                      Option<ConversationId>,
  #[serde(default)]
  pub title:                   Option<String>,
  #[serde(default)]
  pub created_at:              Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at:              Option<DateTime<Utc>>,
  /// Tip of the mainline. When absent the mainline follows the
  /// last-delivered child at every level.
  #[serde(default)]
  pub current_node:            Option<NodeId>,
  #[serde(default)]
  pub default_model_slug:      Option<String>,
  #[serde(default)]
  pub embedding_model_version: Option<ModelVersion>,
}

fn default_content_type() -> String { "text".to_owned() }

/// One `(node, parent)` tuple from the parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInput {
  pub id:               NodeId,
  #[serde(default)]
  pub parent_id:        Option<NodeId>,
  pub role:             Role,
  #[serde(default)]
  pub content:          String,
  #[serde(default = "default_content_type")]
  pub content_type:     String,
  pub created_at:       DateTime<Utc>,
  /// The earlier node this one supersedes, if the parser detected an edit.
  #[serde(default)]
  pub replaced_node_id: Option<NodeId>,
  /// A terminal node accepts no children.
  #[serde(default)]
  pub is_terminal:      bool,
  /// A vector delivered with the node, if the embedder already ran.
  #[serde(default)]
  pub embedding:        Option<Embedding>,
}

impl NodeInput {
  /// Convenience constructor with all optional fields set to their defaults.
  pub fn new(
    id: impl Into<NodeId>,
    parent_id: Option<NodeId>,
    role: Role,
    content: impl Into<String>,
    created_at: DateTime<Utc>,
  ) -> Self {
    Self {
      id: id.into(),
      parent_id,
      role,
      content: content.into(),
      content_type: default_content_type(),
      created_at,
      replaced_node_id: None,
      is_terminal: false,
      embedding: None,
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestBatch {
  pub conversation: ConversationMeta,
  pub nodes:        Vec<NodeInput>,
}

/// Build a fully indexed tree from a parser batch.
///
/// Fails with a structural error if a parent is delivered after its child,
/// is unknown, or is terminal, or if the batch holds more than one root.
///
/// Missing envelope timestamps come from the earliest and latest node; the
/// wall clock is used only for an empty batch.
pub fn build_tree(batch: IngestBatch, embedding: &EmbeddingConfig) -> Result<ConversationTree> {
  let IngestBatch { conversation: meta, nodes } = batch;
  let created_at = meta
    .created_at
    .or_else(|| nodes.iter().map(|n| n.created_at).min())
    .unwrap_or_else(Utc::now);
  let updated_at = meta
    .updated_at
    .or_else(|| nodes.iter().map(|n| n.created_at).max())
    .unwrap_or(created_at);

  let conversation = Conversation {
    id:                      meta.id.unwrap_or_else(ConversationId::generate),
    title:                   meta.title.unwrap_or_else(|| "Untitled Conversation".to_owned()),
    created_at,
    updated_at,
    root_id:                 None,
    current_node:            None,
    tension_score:           None,
    embedding_model_version: meta
      .embedding_model_version
      .unwrap_or_else(|| embedding.model_version.clone()),
    default_model_slug:      meta.default_model_slug,
  };

  let mainline = mainline_chain(&nodes, meta.current_node.as_ref())?;
  if let Some(current) = &meta.current_node
    && !mainline.contains(current)
  {
    warn!(
      conversation = %conversation.id,
      current = %current,
      "current node not present in batch; mainline follows the latest children"
    );
  }

  let mut tree = ConversationTree::new(conversation);
  for input in nodes {
    let on_mainline = mainline.contains(&input.id);
    tree.insert(input, on_mainline)?;
  }

  info!(
    conversation = %tree.id(),
    nodes = tree.len(),
    mainline = mainline.len(),
    "built conversation tree"
  );
  Ok(tree)
}

/// The set of node ids on the root→tip chain.
fn mainline_chain(inputs: &[NodeInput], current: Option<&NodeId>) -> Result<HashSet<NodeId>> {
  let parents: HashMap<&NodeId, Option<&NodeId>> =
    inputs.iter().map(|n| (&n.id, n.parent_id.as_ref())).collect();

  let tip = match current.filter(|c| parents.contains_key(c)) {
    Some(c) => c,
    None => {
      let Some(root) = inputs.iter().find(|n| n.parent_id.is_none()) else {
        return Ok(HashSet::new());
      };
      let mut last_child: HashMap<&NodeId, &NodeId> = HashMap::new();
      for n in inputs {
        if let Some(p) = &n.parent_id {
          last_child.insert(p, &n.id);
        }
      }
      let mut tip = &root.id;
      let mut seen = HashSet::from([tip]);
      while let Some(next) = last_child.get(tip) {
        if !seen.insert(*next) {
          return Err(Violation::Cycle((*next).clone()).into());
        }
        tip = next;
      }
      tip
    }
  };

  let mut chain = HashSet::new();
  let mut cursor = Some(tip);
  while let Some(id) = cursor {
    if !chain.insert(id.clone()) {
      return Err(Violation::Cycle(id.clone()).into());
    }
    cursor = parents.get(id).copied().flatten();
  }
  Ok(chain)
}
