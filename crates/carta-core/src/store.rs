//! The `ConversationStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (the in-memory store in
//! `carta-engine`, `carta-store-sqlite`). The query façade depends on this
//! abstraction, not on any concrete backend.

use std::{future::Future, sync::Arc};

use crate::{
  ancestry::AncestryPath,
  conversation::{Conversation, ConversationId, Node, NodeId, NodeMetrics, Role},
  pair::{Pair, PairId},
  tree::ConversationTree,
  vector::Embedding,
};

// ─── Query type ──────────────────────────────────────────────────────────────

/// Parameters for [`ConversationStore::scan_nodes`].
#[derive(Debug, Clone, Default)]
pub struct NodeQuery {
  pub conversation_id: Option<ConversationId>,
  pub role:            Option<Role>,
  pub mainline:        Option<bool>,
  pub min_branch_depth: Option<usize>,
  pub max_branch_depth: Option<usize>,
  pub min_turn:        Option<usize>,
  pub max_turn:        Option<usize>,
  /// Only nodes that carry an embedding.
  pub embedded_only:   bool,
  pub limit:           Option<usize>,
  pub offset:          Option<usize>,
}

impl NodeQuery {
  pub fn in_conversation(id: ConversationId) -> Self {
    Self { conversation_id: Some(id), ..Self::default() }
  }

  /// Whether `node` passes every filter. Paging is not applied here.
  pub fn matches(&self, node: &Node) -> bool {
    self.conversation_id.as_ref().is_none_or(|c| *c == node.conversation_id)
      && self.role.as_ref().is_none_or(|r| *r == node.role)
      && self.mainline.is_none_or(|m| m == node.is_mainline)
      && self.min_branch_depth.is_none_or(|d| node.branch_depth >= d)
      && self.max_branch_depth.is_none_or(|d| node.branch_depth <= d)
      && self.min_turn.is_none_or(|t| node.turn_number >= t)
      && self.max_turn.is_none_or(|t| node.turn_number <= t)
      && (!self.embedded_only || node.embedding.is_some())
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a conversation store backend.
///
/// Structural writes are append-only: nodes are inserted once and only
/// their embeddings and metrics are overwritten afterwards. Deletion happens
/// a whole conversation at a time and cascades to its nodes, pairs and
/// ancestry rows.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes. Backend errors convert into the core
/// [`Error`](crate::Error) so callers see one taxonomy.
pub trait ConversationStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static + Into<crate::Error>;

  // ── Conversations ─────────────────────────────────────────────────────

  /// Persist a freshly built tree: the conversation row and all its nodes
  /// and pairs. Fails if the conversation already exists.
  fn create_conversation<'a>(
    &'a self,
    tree: &'a ConversationTree,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get_conversation<'a>(
    &'a self,
    id: &'a ConversationId,
  ) -> impl Future<Output = Result<Option<Conversation>, Self::Error>> + Send + 'a;

  fn list_conversations(
    &self,
  ) -> impl Future<Output = Result<Vec<Conversation>, Self::Error>> + Send + '_;

  /// Overwrite the conversation's mutable envelope fields (title,
  /// timestamps, current node, tension score).
  fn update_conversation<'a>(
    &'a self,
    conversation: &'a Conversation,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Remove a conversation and everything it owns. Returns `false` if it
  /// did not exist.
  fn delete_conversation<'a>(
    &'a self,
    id: &'a ConversationId,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  // ── Nodes ─────────────────────────────────────────────────────────────

  /// Append already-derived nodes, all or nothing. Each parent must be
  /// stored (or precede its child in `nodes`) and must not be terminal.
  fn insert_nodes<'a>(
    &'a self,
    conversation: &'a ConversationId,
    nodes: Vec<Node>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get_node<'a>(
    &'a self,
    conversation: &'a ConversationId,
    id: &'a NodeId,
  ) -> impl Future<Output = Result<Option<Node>, Self::Error>> + Send + 'a;

  /// Filtered range scan over nodes, in conversation then insertion order.
  fn scan_nodes<'a>(
    &'a self,
    query: &'a NodeQuery,
  ) -> impl Future<Output = Result<Vec<Node>, Self::Error>> + Send + 'a;

  /// A consistent snapshot of one conversation. Returns `None` if it does
  /// not exist.
  fn load_tree<'a>(
    &'a self,
    id: &'a ConversationId,
  ) -> impl Future<Output = Result<Option<Arc<ConversationTree>>, Self::Error>> + Send + 'a;

  fn write_embeddings<'a>(
    &'a self,
    conversation: &'a ConversationId,
    embeddings: Vec<(NodeId, Embedding)>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Overwrite metrics for the given nodes and the conversation's tension.
  fn write_node_metrics<'a>(
    &'a self,
    conversation: &'a ConversationId,
    metrics: Vec<(NodeId, NodeMetrics)>,
    tension_score: Option<f64>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Pairs ─────────────────────────────────────────────────────────────

  fn upsert_pairs<'a>(
    &'a self,
    conversation: &'a ConversationId,
    pairs: Vec<Pair>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get_pair<'a>(
    &'a self,
    conversation: &'a ConversationId,
    id: &'a PairId,
  ) -> impl Future<Output = Result<Option<Pair>, Self::Error>> + Send + 'a;

  // ── Ancestry ──────────────────────────────────────────────────────────

  /// Replace the stored ancestry rows of every node that appears as
  /// `node_id` in `rows`.
  fn write_ancestry<'a>(
    &'a self,
    conversation: &'a ConversationId,
    rows: Vec<AncestryPath>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Stored rows of `node`, nearest ancestor first.
  fn ancestry_of<'a>(
    &'a self,
    conversation: &'a ConversationId,
    node: &'a NodeId,
  ) -> impl Future<Output = Result<Vec<AncestryPath>, Self::Error>> + Send + 'a;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tree::fixtures::*;

  #[test]
  fn query_filters_compose() {
    let t = branched();
    let q = NodeQuery {
      conversation_id: Some("conv".into()),
      mainline: Some(false),
      min_branch_depth: Some(2),
      ..Default::default()
    };
    let mut hits: Vec<_> = t.nodes().filter(|n| q.matches(n)).map(|n| n.id.as_str()).collect();
    hits.sort();
    assert_eq!(hits, ["q", "y", "z"]);

    let q = NodeQuery { role: Some(Role::User), max_turn: Some(3), ..NodeQuery::in_conversation("conv".into()) };
    let hits: Vec<_> = t.nodes().filter(|n| q.matches(n)).map(|n| n.id.as_str()).collect();
    assert_eq!(hits, ["r", "b", "p"]);

    let q = NodeQuery { embedded_only: true, ..Default::default() };
    assert_eq!(t.nodes().filter(|n| q.matches(n)).count(), 0);
  }
}
