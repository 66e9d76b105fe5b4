//! Materialised ancestry rows.

use serde::{Deserialize, Serialize};

use crate::{
  config::TraversalConfig,
  conversation::NodeId,
  traversal::Traversal,
  tree::ConversationTree,
  Result,
};

/// One `(node, ancestor)` row. Every node has a self row at distance 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AncestryPath {
  pub node_id:          NodeId,
  pub ancestor_id:      NodeId,
  pub distance:         usize,
  /// Ids strictly between the ancestor and the node, top-down.
  pub intermediate:     Vec<NodeId>,
  /// Sum of distance-from-parent over the hops; `None` if any hop lacks it.
  pub cumulative_drift: Option<f64>,
}

/// Rows for every ancestor of `node`, nearest first.
pub fn materialize(
  tree: &ConversationTree,
  node: &NodeId,
  limits: &TraversalConfig,
) -> Result<Vec<AncestryPath>> {
  let path = Traversal::new(tree, limits).path_to_node(node)?;
  let last = path.len() - 1;

  let mut rows = Vec::with_capacity(path.len());
  let mut drift = Some(0.0);
  for i in (0..=last).rev() {
    if i < last {
      let hop = tree.node(&path[i + 1]).and_then(|n| n.metrics.distance_from_parent);
      drift = drift.zip(hop).map(|(acc, d)| acc + d);
    }
    rows.push(AncestryPath {
      node_id:          node.clone(),
      ancestor_id:      path[i].clone(),
      distance:         last - i,
      intermediate:     path[(i + 1).min(last)..last].to_vec(),
      cumulative_drift: drift,
    });
  }
  Ok(rows)
}
