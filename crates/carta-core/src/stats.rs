//! Aggregate statistics over one conversation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
  conversation::{ConversationId, Node, NodeId},
  metrics::mean,
  pairs::mean_coherence,
  tree::ConversationTree,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
  pub conversation_id:   ConversationId,
  pub title:             String,
  pub created_at:        DateTime<Utc>,
  pub updated_at:        DateTime<Utc>,
  pub node_count:        usize,
  pub embedded_nodes:    usize,
  pub mainline_length:   usize,
  /// Non-mainline children of mainline nodes.
  pub branch_count:      usize,
  pub divergence_points: usize,
  pub max_branch_depth:  usize,
  pub max_turn:          usize,
  pub pair_count:        usize,
  pub mean_coherence:    Option<f64>,
  pub mean_spark:        Option<f64>,
  pub tension_score:     Option<f64>,
}

/// Shape and signals of one branch, rooted at the first node off the
/// mainline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchStatistics {
  pub branch_root:      NodeId,
  pub divergence_point: NodeId,
  pub divergence_turn:  usize,
  pub node_count:       usize,
  pub max_depth:        usize,
  pub leaf_count:       usize,
  pub terminal_count:   usize,
  /// Mean distance of the branch's nodes from the divergence point.
  pub mean_divergence:  Option<f64>,
  pub mean_spark:       Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDrift {
  pub turn_number:               usize,
  pub node_count:                usize,
  pub mean_drift:                Option<f64>,
  pub mean_distance_from_parent: Option<f64>,
  pub mainline_drift:            Option<f64>,
}

pub fn summarize(tree: &ConversationTree) -> ConversationSummary {
  let conversation = tree.conversation();
  let sparks: Vec<f64> = tree.nodes().filter_map(|n| n.metrics.spark_factor).collect();
  ConversationSummary {
    conversation_id:   conversation.id.clone(),
    title:             conversation.title.clone(),
    created_at:        conversation.created_at,
    updated_at:        conversation.updated_at,
    node_count:        tree.len(),
    embedded_nodes:    tree.nodes().filter(|n| n.embedding.is_some()).count(),
    mainline_length:   tree.mainline().len(),
    branch_count:      tree.nodes().filter(|n| n.branch_depth == 1).count(),
    divergence_points: tree.divergence_points().count(),
    max_branch_depth:  tree.nodes().map(|n| n.branch_depth).max().unwrap_or(0),
    max_turn:          tree.nodes().map(|n| n.turn_number).max().unwrap_or(0),
    pair_count:        tree.pairs().count(),
    mean_coherence:    mean_coherence(tree.pairs()),
    mean_spark:        mean(&sparks),
    tension_score:     conversation.tension_score,
  }
}

/// One entry per branch, in insertion order of the branch roots.
pub fn branch_statistics(tree: &ConversationTree) -> Vec<BranchStatistics> {
  let mut branches: BTreeMap<&NodeId, Vec<&Node>> = BTreeMap::new();
  let mut roots = Vec::new();
  for n in tree.nodes().filter(|n| !n.is_mainline) {
    // The branch root is the first off-mainline id on the node's path.
    let root = n
      .ancestor_path
      .iter()
      .chain(std::iter::once(&n.id))
      .find(|id| tree.node(id).is_some_and(|a| !a.is_mainline));
    if let Some(root) = root {
      if *root == n.id {
        roots.push(n);
      }
      branches.entry(root).or_default().push(n);
    }
  }

  roots
    .into_iter()
    .filter_map(|root| {
      let divergence = root.mainline_divergence_point.as_ref()?;
      let members = branches.get(&root.id)?;
      let distances: Vec<f64> = members.iter().filter_map(|n| n.metrics.distance_from_mainline).collect();
      let sparks: Vec<f64> = members.iter().filter_map(|n| n.metrics.spark_factor).collect();
      Some(BranchStatistics {
        branch_root:      root.id.clone(),
        divergence_point: divergence.clone(),
        divergence_turn:  tree.node(divergence).map_or(0, |d| d.turn_number),
        node_count:       members.len(),
        max_depth:        members.iter().map(|n| n.branch_depth).max().unwrap_or(0),
        leaf_count:       members.iter().filter(|n| tree.children(&n.id).is_empty()).count(),
        terminal_count:   members.iter().filter(|n| n.is_terminal).count(),
        mean_divergence:  mean(&distances),
        mean_spark:       mean(&sparks),
      })
    })
    .collect()
}

/// Drift statistics grouped by turn number, ascending.
pub fn drift_by_turn(tree: &ConversationTree) -> Vec<TurnDrift> {
  let mut turns: BTreeMap<usize, Vec<&Node>> = BTreeMap::new();
  for n in tree.nodes() {
    turns.entry(n.turn_number).or_default().push(n);
  }
  turns
    .into_iter()
    .map(|(turn_number, nodes)| {
      let drift: Vec<f64> = nodes.iter().filter_map(|n| n.metrics.drift_since_root).collect();
      let step: Vec<f64> = nodes.iter().filter_map(|n| n.metrics.distance_from_parent).collect();
      TurnDrift {
        turn_number,
        node_count: nodes.len(),
        mean_drift: mean(&drift),
        mean_distance_from_parent: mean(&step),
        mainline_drift: nodes.iter().find(|n| n.is_mainline).and_then(|n| n.metrics.drift_since_root),
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tree::fixtures::*;

  #[test]
  fn summary_counts_shape() {
    let t = branched();
    let s = summarize(&t);
    assert_eq!(s.node_count, 10);
    assert_eq!(s.mainline_length, 5);
    assert_eq!(s.branch_count, 2);
    assert_eq!(s.divergence_points, 2);
    assert_eq!(s.max_branch_depth, 3);
    assert_eq!(s.max_turn, 6);
    assert_eq!(s.embedded_nodes, 0);
    assert_eq!(s.mean_spark, None);
  }

  #[test]
  fn branches_are_grouped_by_root() {
    let t = branched();
    let stats = branch_statistics(&t);
    assert_eq!(stats.len(), 2);
    let x = &stats[0];
    assert_eq!(x.branch_root.as_str(), "x");
    assert_eq!(x.divergence_point.as_str(), "b");
    assert_eq!(x.divergence_turn, 3);
    assert_eq!((x.node_count, x.max_depth, x.leaf_count), (3, 3, 1));

    let p = &stats[1];
    assert_eq!(p.branch_root.as_str(), "p");
    assert_eq!(p.node_count, 2);
  }

  #[test]
  fn drift_groups_by_turn() {
    let mut t = branched();
    for (id, d) in [("c", 0.2), ("x", 0.6)] {
      let mut m = t.node(&id.into()).unwrap().metrics.clone();
      m.drift_since_root = Some(d);
      t.set_metrics(&id.into(), m).unwrap();
    }
    let turns = drift_by_turn(&t);
    assert_eq!(turns.len(), 6);
    let t4 = &turns[3];
    assert_eq!((t4.turn_number, t4.node_count), (4, 3));
    assert!((t4.mean_drift.unwrap() - 0.4).abs() < 1e-12);
    assert_eq!(t4.mainline_drift, Some(0.2));
  }
}
