//! Bounded walks over a conversation tree.
//!
//! Every walk is iterative, over an explicit queue or stack, with a depth
//! counter and a visited set. Reaching a depth bound during enumeration is a
//! normal stop; the root-path safeguard tripping is a fault
//! ([`Error::DepthExceeded`]), and so is meeting a node twice
//! ([`Violation::Cycle`]).

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tracing::warn;

use crate::{
  config::TraversalConfig,
  conversation::{NodeId, Role},
  metrics::mean,
  tree::ConversationTree,
  Error, Result, Violation,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchMember {
  pub id:           NodeId,
  pub parent_id:    Option<NodeId>,
  pub role:         Role,
  pub content:      String,
  /// Hops from the divergence point, which itself sits at level 0.
  pub branch_level: usize,
  pub turn_number:  usize,
  pub is_terminal:  bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descendant {
  pub id:      NodeId,
  pub content: String,
  pub role:    Role,
  pub depth:   usize,
  /// Ids from the start node down to this descendant, both inclusive.
  pub path:    Vec<NodeId>,
}

/// Why an alternate path stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathEnd {
  Terminal,
  Leaf,
  DepthCap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlternatePath {
  pub nodes:      Vec<NodeId>,
  /// Mean distance-from-parent over the steps after the start node.
  pub mean_drift: Option<f64>,
  pub end:        PathEnd,
}

/// Read-only walks over one tree snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Traversal<'t> {
  tree:   &'t ConversationTree,
  limits: &'t TraversalConfig,
}

impl<'t> Traversal<'t> {
  pub fn new(tree: &'t ConversationTree, limits: &'t TraversalConfig) -> Self {
    Self { tree, limits }
  }

  /// The root→`target` chain via parent pointers.
  pub fn path_to_node(&self, target: &NodeId) -> Result<Vec<NodeId>> {
    let limit = self.limits.root_path_depth;
    let start = self.tree.require(target)?;
    let mut chain = vec![start.id.clone()];
    let mut seen = HashSet::from([&start.id]);
    let mut cursor = start;

    while let Some(parent_id) = &cursor.parent_id {
      if !seen.insert(parent_id) {
        warn!(conversation = %self.tree.id(), node = %parent_id, "parent-pointer cycle");
        return Err(Violation::Cycle(parent_id.clone()).into());
      }
      if chain.len() > limit {
        warn!(conversation = %self.tree.id(), node = %target, limit, "root path safeguard tripped");
        return Err(Error::DepthExceeded { limit, node: target.clone() });
      }
      cursor = self.tree.node(parent_id).ok_or_else(|| Violation::UnknownParent {
        node:   cursor.id.clone(),
        parent: parent_id.clone(),
      })?;
      chain.push(parent_id.clone());
    }

    chain.reverse();
    Ok(chain)
  }

  /// The divergence node plus every descendant that shares it as
  /// divergence point, ordered by `(branch level, turn number, id)`.
  pub fn complete_branch(&self, divergence: &NodeId) -> Result<Vec<BranchMember>> {
    let root = self.tree.require(divergence)?;
    let mut members = Vec::new();
    let mut seen = HashSet::from([&root.id]);
    let mut queue = VecDeque::from([(root, 0usize)]);

    while let Some((node, level)) = queue.pop_front() {
      members.push(BranchMember {
        id:           node.id.clone(),
        parent_id:    node.parent_id.clone(),
        role:         node.role.clone(),
        content:      node.content.clone(),
        branch_level: level,
        turn_number:  node.turn_number,
        is_terminal:  node.is_terminal,
      });
      if level >= self.limits.branch_depth {
        continue;
      }
      for child in self.tree.child_nodes(&node.id) {
        if child.mainline_divergence_point.as_ref() != Some(divergence) {
          continue;
        }
        if !seen.insert(&child.id) {
          return Err(Violation::Cycle(child.id.clone()).into());
        }
        queue.push_back((child, level + 1));
      }
    }

    members.sort_by(|a, b| {
      (a.branch_level, a.turn_number, &a.id).cmp(&(b.branch_level, b.turn_number, &b.id))
    });
    Ok(members)
  }

  /// Breadth-first enumeration below `node`, at most `max_depth` levels
  /// deep (default `traversal.descendant_depth`).
  pub fn descendants(&self, node: &NodeId, max_depth: Option<usize>) -> Result<Vec<Descendant>> {
    let max_depth = max_depth.unwrap_or(self.limits.descendant_depth);
    let start = self.tree.require(node)?;
    let mut out = Vec::new();
    let mut seen = HashSet::from([&start.id]);
    let mut queue = VecDeque::from([(start, vec![start.id.clone()])]);

    while let Some((current, path)) = queue.pop_front() {
      let depth = path.len() - 1;
      if depth >= max_depth {
        continue;
      }
      for child in self.tree.child_nodes(&current.id) {
        if !seen.insert(&child.id) {
          return Err(Violation::Cycle(child.id.clone()).into());
        }
        let mut child_path = path.clone();
        child_path.push(child.id.clone());
        out.push(Descendant {
          id:      child.id.clone(),
          content: child.content.clone(),
          role:    child.role.clone(),
          depth:   depth + 1,
          path:    child_path.clone(),
        });
        queue.push_back((child, child_path));
      }
    }
    Ok(out)
  }

  /// Every distinct linear continuation from `start`, each stopped at a
  /// terminal node, a leaf, or `max_depth` hops (default
  /// `traversal.alternate_path_depth`). Highest mean drift first; paths
  /// without drift data sort last.
  pub fn alternate_paths(&self, start: &NodeId, max_depth: Option<usize>) -> Result<Vec<AlternatePath>> {
    let max_depth = max_depth.unwrap_or(self.limits.alternate_path_depth);
    let first = self.tree.require(start)?;
    let mut out = Vec::new();
    let mut seen = HashSet::from([&first.id]);
    let mut stack = vec![vec![first]];

    while let Some(path) = stack.pop() {
      if out.len() >= self.limits.max_alternate_paths {
        warn!(
          conversation = %self.tree.id(),
          start = %start,
          cap = self.limits.max_alternate_paths,
          "alternate path enumeration capped"
        );
        break;
      }
      let Some(tip) = path.last() else { continue };
      let children: Vec<_> = self.tree.child_nodes(&tip.id).collect();
      let end = if tip.is_terminal {
        Some(PathEnd::Terminal)
      } else if children.is_empty() {
        Some(PathEnd::Leaf)
      } else if path.len() > max_depth {
        Some(PathEnd::DepthCap)
      } else {
        None
      };

      if let Some(end) = end {
        let steps: Vec<f64> =
          path.iter().skip(1).filter_map(|n| n.metrics.distance_from_parent).collect();
        out.push(AlternatePath {
          nodes: path.iter().map(|n| n.id.clone()).collect(),
          mean_drift: mean(&steps),
          end,
        });
        continue;
      }

      for child in children.into_iter().rev() {
        if !seen.insert(&child.id) {
          return Err(Violation::Cycle(child.id.clone()).into());
        }
        let mut next = path.clone();
        next.push(child);
        stack.push(next);
      }
    }

    out.sort_by(|a, b| match (a.mean_drift, b.mean_drift) {
      (Some(x), Some(y)) => y.total_cmp(&x).then_with(|| a.nodes.cmp(&b.nodes)),
      (Some(_), None) => std::cmp::Ordering::Less,
      (None, Some(_)) => std::cmp::Ordering::Greater,
      (None, None) => a.nodes.cmp(&b.nodes),
    });
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use std::collections::{BTreeSet, VecDeque};

  use super::*;
  use crate::{conversation::Node, tree::fixtures::*, ErrorKind};

  fn ids<T>(items: &[T], id: impl Fn(&T) -> &NodeId) -> Vec<&str> {
    items.iter().map(|i| id(i).as_str()).collect()
  }

  fn limits() -> TraversalConfig { TraversalConfig::default() }

  /// Rewire `node`'s parent to `parent` in a stored copy of `tree`.
  fn corrupt(tree: &ConversationTree, node: &str, parent: &str) -> ConversationTree {
    let nodes: Vec<Node> = tree
      .nodes()
      .cloned()
      .map(|mut n| {
        if n.id.as_str() == node {
          n.parent_id = Some(parent.into());
        }
        n
      })
      .collect();
    ConversationTree::from_stored(tree.conversation().clone(), nodes, vec![]).unwrap()
  }

  #[test]
  fn path_to_root_is_a_single_element() {
    let t = branched();
    let l = limits();
    let tr = Traversal::new(&t, &l);
    assert_eq!(tr.path_to_node(&"r".into()).unwrap(), [NodeId::from("r")]);
    assert_eq!(
      tr.path_to_node(&"z".into()).unwrap(),
      ["r", "a", "b", "x", "y", "z"].map(NodeId::from)
    );
  }

  #[test]
  fn path_safeguard_is_a_fault() {
    let t = branched();
    let l = TraversalConfig { root_path_depth: 3, ..limits() };
    let err = Traversal::new(&t, &l).path_to_node(&"z".into()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DepthExceeded);
    // Exactly at the limit is fine.
    assert_eq!(Traversal::new(&t, &l).path_to_node(&"c".into()).unwrap().len(), 4);
  }

  #[test]
  fn cycles_raise_structural_errors() {
    // x's parent forced onto its own descendant z.
    let t = corrupt(&branched(), "x", "z");
    let l = limits();
    let tr = Traversal::new(&t, &l);

    for err in [
      tr.path_to_node(&"z".into()).unwrap_err(),
      tr.descendants(&"x".into(), Some(50)).unwrap_err(),
      tr.alternate_paths(&"x".into(), Some(50)).unwrap_err(),
    ] {
      assert_eq!(err.kind(), ErrorKind::StructuralIntegrity, "{err}");
    }
  }

  #[test]
  fn complete_branch_orders_by_level_then_turn() {
    let t = branched();
    let l = limits();
    let branch = Traversal::new(&t, &l).complete_branch(&"b".into()).unwrap();
    assert_eq!(ids(&branch, |m| &m.id), ["b", "x", "y", "z"]);
    assert_eq!(branch.iter().map(|m| m.branch_level).collect::<Vec<_>>(), [0, 1, 2, 3]);

    let branch = Traversal::new(&t, &l).complete_branch(&"a".into()).unwrap();
    assert_eq!(ids(&branch, |m| &m.id), ["a", "p", "q"]);
  }

  #[test]
  fn complete_branch_matches_manual_walk() {
    let t = branched();
    let l = limits();
    for d in t.node_ids() {
      let got: BTreeSet<NodeId> = Traversal::new(&t, &l)
        .complete_branch(d)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();

      let mut want = BTreeSet::from([d.clone()]);
      let mut queue = VecDeque::from([(d.clone(), 0)]);
      while let Some((n, level)) = queue.pop_front() {
        if level >= l.branch_depth {
          continue;
        }
        for c in t.child_nodes(&n) {
          if c.mainline_divergence_point.as_ref() == Some(d) {
            want.insert(c.id.clone());
            queue.push_back((c.id.clone(), level + 1));
          }
        }
      }
      assert_eq!(got, want, "branch of {d}");
    }
  }

  #[test]
  fn descendants_are_breadth_first_and_bounded() {
    let t = branched();
    let l = limits();
    let tr = Traversal::new(&t, &l);
    let all = tr.descendants(&"a".into(), None).unwrap();
    assert_eq!(ids(&all, |d| &d.id), ["b", "p", "c", "x", "q", "d", "y", "z"]);
    let z = all.iter().find(|d| d.id.as_str() == "z").unwrap();
    assert_eq!(z.depth, 4);
    assert_eq!(z.path, ["a", "b", "x", "y", "z"].map(NodeId::from));

    let shallow = tr.descendants(&"a".into(), Some(1)).unwrap();
    assert_eq!(ids(&shallow, |d| &d.id), ["b", "p"]);
  }

  #[test]
  fn alternate_paths_stop_at_leaves_and_caps() {
    let t = branched();
    let l = limits();
    let tr = Traversal::new(&t, &l);
    let paths = tr.alternate_paths(&"b".into(), None).unwrap();
    let mut seqs: Vec<Vec<&str>> = paths.iter().map(|p| ids(&p.nodes, |n| n)).collect();
    seqs.sort();
    assert_eq!(seqs, [vec!["b", "c", "d"], vec!["b", "x", "y", "z"]]);
    assert!(paths.iter().all(|p| p.end == PathEnd::Leaf && p.mean_drift.is_none()));

    let capped = tr.alternate_paths(&"b".into(), Some(1)).unwrap();
    assert_eq!(capped.len(), 2);
    assert!(capped.iter().all(|p| p.end == PathEnd::DepthCap && p.nodes.len() == 2));
  }

  #[test]
  fn alternate_paths_rank_by_drift() {
    let mut t = branched();
    for (id, d) in [("c", 0.1), ("d", 0.1), ("x", 0.8), ("y", 0.6), ("z", 0.4)] {
      let mut m = t.node(&id.into()).unwrap().metrics.clone();
      m.distance_from_parent = Some(d);
      t.set_metrics(&id.into(), m).unwrap();
    }
    let l = limits();
    let paths = Traversal::new(&t, &l).alternate_paths(&"b".into(), None).unwrap();
    assert_eq!(paths[0].nodes.last().unwrap().as_str(), "z");
    assert!((paths[0].mean_drift.unwrap() - 0.6).abs() < 1e-9);
  }

  #[test]
  fn terminal_node_ends_a_path() {
    let mut t = branched();
    let mut input = crate::ingest::NodeInput::new("stop", Some("d".into()), Role::Assistant, "", at(0));
    input.is_terminal = true;
    t.insert(input, true).unwrap();
    let l = limits();
    let paths = Traversal::new(&t, &l).alternate_paths(&"c".into(), None).unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].end, PathEnd::Terminal);
  }
}
