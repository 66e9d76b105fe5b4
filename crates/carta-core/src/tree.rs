//! The indexed, in-memory form of one conversation.
//!
//! [`ConversationTree`] owns a conversation's nodes and pairs and keeps the
//! child index that makes point lookup, children-of and root-of O(1).
//! Structural fields are derived once, in [`ConversationTree::insert`], and
//! never change afterwards; only embeddings and metrics are overwritten.

use std::collections::{BTreeMap, HashMap};

use crate::{
  conversation::{Conversation, ConversationId, GenerationType, Node, NodeId, NodeMetrics, Role},
  ingest::NodeInput,
  pair::{Pair, PairId},
  vector::Embedding,
  Error, Result, Violation,
};

#[derive(Debug, Clone)]
pub struct ConversationTree {
  conversation: Conversation,
  nodes:        HashMap<NodeId, Node>,
  children:     HashMap<NodeId, Vec<NodeId>>,
  /// Insertion order; every parent precedes its children unless the tree
  /// was loaded from corrupted storage.
  order:        Vec<NodeId>,
  pairs:        BTreeMap<PairId, Pair>,
}

impl ConversationTree {
  pub fn new(conversation: Conversation) -> Self {
    Self {
      conversation,
      nodes: HashMap::new(),
      children: HashMap::new(),
      order: Vec::new(),
      pairs: BTreeMap::new(),
    }
  }

  /// Reassemble a tree from stored rows.
  ///
  /// Parent pointers are indexed as found, without re-validating them, so
  /// that a corrupted store still loads and the fault surfaces as a
  /// structural error when the tree is walked.
  pub fn from_stored(
    conversation: Conversation,
    nodes: Vec<Node>,
    pairs: Vec<Pair>,
  ) -> Result<Self> {
    let mut tree = Self::new(conversation);
    for node in nodes {
      tree.check_owned(&node)?;
      if tree.nodes.contains_key(&node.id) {
        return Err(Violation::DuplicateNode(node.id).into());
      }
      tree.index(node);
    }
    for pair in pairs {
      if tree.pairs.contains_key(&pair.id) {
        return Err(
          Violation::DuplicatePair { prompt: pair.prompt_id, response: pair.response_id }.into(),
        );
      }
      tree.upsert_pair(pair)?;
    }
    Ok(tree)
  }

  // ─── Accessors ─────────────────────────────────────────────────────────

  pub fn conversation(&self) -> &Conversation { &self.conversation }

  pub fn conversation_mut(&mut self) -> &mut Conversation { &mut self.conversation }

  pub fn id(&self) -> &ConversationId { &self.conversation.id }

  pub fn len(&self) -> usize { self.nodes.len() }

  pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

  pub fn node(&self, id: &NodeId) -> Option<&Node> { self.nodes.get(id) }

  /// Like [`node`](Self::node), but a missing id is an error.
  pub fn require(&self, id: &NodeId) -> Result<&Node> {
    self
      .nodes
      .get(id)
      .ok_or_else(|| Error::not_found(format!("node {id} in conversation {}", self.id())))
  }

  /// All nodes in insertion order.
  pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
    self.order.iter().filter_map(|id| self.nodes.get(id))
  }

  pub fn node_ids(&self) -> &[NodeId] { &self.order }

  pub fn children(&self, id: &NodeId) -> &[NodeId] {
    self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn child_nodes(&self, id: &NodeId) -> impl Iterator<Item = &Node> + '_ {
    self.children(id).iter().filter_map(|c| self.nodes.get(c))
  }

  pub fn parent(&self, id: &NodeId) -> Option<&Node> {
    self.nodes.get(id)?.parent_id.as_ref().and_then(|p| self.nodes.get(p))
  }

  pub fn root(&self) -> Option<&Node> {
    self.conversation.root_id.as_ref().and_then(|r| self.nodes.get(r))
  }

  /// Other children of `id`'s parent.
  pub fn siblings(&self, id: &NodeId) -> impl Iterator<Item = &Node> + '_ {
    let parent = self.nodes.get(id).and_then(|n| n.parent_id.clone());
    let id = id.clone();
    parent
      .into_iter()
      .flat_map(move |p| self.children(&p).iter())
      .filter(move |c| **c != id)
      .filter_map(|c| self.nodes.get(c))
  }

  /// The mainline child of `id`, if it has one.
  pub fn mainline_child(&self, id: &NodeId) -> Option<&Node> {
    self.child_nodes(id).find(|c| c.is_mainline)
  }

  /// The root→tip chain.
  pub fn mainline(&self) -> Vec<&Node> {
    let mut chain = Vec::new();
    let mut cursor = self.root();
    while let Some(node) = cursor {
      if chain.len() > self.nodes.len() {
        break;
      }
      chain.push(node);
      cursor = self.mainline_child(&node.id);
    }
    chain
  }

  /// Nodes whose children include both mainline and non-mainline
  /// continuations, in insertion order.
  pub fn divergence_points(&self) -> impl Iterator<Item = &Node> + '_ {
    self.nodes().filter(|n| {
      let (mut main, mut alt) = (false, false);
      for k in self.child_nodes(&n.id) {
        main |= k.is_mainline;
        alt |= !k.is_mainline;
      }
      main && alt
    })
  }

  pub fn pairs(&self) -> impl Iterator<Item = &Pair> + '_ { self.pairs.values() }

  pub fn pair(&self, id: &PairId) -> Option<&Pair> { self.pairs.get(id) }

  pub fn pair_for_edge(&self, prompt: &NodeId, response: &NodeId) -> Option<&Pair> {
    self.pairs.get(&PairId::for_edge(prompt, response))
  }

  // ─── Structural writes ─────────────────────────────────────────────────

  /// Derive a node's structural fields from its position and attach it.
  ///
  /// `mainline` asks for the node to extend the mainline; that is only
  /// permitted directly under the current tip. The root is always mainline.
  pub fn insert(&mut self, input: NodeInput, mainline: bool) -> Result<Node> {
    let node = self.derive(input, mainline)?;
    self.attach(node.clone())?;
    Ok(node)
  }

  /// Attach an already-derived node, validating its position.
  pub fn attach(&mut self, node: Node) -> Result<()> {
    self.check_owned(&node)?;
    if self.nodes.contains_key(&node.id) {
      return Err(Violation::DuplicateNode(node.id).into());
    }
    match &node.parent_id {
      None => {
        if let Some(existing) = &self.conversation.root_id {
          return Err(
            Violation::SecondRoot { existing: existing.clone(), node: node.id }.into(),
          );
        }
        self.conversation.root_id = Some(node.id.clone());
      }
      Some(parent_id) => {
        let parent = self.nodes.get(parent_id).ok_or_else(|| Violation::UnknownParent {
          node:   node.id.clone(),
          parent: parent_id.clone(),
        })?;
        if parent.is_terminal {
          return Err(Violation::TerminalParent(parent_id.clone()).into());
        }
      }
    }
    if node.is_mainline {
      self.conversation.current_node = Some(node.id.clone());
    }
    self.index(node);
    Ok(())
  }

  fn check_owned(&self, node: &Node) -> Result<()> {
    if node.conversation_id != self.conversation.id {
      return Err(
        Violation::ForeignNode {
          node:     node.id.clone(),
          expected: self.conversation.id.to_string(),
          found:    node.conversation_id.to_string(),
        }
        .into(),
      );
    }
    Ok(())
  }

  fn index(&mut self, node: Node) {
    let id = node.id.clone();
    let parent = node.parent_id.clone();
    if node.is_root() && self.conversation.root_id.is_none() {
      self.conversation.root_id = Some(id.clone());
    }
    self.nodes.insert(id.clone(), node);
    self.order.push(id.clone());
    if let Some(parent) = parent {
      let kids = self.children.entry(parent).or_default();
      kids.push(id);
      let count = kids.len().saturating_sub(1);
      for kid in kids.clone() {
        if let Some(n) = self.nodes.get_mut(&kid) {
          n.sibling_count = count;
        }
      }
    }
  }

  fn derive(&self, input: NodeInput, mainline: bool) -> Result<Node> {
    if self.nodes.contains_key(&input.id) {
      return Err(Violation::DuplicateNode(input.id).into());
    }
    if let Some(replaced) = &input.replaced_node_id
      && !self.nodes.contains_key(replaced)
    {
      return Err(
        Violation::UnknownReplacement { node: input.id, replaced: replaced.clone() }.into(),
      );
    }

    let mut node = Node {
      id:                        input.id,
      conversation_id:           self.conversation.id.clone(),
      parent_id:                 input.parent_id,
      role:                      input.role,
      content:                   input.content,
      content_type:              input.content_type,
      created_at:                input.created_at,
      embedding:                 input.embedding,
      is_mainline:               true,
      is_terminal:               input.is_terminal,
      sibling_count:             0,
      branch_depth:              0,
      ancestor_path:             Vec::new(),
      turn_number:               1,
      generation_type:           GenerationType::InitialPrompt,
      mainline_divergence_point: None,
      replaced_node_id:          input.replaced_node_id,
      metrics:                   NodeMetrics::default(),
    };

    let Some(parent_id) = node.parent_id.clone() else {
      if let Some(existing) = &self.conversation.root_id {
        return Err(Violation::SecondRoot { existing: existing.clone(), node: node.id }.into());
      }
      return Ok(node);
    };

    let parent = self.nodes.get(&parent_id).ok_or_else(|| Violation::UnknownParent {
      node:   node.id.clone(),
      parent: parent_id.clone(),
    })?;
    if parent.is_terminal {
      return Err(Violation::TerminalParent(parent_id).into());
    }
    if mainline && (!parent.is_mainline || self.mainline_child(&parent_id).is_some()) {
      return Err(Violation::MainlineExtension { node: node.id, parent: parent_id }.into());
    }

    node.is_mainline = mainline;
    (node.mainline_divergence_point, node.branch_depth) = if mainline {
      (None, 0)
    } else if parent.is_mainline {
      (Some(parent_id.clone()), 1)
    } else {
      (parent.mainline_divergence_point.clone(), parent.branch_depth + 1)
    };

    node.ancestor_path = parent.ancestor_path.clone();
    node.ancestor_path.push(parent_id.clone());
    node.turn_number = node.ancestor_path.len() + 1;
    node.sibling_count = self.children(&parent_id).len();

    let earlier_same_role = self.child_nodes(&parent_id).filter(|s| s.role == node.role).last();
    node.generation_type = match (&node.role, earlier_same_role) {
      (Role::User, None) => GenerationType::UserContinuation,
      (Role::User, Some(_)) => GenerationType::Edit,
      (Role::Assistant, None) => GenerationType::StandardResponse,
      (Role::Assistant, Some(_)) => GenerationType::Regeneration,
      _ => GenerationType::Other,
    };
    if node.generation_type == GenerationType::Edit && node.replaced_node_id.is_none() {
      node.replaced_node_id = earlier_same_role.map(|s| s.id.clone());
    }
    Ok(node)
  }

  // ─── Derived writes ────────────────────────────────────────────────────

  pub fn set_embedding(&mut self, id: &NodeId, embedding: Embedding) -> Result<()> {
    self.require(id)?;
    if let Some(node) = self.nodes.get_mut(id) {
      node.embedding = Some(embedding);
    }
    Ok(())
  }

  pub fn set_metrics(&mut self, id: &NodeId, metrics: NodeMetrics) -> Result<()> {
    self.require(id)?;
    if let Some(node) = self.nodes.get_mut(id) {
      node.metrics = metrics;
    }
    Ok(())
  }

  /// Insert or replace a pair. The pair's response must be a child of its
  /// prompt.
  pub fn upsert_pair(&mut self, pair: Pair) -> Result<()> {
    let is_edge = self
      .nodes
      .get(&pair.response_id)
      .is_some_and(|r| r.parent_id.as_ref() == Some(&pair.prompt_id));
    if !is_edge || pair.id != PairId::for_edge(&pair.prompt_id, &pair.response_id) {
      return Err(
        Violation::NotAnEdge { prompt: pair.prompt_id, response: pair.response_id }.into(),
      );
    }
    self.pairs.insert(pair.id.clone(), pair);
    Ok(())
  }
}


#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::{fixtures::*, *};
  use crate::ErrorKind;

  fn violation(err: Error) -> Violation {
    match err {
      Error::StructuralIntegrity(v) => v,
      other => panic!("expected structural error, got {other:?}"),
    }
  }

  #[test]
  fn branch_fields_are_derived_from_position() {
    let t = branched();
    let z = t.node(&"z".into()).unwrap();
    assert!(!z.is_mainline);
    assert_eq!(z.mainline_divergence_point, Some("b".into()));
    assert_eq!(z.branch_depth, 3);
    assert_eq!(z.turn_number, 6);
    assert_eq!(z.ancestor_path, ["r", "a", "b", "x", "y"].map(NodeId::from));

    let d = t.node(&"d".into()).unwrap();
    assert!(d.is_mainline);
    assert_eq!(d.branch_depth, 0);
    assert_eq!(d.mainline_divergence_point, None);
    assert_eq!(t.conversation().current_node, Some("d".into()));
  }

  #[test]
  fn children_and_siblings_follow_parent_ids() {
    let t = branched();
    assert_eq!(t.children(&"b".into()), ["c", "x"].map(NodeId::from));
    assert_eq!(t.node(&"c".into()).unwrap().sibling_count, 1);
    assert_eq!(t.node(&"x".into()).unwrap().sibling_count, 1);
    assert_eq!(t.siblings(&"p".into()).map(|n| n.id.as_str()).collect::<Vec<_>>(), ["b"]);
    assert_eq!(t.root().unwrap().id.as_str(), "r");

    let dps: Vec<_> = t.divergence_points().map(|n| n.id.as_str()).collect();
    assert_eq!(dps, ["a", "b"]);
    assert_eq!(t.mainline().len(), 5);
  }

  #[test]
  fn unknown_parent_is_rejected() {
    let mut t = branched();
    let input = NodeInput::new("n", Some("ghost".into()), Role::User, "", at(0));
    let err = t.insert(input, false).unwrap_err();
    assert!(matches!(violation(err), Violation::UnknownParent { .. }));
  }

  #[test]
  fn terminal_parent_is_rejected() {
    let mut t = branched();
    let mut input = NodeInput::new("end", Some("z".into()), Role::User, "", at(0));
    input.is_terminal = true;
    t.insert(input, false).unwrap();

    let input = NodeInput::new("after", Some("end".into()), Role::Assistant, "", at(0));
    let err = t.insert(input, false).unwrap_err();
    assert_eq!(violation(err), Violation::TerminalParent("end".into()));
  }

  #[test]
  fn second_root_and_duplicates_are_rejected() {
    let mut t = branched();
    let err = t.insert(NodeInput::new("r2", None, Role::User, "", at(0)), true).unwrap_err();
    assert!(matches!(violation(err), Violation::SecondRoot { .. }));

    let err = t.insert(NodeInput::new("a", Some("r".into()), Role::User, "", at(0)), false).unwrap_err();
    assert_eq!(violation(err), Violation::DuplicateNode("a".into()));
  }

  #[test]
  fn mainline_only_extends_from_the_tip() {
    let mut t = branched();
    let input = NodeInput::new("m", Some("b".into()), Role::Assistant, "", at(0));
    let err = t.insert(input, true).unwrap_err();
    assert!(matches!(violation(err), Violation::MainlineExtension { .. }));

    let input = NodeInput::new("e", Some("d".into()), Role::Assistant, "", at(0));
    assert!(t.insert(input, true).unwrap().is_mainline);
    assert_eq!(t.conversation().current_node, Some("e".into()));
  }

  #[test]
  fn regeneration_and_edit_are_classified() {
    let mut t = branched();
    let regen = NodeInput::new("c-alt", Some("b".into()), Role::Assistant, "", at(0));
    assert_eq!(t.insert(regen, false).unwrap().generation_type, GenerationType::Regeneration);

    let edit = NodeInput::new("b-alt", Some("a".into()), Role::User, "", at(0));
    let edit = t.insert(edit, false).unwrap();
    assert_eq!(edit.generation_type, GenerationType::Edit);
    // `p` is the latest user child of `a`.
    assert_eq!(edit.replaced_node_id, Some("p".into()));
  }

  #[test]
  fn pairs_must_sit_on_edges() {
    let mut t = branched();
    let pair = Pair {
      id:                          PairId::for_edge(&"a".into(), &"c".into()),
      conversation_id:             t.id().clone(),
      prompt_id:                   "a".into(),
      response_id:                 "c".into(),
      is_mainline:                 true,
      is_alternate:                false,
      is_terminal_arc:             false,
      alternative_count:           0,
      branch_depth:                0,
      divergence_point:            None,
      divergence_turn:             None,
      exchange_position_in_branch: 0,
      turn_number:                 2,
      embedding:                   None,
      embedding_derived:           false,
      metrics:                     Default::default(),
    };
    let err = t.upsert_pair(pair).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StructuralIntegrity);
  }

  #[test]
  fn from_stored_keeps_corrupt_parent_pointers() {
    let t = branched();
    let mut nodes: Vec<Node> = t.nodes().cloned().collect();
    for n in &mut nodes {
      if n.id.as_str() == "x" {
        n.parent_id = Some("z".into());
      }
    }
    let loaded = ConversationTree::from_stored(t.conversation().clone(), nodes, vec![]).unwrap();
    assert_eq!(loaded.children(&"z".into()), [NodeId::from("x")]);
  }

  #[test]
  fn metrics_can_be_overwritten() {
    let mut t = branched();
    let m = NodeMetrics { spark_factor: Some(0.5), ..Default::default() };
    t.set_metrics(&"c".into(), m.clone()).unwrap();
    t.set_metrics(&"c".into(), m.clone()).unwrap();
    assert_eq!(t.node(&"c".into()).unwrap().metrics, m);
    assert_eq!(t.set_metrics(&"nope".into(), m).unwrap_err().kind(), ErrorKind::NotFound);
  }

  proptest! {
    #[test]
    fn branch_depth_counts_hops_from_divergence(
      shape in prop::collection::vec((any::<prop::sample::Index>(), any::<bool>()), 1..40)
    ) {
      let mut t = ConversationTree::new(conversation("prop"));
      add(&mut t, "n0", None, true, 0);
      for (i, (parent, wants_main)) in shape.iter().enumerate() {
        let parent = t.node_ids()[parent.index(t.len())].clone();
        let tip = t.conversation().current_node.clone();
        let mainline = *wants_main && tip.as_ref() == Some(&parent);
        add(&mut t, &format!("n{}", i + 1), Some(parent.as_str()), mainline, i as i64);
      }

      for n in t.nodes() {
        prop_assert_eq!(n.branch_depth == 0, n.is_mainline);
        if let Some(p) = t.parent(&n.id) && !n.is_mainline {
          let expected = if p.is_mainline { 1 } else { p.branch_depth + 1 };
          prop_assert_eq!(n.branch_depth, expected);
        }
      }
    }
  }
}
