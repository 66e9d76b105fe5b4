//! The derived-metrics engine.
//!
//! A pass computes raw node signals (distances, drift, entropy, cognitive
//! load and the supplementary shape metrics) for a scope of nodes, then
//! derives spark factor by min–max normalising its components over the
//! whole conversation. An incremental pass restricts the raw work to the
//! nodes whose inputs changed; spark is re-derived everywhere only when the
//! conversation-wide bounds moved.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::{
  config::{CartaConfig, CognitiveLoadWeights},
  conversation::{Node, NodeId, NodeMetrics},
  score::{Normalizer, Signal, WeightSet, weighted_sum},
  tree::ConversationTree,
  vector::cosine_distance,
  Result, Violation,
};

/// Signals that make up the spark factor.
const SPARK_SIGNALS: [Signal; 3] = [Signal::CognitiveLoad, Signal::Entropy, Signal::DriftAcceleration];

/// Output of a metrics pass, ready to be written back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsPass {
  /// Every node whose metrics were (re)computed.
  pub nodes:              BTreeMap<NodeId, NodeMetrics>,
  pub tension_score:      Option<f64>,
  /// Whether spark was rescaled across the whole conversation.
  pub rescaled:           bool,
  pub version_mismatches: usize,
}

impl MetricsPass {
  pub fn apply(&self, tree: &mut ConversationTree) -> Result<()> {
    for (id, metrics) in &self.nodes {
      tree.set_metrics(id, metrics.clone())?;
    }
    tree.conversation_mut().tension_score = self.tension_score;
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct MetricsEngine {
  spark_weights:   WeightSet,
  entropy_bins:    usize,
  cognitive:       CognitiveLoadWeights,
  strict_versions: bool,
}

impl MetricsEngine {
  pub fn new(config: &CartaConfig) -> Self {
    Self {
      spark_weights:   config.metrics.spark_weights.clone(),
      entropy_bins:    config.metrics.entropy_bins.max(1),
      cognitive:       config.metrics.cognitive_load.clone(),
      strict_versions: config.embedding.strict_versions,
    }
  }

  /// Recompute every node of the conversation.
  pub fn recompute_all(&self, tree: &ConversationTree) -> Result<MetricsPass> {
    let scope = tree.node_ids().iter().cloned().collect();
    self.run(tree, scope)
  }

  /// Recompute after the nodes in `changed` were inserted or re-embedded.
  pub fn recompute(&self, tree: &ConversationTree, changed: &BTreeSet<NodeId>) -> Result<MetricsPass> {
    for id in changed {
      tree.require(id)?;
    }
    self.run(tree, affected(tree, changed))
  }

  fn run(&self, tree: &ConversationTree, scope: BTreeSet<NodeId>) -> Result<MetricsPass> {
    let mut pass = Pass { engine: self, tree, mismatches: 0 };
    let mut fresh = BTreeMap::new();
    for id in &scope {
      let node = tree.require(id)?;
      fresh.insert(id.clone(), pass.raw(node)?);
    }

    let before = spark_bounds(tree.nodes().map(|n| &n.metrics));
    let after = spark_bounds(tree.nodes().map(|n| fresh.get(&n.id).unwrap_or(&n.metrics)));
    let rescaled = before != after;
    if rescaled {
      for n in tree.nodes() {
        fresh.entry(n.id.clone()).or_insert_with(|| n.metrics.clone());
      }
    }
    for metrics in fresh.values_mut() {
      metrics.spark_factor = Some(self.spark(&after, metrics));
    }

    let entropies: Vec<f64> = tree
      .divergence_points()
      .filter_map(|d| fresh.get(&d.id).unwrap_or(&d.metrics).branch_entropy)
      .collect();
    let tension_score = mean(&entropies);

    if pass.mismatches > 0 {
      warn!(
        conversation = %tree.id(),
        comparisons = pass.mismatches,
        "compared embeddings from different model versions"
      );
    }
    debug!(
      conversation = %tree.id(),
      scope = scope.len(),
      written = fresh.len(),
      rescaled,
      "metrics pass"
    );

    Ok(MetricsPass {
      nodes: fresh,
      tension_score,
      rescaled,
      version_mismatches: pass.mismatches,
    })
  }

  fn spark(&self, bounds: &Normalizer, m: &NodeMetrics) -> f64 {
    weighted_sum(&self.spark_weights, |signal| bounds.normalize(signal, spark_component(m, signal)))
  }

  /// Monotonic in latency and in edit-chain depth.
  fn cognitive_load(&self, chars: usize, latency_secs: f64, edit_depth: u32) -> f64 {
    let w = &self.cognitive;
    w.content * (chars as f64 / 100.0).ln_1p()
      + w.latency * (latency_secs.max(0.0) / 60.0).ln_1p()
      + w.edit_chain * f64::from(edit_depth)
  }
}

fn spark_component(m: &NodeMetrics, signal: Signal) -> Option<f64> {
  match signal {
    Signal::CognitiveLoad => m.cognitive_load,
    Signal::Entropy => m.branch_entropy,
    Signal::DriftAcceleration => m.drift_acceleration,
    _ => None,
  }
}

fn spark_bounds<'m>(metrics: impl Iterator<Item = &'m NodeMetrics>) -> Normalizer {
  let mut n = Normalizer::new();
  for m in metrics {
    for signal in SPARK_SIGNALS {
      n.observe(signal, spark_component(m, signal));
    }
  }
  n
}

/// Nodes whose raw metrics depend on any node in `changed`.
pub fn affected(tree: &ConversationTree, changed: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
  let mut out = BTreeSet::new();
  for id in changed {
    let Some(node) = tree.node(id) else { continue };
    if node.is_root() {
      return tree.node_ids().iter().cloned().collect();
    }
    out.insert(id.clone());
    for child in tree.children(id) {
      out.insert(child.clone());
      out.extend(tree.children(child).iter().cloned());
    }
    if let Some(parent) = &node.parent_id {
      out.insert(parent.clone());
      out.extend(tree.children(parent).iter().cloned());
      if let Some(grand) = tree.node(parent).and_then(|p| p.parent_id.as_ref()) {
        out.extend(tree.children(grand).iter().cloned());
      }
    }
    if node.is_mainline {
      out.extend(
        tree
          .nodes()
          .filter(|n| n.mainline_divergence_point.as_ref() == Some(id))
          .map(|n| n.id.clone()),
      );
    }
  }
  out
}

// ─── Raw signals ─────────────────────────────────────────────────────────────

struct Pass<'t> {
  engine:     &'t MetricsEngine,
  tree:       &'t ConversationTree,
  mismatches: usize,
}

impl<'t> Pass<'t> {
  fn distance(&mut self, a: &Node, b: &Node) -> Result<Option<f64>> {
    let (Some(x), Some(y)) = (&a.embedding, &b.embedding) else {
      return Ok(None);
    };
    if x.comparable_with(y, self.engine.strict_versions)? {
      self.mismatches += 1;
    }
    Ok(Some(cosine_distance(&x.values, &y.values)))
  }

  /// Direct distance to the root; the root itself is at 0.
  fn drift(&mut self, node: &Node) -> Result<Option<f64>> {
    let tree = self.tree;
    match tree.root() {
      _ if node.is_root() => Ok(Some(0.0)),
      Some(root) => self.distance(node, root),
      None => Ok(None),
    }
  }

  fn raw(&mut self, node: &'t Node) -> Result<NodeMetrics> {
    let tree = self.tree;
    let parent = tree.parent(&node.id);
    let grandparent = parent.and_then(|p| tree.parent(&p.id));
    let mut m = NodeMetrics::default();

    if let Some(p) = parent {
      m.distance_from_parent = self.distance(node, p)?;
    }

    let siblings: Vec<&Node> = tree.siblings(&node.id).collect();
    m.avg_sibling_distance = if node.embedding.is_none() {
      None
    } else if siblings.is_empty() {
      Some(0.0)
    } else {
      let mut ds = Vec::new();
      for s in &siblings {
        if let Some(d) = self.distance(node, s)? {
          ds.push(d);
        }
      }
      mean(&ds)
    };

    m.drift_since_root = self.drift(node)?;
    if let (Some(p), Some(g)) = (parent, grandparent) {
      let (dp, dg) = (self.drift(p)?, self.drift(g)?);
      if let (Some(dn), Some(dp), Some(dg)) = (m.drift_since_root, dp, dg) {
        m.drift_acceleration = Some(dn - 2.0 * dp + dg);
      }
    }

    let children: Vec<&Node> = tree.child_nodes(&node.id).collect();
    let first = children.iter().find_map(|c| c.embedding.as_ref());
    let mut vectors = Vec::new();
    for e in children.iter().filter_map(|c| c.embedding.as_ref()) {
      if let Some(first) = first
        && e.comparable_with(first, self.engine.strict_versions)?
      {
        self.mismatches += 1;
      }
      vectors.push(e.values.as_slice());
    }
    m.branch_entropy = Some(branch_entropy(&vectors, self.engine.entropy_bins));

    let mut convergence = Vec::new();
    for c in &children {
      if let Some(d) = self.distance(c, node)? {
        convergence.push(d);
      }
    }
    m.sibling_convergence = mean(&convergence);

    if let Some(p) = parent {
      let family: Vec<&Node> = tree.child_nodes(&p.id).collect();
      let continuing = family.iter().filter(|s| !tree.children(&s.id).is_empty()).count();
      m.sibling_continuation_rate = Some(continuing as f64 / family.len() as f64);

      let lengths: Vec<f64> = family.iter().map(|s| s.content.chars().count() as f64).collect();
      m.turn_density_ratio = mean(&lengths)
        .filter(|avg| *avg > 0.0)
        .map(|avg| node.content.chars().count() as f64 / avg);

      let millis = (node.created_at - p.created_at).num_milliseconds();
      m.seconds_since_parent = Some(millis as f64 / 1000.0);
    }

    let edit_depth = edit_chain_depth(tree, node)?;
    m.edit_chain_depth = Some(edit_depth);
    m.cognitive_load = Some(self.engine.cognitive_load(
      node.content.chars().count(),
      m.seconds_since_parent.unwrap_or(0.0),
      edit_depth,
    ));

    if let Some(d) = node.mainline_divergence_point.as_ref().and_then(|d| tree.node(d)) {
      m.distance_from_mainline = self.distance(node, d)?;
    }
    Ok(m)
  }
}

/// Number of supersession hops behind `node`.
pub fn edit_chain_depth(tree: &ConversationTree, node: &Node) -> Result<u32> {
  let mut seen = HashSet::from([&node.id]);
  let mut depth = 0;
  let mut cursor = node.replaced_node_id.as_ref();
  while let Some(id) = cursor {
    if !seen.insert(id) {
      return Err(Violation::Cycle(id.clone()).into());
    }
    depth += 1;
    cursor = tree.node(id).and_then(|n| n.replaced_node_id.as_ref());
  }
  Ok(depth)
}

/// Shannon entropy (bits) of the pairwise cosine distances among
/// `vectors`, histogrammed into `bins` equal bins over `[0, 2]`.
pub fn branch_entropy(vectors: &[&[f32]], bins: usize) -> f64 {
  let mut distances = Vec::new();
  for (i, a) in vectors.iter().enumerate() {
    for b in &vectors[i + 1..] {
      distances.push(cosine_distance(a, b));
    }
  }
  distance_entropy(&distances, bins)
}

pub fn distance_entropy(distances: &[f64], bins: usize) -> f64 {
  if distances.is_empty() || bins == 0 {
    return 0.0;
  }
  let mut histogram = vec![0usize; bins];
  for d in distances {
    let bin = ((d.clamp(0.0, 2.0) / 2.0) * bins as f64) as usize;
    histogram[bin.min(bins - 1)] += 1;
  }
  let total = distances.len() as f64;
  histogram
    .into_iter()
    .filter(|c| *c > 0)
    .map(|c| {
      let p = c as f64 / total;
      -p * p.log2()
    })
    .sum()
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
  if values.is_empty() {
    None
  } else {
    Some(values.iter().sum::<f64>() / values.len() as f64)
  }
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;
  use crate::{
    conversation::Role,
    ingest::NodeInput,
    tree::fixtures::*,
    vector::{Embedding, ModelVersion},
    ErrorKind,
  };

  fn engine() -> MetricsEngine { MetricsEngine::new(&CartaConfig::default()) }

  fn unit(deg: f64) -> Vec<f32> {
    let r = deg.to_radians();
    vec![r.cos() as f32, r.sin() as f32]
  }

  /// The branched fixture with every node embedded on the unit circle.
  fn embedded() -> ConversationTree {
    let mut t = branched();
    let ids: Vec<NodeId> = t.node_ids().to_vec();
    for (i, id) in ids.iter().enumerate() {
      t.set_embedding(id, emb(&unit(i as f64 * 13.0))).unwrap();
    }
    t
  }

  fn full(t: &mut ConversationTree) -> MetricsPass {
    let pass = engine().recompute_all(t).unwrap();
    pass.apply(t).unwrap();
    pass
  }

  #[test]
  fn entropy_rewards_diverse_siblings() {
    let diverse = distance_entropy(&[0.1, 0.5, 0.9], 10);
    let uniform = distance_entropy(&[0.1, 0.1, 0.1], 10);
    assert!(diverse > uniform);
    assert_eq!(uniform, 0.0);
  }

  #[test]
  fn entropy_over_actual_sibling_vectors() {
    // Pairwise cosine distances ≈ {0.1, 0.9, 0.48}.
    let spread = [unit(0.0), unit(25.84), unit(84.26)];
    let tight = [unit(0.0), unit(25.84), unit(-25.84)];
    let spread: Vec<&[f32]> = spread.iter().map(Vec::as_slice).collect();
    let tight: Vec<&[f32]> = tight.iter().map(Vec::as_slice).collect();
    assert!(branch_entropy(&spread, 10) > branch_entropy(&tight, 10));
    assert_eq!(branch_entropy(&spread[..1], 10), 0.0);
  }

  #[test]
  fn drift_and_distances() {
    let mut t = branched();
    t.set_embedding(&"r".into(), emb(&[1.0, 0.0])).unwrap();
    t.set_embedding(&"a".into(), emb(&[0.0, 1.0])).unwrap();
    t.set_embedding(&"b".into(), emb(&[-1.0, 0.0])).unwrap();
    full(&mut t);

    let r = &t.node(&"r".into()).unwrap().metrics;
    assert_eq!(r.drift_since_root, Some(0.0));
    assert_eq!(r.distance_from_parent, None);
    assert_eq!(r.sibling_continuation_rate, None);

    let a = &t.node(&"a".into()).unwrap().metrics;
    assert!((a.distance_from_parent.unwrap() - 1.0).abs() < 1e-9);
    assert!((a.drift_since_root.unwrap() - 1.0).abs() < 1e-9);
    assert_eq!(a.drift_acceleration, None);

    let b = &t.node(&"b".into()).unwrap().metrics;
    assert!((b.drift_since_root.unwrap() - 2.0).abs() < 1e-9);
    // 2 − 2·1 + 0
    assert!(b.drift_acceleration.unwrap().abs() < 1e-9);
    // b's sibling p has no embedding.
    assert_eq!(b.avg_sibling_distance, None);

    // Missing embeddings yield nulls, not errors.
    let z = &t.node(&"z".into()).unwrap().metrics;
    assert_eq!(z.drift_since_root, None);
    assert!(z.cognitive_load.is_some());
  }

  #[test]
  fn shape_metrics() {
    let mut t = embedded();
    full(&mut t);
    // a's children b and p both continue.
    assert_eq!(t.node(&"p".into()).unwrap().metrics.sibling_continuation_rate, Some(1.0));
    // b's children: c continues, x continues.
    assert_eq!(t.node(&"c".into()).unwrap().metrics.sibling_continuation_rate, Some(1.0));
    // c's only child d is a leaf.
    assert_eq!(t.node(&"d".into()).unwrap().metrics.sibling_continuation_rate, Some(0.0));
    assert_eq!(t.node(&"d".into()).unwrap().metrics.avg_sibling_distance, Some(0.0));
    assert_eq!(t.node(&"x".into()).unwrap().metrics.seconds_since_parent, Some(30.0));
    assert!(t.node(&"x".into()).unwrap().metrics.distance_from_mainline.is_some());
    assert_eq!(t.node(&"c".into()).unwrap().metrics.distance_from_mainline, None);
    assert!(t.conversation().tension_score.is_some());
  }

  #[test]
  fn spark_is_normalized() {
    let mut t = embedded();
    full(&mut t);
    for n in t.nodes() {
      let s = n.metrics.spark_factor.unwrap();
      assert!((0.0..=1.0).contains(&s), "{} spark {s}", n.id);
    }
  }

  #[test]
  fn cognitive_load_is_monotonic() {
    let e = engine();
    assert!(e.cognitive_load(100, 120.0, 0) > e.cognitive_load(100, 60.0, 0));
    assert!(e.cognitive_load(100, 60.0, 2) > e.cognitive_load(100, 60.0, 1));
  }

  #[test]
  fn edits_deepen_the_chain() {
    let mut t = branched();
    let edit = NodeInput::new("b3", Some("a".into()), Role::User, "", at(100));
    t.insert(edit, false).unwrap();
    let b3 = t.node(&"b3".into()).unwrap();
    // b3 replaces p, which replaces b.
    assert_eq!(edit_chain_depth(&t, b3).unwrap(), 2);
  }

  #[test]
  fn strict_versions_reject_mixed_comparisons() {
    let mut t = embedded();
    t.set_embedding(&"a".into(), Embedding::new(unit(5.0), ModelVersion::new("other"))).unwrap();
    let pass = engine().recompute_all(&t).unwrap();
    assert!(pass.version_mismatches > 0);

    let mut cfg = CartaConfig::default();
    cfg.embedding.strict_versions = true;
    let err = MetricsEngine::new(&cfg).recompute_all(&t).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
  }

  #[test]
  fn incremental_matches_full_recompute() {
    let mut t = embedded();
    full(&mut t);

    let mut input = NodeInput::new("w", Some("x".into()), Role::User, "a fresh branch", at(500));
    input.embedding = Some(emb(&unit(200.0)));
    t.insert(input, false).unwrap();

    let changed = BTreeSet::from([NodeId::from("w")]);
    let scope = affected(&t, &changed);
    assert!(scope.len() < t.len());
    engine().recompute(&t, &changed).unwrap().apply(&mut t).unwrap();

    let fresh = engine().recompute_all(&t).unwrap();
    for n in t.nodes() {
      assert_eq!(&n.metrics, &fresh.nodes[&n.id], "node {}", n.id);
    }
    assert_eq!(t.conversation().tension_score, fresh.tension_score);
  }

  #[test]
  fn root_change_touches_everything() {
    let t = embedded();
    let scope = affected(&t, &BTreeSet::from([NodeId::from("r")]));
    assert_eq!(scope.len(), t.len());
  }

  proptest! {
    #[test]
    fn recompute_is_idempotent(angles in prop::collection::vec(0.0f64..360.0, 10)) {
      let mut t = branched();
      let ids: Vec<NodeId> = t.node_ids().to_vec();
      for (id, deg) in ids.iter().zip(&angles) {
        t.set_embedding(id, emb(&unit(*deg))).unwrap();
      }
      let first = engine().recompute_all(&t).unwrap();
      first.apply(&mut t).unwrap();
      let second = engine().recompute_all(&t).unwrap();
      prop_assert_eq!(&first.nodes, &second.nodes);
      prop_assert_eq!(first.tension_score, second.tension_score);
    }
  }
}
