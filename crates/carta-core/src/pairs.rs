//! The pair deriver: one [`Pair`] per prompt→response edge.
//!
//! Pair metrics read node metrics (drift, spark), so pairs are derived after
//! the metrics pass that refreshed those nodes.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::{
  config::{CartaConfig, TraversalConfig},
  conversation::{Node, NodeId, Role},
  metrics::mean,
  pair::{Pair, PairId, PairMetrics},
  traversal::Traversal,
  tree::ConversationTree,
  vector::{Embedding, cosine_distance, cosine_similarity, dot, l2_norm, mean_normalized},
  Error, Result,
};

/// Shift added to coherence shares so that fully incoherent responses keep
/// a non-zero share.
const SHARE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct PairDeriver {
  prompt_role:     Role,
  response_role:   Role,
  axis:            Option<Vec<f32>>,
  decay:           f64,
  strict_versions: bool,
  limits:          TraversalConfig,
}

impl PairDeriver {
  pub fn new(config: &CartaConfig) -> Self {
    Self {
      prompt_role:     config.pairs.prompt_role.clone(),
      response_role:   config.pairs.response_role.clone(),
      axis:            config.metrics.abstraction_axis.clone(),
      decay:           config.metrics.downstream_decay,
      strict_versions: config.embedding.strict_versions,
      limits:          config.traversal.clone(),
    }
  }

  pub fn is_pair_edge(&self, prompt: &Node, response: &Node) -> bool {
    prompt.role == self.prompt_role
      && response.role == self.response_role
      && response.parent_id.as_ref() == Some(&prompt.id)
  }

  /// Pairs for every qualifying edge of the conversation.
  pub fn derive_all(&self, tree: &ConversationTree) -> Result<Vec<Pair>> {
    let responses = tree.node_ids().iter().cloned().collect();
    self.derive(tree, &responses)
  }

  /// Pairs whose response is in `responses`; other ids are skipped.
  pub fn derive(&self, tree: &ConversationTree, responses: &BTreeSet<NodeId>) -> Result<Vec<Pair>> {
    let mut mismatches = 0;
    let mut out = Vec::new();
    for id in responses {
      let Some(response) = tree.node(id) else { continue };
      let Some(prompt) = tree.parent(id) else { continue };
      if self.is_pair_edge(prompt, response) {
        out.push(self.derive_one(tree, prompt, response, &mut mismatches)?);
      }
    }
    if mismatches > 0 {
      warn!(
        conversation = %tree.id(),
        comparisons = mismatches,
        "pair metrics compared embeddings from different model versions"
      );
    }
    debug!(conversation = %tree.id(), pairs = out.len(), "derived pairs");
    Ok(out)
  }

  /// Response ids whose pairs read anything from the nodes in `touched`.
  pub fn scope_for(&self, tree: &ConversationTree, touched: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    let mut out = BTreeSet::new();
    for id in touched {
      let Some(node) = tree.node(id) else { continue };
      out.insert(id.clone());
      for child in tree.children(id) {
        out.insert(child.clone());
        out.extend(tree.children(child).iter().cloned());
      }
      if let Some(parent) = &node.parent_id {
        out.extend(tree.children(parent).iter().cloned());
      }
      // Downstream spark of ancestors within the influence window.
      out.extend(node.ancestor_path.iter().rev().take(self.limits.influence_depth).cloned());
    }
    out
  }

  fn derive_one(
    &self,
    tree: &ConversationTree,
    prompt: &Node,
    response: &Node,
    mismatches: &mut usize,
  ) -> Result<Pair> {
    let id = PairId::for_edge(&prompt.id, &response.id);
    let existing = tree.pair(&id);
    let supplied = existing.filter(|p| !p.embedding_derived).and_then(|p| p.embedding.clone());
    let from_embedder = supplied.is_some();
    let embedding = match supplied {
      Some(e) => Some(e),
      None => self.derived_embedding(prompt, response, mismatches)?,
    };
    let derived = !from_embedder && embedding.is_some();

    let mut metrics = PairMetrics {
      coherence_score: self.similarity(prompt, response, mismatches)?,
      drift_from_root: response.metrics.drift_since_root,
      turn_latency: Some(seconds_between(prompt, response)),
      ..Default::default()
    };

    let previous = tree.parent(&prompt.id).and_then(|pr| {
      let pp = tree.parent(&pr.id)?;
      self.is_pair_edge(pp, pr).then_some((pp, pr))
    });
    if let (Some(e), Some((pp, pr))) = (&embedding, previous)
      && let Some(prev) = self.pair_embedding(tree, pp, pr, mismatches)?
    {
      self.check(e, &prev, mismatches)?;
      metrics.semantic_drift = Some(cosine_distance(&e.values, &prev.values));
    }

    if let Some(pp) = tree.parent(&prompt.id) {
      metrics.dialogic_continuity = self.similarity(prompt, pp, mismatches)?;
      metrics.time_since_previous_pair = Some(seconds_between(pp, prompt));
    }
    metrics.abstraction_delta = self.abstraction_delta(prompt, response)?;
    metrics.relative_entropy_to_siblings = self.relative_entropy(tree, prompt, response, mismatches)?;
    metrics.downstream_spark_factor = self.downstream_spark(tree, &response.id)?;

    let alternatives = tree
      .child_nodes(&prompt.id)
      .filter(|c| c.id != response.id && self.is_pair_edge(prompt, c))
      .count();
    let turn_number = response.turn_number / 2;
    let divergence_turn = response
      .mainline_divergence_point
      .as_ref()
      .and_then(|d| tree.node(d))
      .map(|d| d.turn_number);

    Ok(Pair {
      id,
      conversation_id: tree.id().clone(),
      prompt_id: prompt.id.clone(),
      response_id: response.id.clone(),
      is_mainline: response.is_mainline,
      is_alternate: !response.is_mainline,
      is_terminal_arc: tree.children(&response.id).is_empty(),
      alternative_count: alternatives,
      branch_depth: response.branch_depth,
      divergence_point: response.mainline_divergence_point.clone(),
      divergence_turn,
      exchange_position_in_branch: if response.is_mainline {
        turn_number
      } else {
        response.branch_depth.div_ceil(2)
      },
      turn_number,
      embedding,
      embedding_derived: derived,
      metrics,
    })
  }

  fn check(&self, a: &Embedding, b: &Embedding, mismatches: &mut usize) -> Result<()> {
    if a.comparable_with(b, self.strict_versions)? {
      *mismatches += 1;
    }
    Ok(())
  }

  fn similarity(&self, a: &Node, b: &Node, mismatches: &mut usize) -> Result<Option<f64>> {
    let (Some(x), Some(y)) = (&a.embedding, &b.embedding) else {
      return Ok(None);
    };
    self.check(x, y, mismatches)?;
    Ok(Some(cosine_similarity(&x.values, &y.values)))
  }

  /// Unit mean of the two node vectors, tagged with the response's model.
  fn derived_embedding(
    &self,
    prompt: &Node,
    response: &Node,
    mismatches: &mut usize,
  ) -> Result<Option<Embedding>> {
    let (Some(p), Some(r)) = (&prompt.embedding, &response.embedding) else {
      return Ok(None);
    };
    self.check(p, r, mismatches)?;
    Ok(Some(Embedding::new(mean_normalized(&p.values, &r.values), r.model_version.clone())))
  }

  fn pair_embedding(
    &self,
    tree: &ConversationTree,
    prompt: &Node,
    response: &Node,
    mismatches: &mut usize,
  ) -> Result<Option<Embedding>> {
    let stored = tree
      .pair_for_edge(&prompt.id, &response.id)
      .filter(|p| !p.embedding_derived)
      .and_then(|p| p.embedding.clone());
    match stored {
      Some(e) => Ok(Some(e)),
      None => self.derived_embedding(prompt, response, mismatches),
    }
  }

  /// Signed projection of `response − prompt` onto the abstraction axis.
  fn abstraction_delta(&self, prompt: &Node, response: &Node) -> Result<Option<f64>> {
    let (Some(axis), Some(p), Some(r)) = (&self.axis, &prompt.embedding, &response.embedding) else {
      return Ok(None);
    };
    for e in [p, r] {
      if e.dimension() != axis.len() {
        return Err(Error::DimensionMismatch { expected: axis.len(), found: e.dimension() });
      }
    }
    let delta: Vec<f32> = r.values.iter().zip(&p.values).map(|(r, p)| r - p).collect();
    Ok(Some(dot(&delta, axis) / l2_norm(axis)))
  }

  /// `q·ln(q·k)` where `q` is this response's share of the shifted
  /// coherence mass among the `k` embedded responses to the same prompt.
  fn relative_entropy(
    &self,
    tree: &ConversationTree,
    prompt: &Node,
    response: &Node,
    mismatches: &mut usize,
  ) -> Result<Option<f64>> {
    let mut own = None;
    let mut shares = Vec::new();
    for r in tree.child_nodes(&prompt.id).filter(|c| self.is_pair_edge(prompt, c)) {
      if let Some(c) = self.similarity(prompt, r, mismatches)? {
        let share = (c + 1.0) / 2.0 + SHARE_EPSILON;
        if r.id == response.id {
          own = Some(share);
        }
        shares.push(share);
      }
    }
    let Some(own) = own else { return Ok(None) };
    let total: f64 = shares.iter().sum();
    let q = own / total;
    Ok(Some(q * (q * shares.len() as f64).ln()))
  }

  /// Decay-weighted mean of descendant spark within the influence window.
  fn downstream_spark(&self, tree: &ConversationTree, response: &NodeId) -> Result<Option<f64>> {
    let below = Traversal::new(tree, &self.limits).descendants(response, Some(self.limits.influence_depth))?;
    let (mut weighted, mut weights) = (0.0, 0.0);
    for d in below {
      let Some(spark) = tree.node(&d.id).and_then(|n| n.metrics.spark_factor) else {
        continue;
      };
      let w = self.decay.powi(d.depth as i32 - 1);
      weighted += w * spark;
      weights += w;
    }
    Ok((weights > 0.0).then(|| weighted / weights))
  }
}

fn seconds_between(earlier: &Node, later: &Node) -> f64 {
  (later.created_at - earlier.created_at).num_milliseconds() as f64 / 1000.0
}

/// Mean coherence over the pairs that have one.
pub fn mean_coherence<'p>(pairs: impl Iterator<Item = &'p Pair>) -> Option<f64> {
  let values: Vec<f64> = pairs.filter_map(|p| p.metrics.coherence_score).collect();
  mean(&values)
}
