//! Filtered nearest-neighbour search over node and pair embeddings.
//!
//! One vector set is kept per `(entity kind, model version)`, so a search
//! only ever scores vectors produced by the query's own model. Vectors are
//! stored unit-normalised; a vector therefore scores itself maximally under
//! every [`SimilarityMetric`]. Structural filters (conversation, exclusion
//! set, predicate) are applied before any vector is scored.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  conversation::{ConversationId, Node, Role},
  pair::Pair,
  vector::{Embedding, ModelVersion, SimilarityMetric, normalized},
  Error, Result,
};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Node,
  Pair,
}

/// Structural attributes a search predicate can filter on.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexAttributes {
  pub conversation_id: ConversationId,
  /// Author role; `None` for pairs.
  pub role:            Option<Role>,
  pub is_mainline:     bool,
  pub branch_depth:    usize,
  pub turn_number:     usize,
}

impl IndexAttributes {
  pub fn of_node(node: &Node) -> Self {
    Self {
      conversation_id: node.conversation_id.clone(),
      role:            Some(node.role.clone()),
      is_mainline:     node.is_mainline,
      branch_depth:    node.branch_depth,
      turn_number:     node.turn_number,
    }
  }

  pub fn of_pair(pair: &Pair) -> Self {
    Self {
      conversation_id: pair.conversation_id.clone(),
      role:            None,
      is_mainline:     pair.is_mainline,
      branch_depth:    pair.branch_depth,
      turn_number:     pair.turn_number,
    }
  }
}

pub type Predicate<'q> = &'q (dyn Fn(&IndexAttributes) -> bool + Send + Sync);

/// Parameters for [`SimilarityIndex::search`].
#[derive(Clone, Copy)]
pub struct SearchRequest<'q> {
  pub query:        &'q Embedding,
  pub k:            usize,
  pub metric:       SimilarityMetric,
  /// Restrict to one conversation.
  pub conversation: Option<&'q ConversationId>,
  pub exclude:      &'q [ConversationId],
  pub predicate:    Option<Predicate<'q>>,
  /// Drop hits scoring below this value.
  pub min_score:    Option<f64>,
}

impl<'q> SearchRequest<'q> {
  pub fn new(query: &'q Embedding, k: usize) -> Self {
    Self {
      query,
      k,
      metric: SimilarityMetric::default(),
      conversation: None,
      exclude: &[],
      predicate: None,
      min_score: None,
    }
  }

  #[must_use]
  pub fn metric(mut self, metric: SimilarityMetric) -> Self {
    self.metric = metric;
    self
  }

  #[must_use]
  pub fn in_conversation(mut self, id: &'q ConversationId) -> Self {
    self.conversation = Some(id);
    self
  }

  #[must_use]
  pub fn excluding(mut self, ids: &'q [ConversationId]) -> Self {
    self.exclude = ids;
    self
  }

  #[must_use]
  pub fn filter(mut self, predicate: Predicate<'q>) -> Self {
    self.predicate = Some(predicate);
    self
  }

  #[must_use]
  pub fn min_score(mut self, min: f64) -> Self {
    self.min_score = Some(min);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
  pub id:              String,
  pub conversation_id: ConversationId,
  pub score:           f64,
  pub model_version:   ModelVersion,
}

#[derive(Debug, Clone)]
struct Entry {
  vector: Vec<f32>,
  attrs:  IndexAttributes,
}

#[derive(Debug, Clone)]
struct VectorSet {
  dimension:       usize,
  entries:         BTreeMap<String, Entry>,
  by_conversation: HashMap<ConversationId, BTreeSet<String>>,
}

impl VectorSet {
  fn new(dimension: usize) -> Self {
    Self { dimension, entries: BTreeMap::new(), by_conversation: HashMap::new() }
  }

  fn remove(&mut self, id: &str) -> bool {
    let Some(entry) = self.entries.remove(id) else { return false };
    if let Some(ids) = self.by_conversation.get_mut(&entry.attrs.conversation_id) {
      ids.remove(id);
      if ids.is_empty() {
        self.by_conversation.remove(&entry.attrs.conversation_id);
      }
    }
    true
  }
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityIndex {
  /// Deployment-wide dimensionality, when configured.
  dimension: Option<usize>,
  sets:      BTreeMap<(EntityKind, ModelVersion), VectorSet>,
  /// Which version set currently holds each id.
  location:  HashMap<(EntityKind, String), ModelVersion>,
}

impl SimilarityIndex {
  pub fn new(dimension: Option<usize>) -> Self { Self { dimension, ..Self::default() } }

  pub fn len(&self, kind: EntityKind) -> usize {
    self.sets.iter().filter(|((k, _), _)| *k == kind).map(|(_, s)| s.entries.len()).sum()
  }

  pub fn is_empty(&self) -> bool { self.location.is_empty() }

  pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
    self.location.contains_key(&(kind, id.to_owned()))
  }

  /// Model versions with at least one indexed vector of `kind`.
  pub fn versions(&self, kind: EntityKind) -> Vec<ModelVersion> {
    self
      .sets
      .iter()
      .filter(|((k, _), s)| *k == kind && !s.entries.is_empty())
      .map(|((_, v), _)| v.clone())
      .collect()
  }

  /// Fail unless `embedding` fits its version set; returns the set's
  /// dimensionality.
  pub fn check(&self, kind: EntityKind, embedding: &Embedding) -> Result<usize> {
    let expected = self
      .sets
      .get(&(kind, embedding.model_version.clone()))
      .map(|s| s.dimension)
      .or(self.dimension)
      .unwrap_or(embedding.dimension());
    if embedding.dimension() != expected || expected == 0 {
      return Err(Error::DimensionMismatch { expected, found: embedding.dimension() });
    }
    Ok(expected)
  }

  /// [`check`](Self::check) `embedding` and fix its set's dimensionality
  /// now, before any vector is inserted. A later vector of the same version
  /// with another dimensionality fails here rather than at upsert.
  pub fn reserve(&mut self, kind: EntityKind, embedding: &Embedding) -> Result<usize> {
    let expected = self.check(kind, embedding)?;
    self
      .sets
      .entry((kind, embedding.model_version.clone()))
      .or_insert_with(|| VectorSet::new(expected));
    Ok(expected)
  }

  /// Insert or replace the vector for `id`. The first vector of a version
  /// set fixes its dimensionality.
  pub fn upsert(
    &mut self,
    kind: EntityKind,
    id: impl Into<String>,
    embedding: &Embedding,
    attrs: IndexAttributes,
  ) -> Result<()> {
    let id = id.into();
    let version = embedding.model_version.clone();
    let expected = self.check(kind, embedding)?;

    let key = (kind, id.clone());
    if let Some(previous) = self.location.get(&key)
      && *previous != version
      && let Some(set) = self.sets.get_mut(&(kind, previous.clone()))
    {
      set.remove(&id);
    }

    let set = self.sets.entry((kind, version.clone())).or_insert_with(|| VectorSet::new(expected));
    set.remove(&id);
    set
      .by_conversation
      .entry(attrs.conversation_id.clone())
      .or_default()
      .insert(id.clone());
    set.entries.insert(id, Entry { vector: normalized(&embedding.values), attrs });
    self.location.insert(key, version);
    Ok(())
  }

  pub fn remove(&mut self, kind: EntityKind, id: &str) -> bool {
    let Some(version) = self.location.remove(&(kind, id.to_owned())) else {
      return false;
    };
    self.sets.get_mut(&(kind, version)).is_some_and(|s| s.remove(id))
  }

  /// Drop every vector belonging to `conversation`; returns how many.
  pub fn remove_conversation(&mut self, conversation: &ConversationId) -> usize {
    let mut removed = 0;
    for ((kind, _), set) in &mut self.sets {
      let Some(ids) = set.by_conversation.remove(conversation) else { continue };
      for id in ids {
        set.entries.remove(&id);
        self.location.remove(&(*kind, id));
        removed += 1;
      }
    }
    debug!(conversation = %conversation, removed, "purged conversation from index");
    removed
  }

  /// Top-`k` vectors of `kind` and the query's model version, best first;
  /// equal scores are ordered by ascending id.
  pub fn search(&self, kind: EntityKind, req: &SearchRequest<'_>) -> Result<Vec<SearchHit>> {
    let version = &req.query.model_version;
    let Some(set) = self.sets.get(&(kind, version.clone())) else {
      return Ok(Vec::new());
    };
    if req.query.dimension() != set.dimension {
      return Err(Error::DimensionMismatch {
        expected: set.dimension,
        found:    req.query.dimension(),
      });
    }
    if req.k == 0 {
      return Ok(Vec::new());
    }

    let candidates: Box<dyn Iterator<Item = (&String, &Entry)> + '_> = match req.conversation {
      Some(cid) => Box::new(
        set
          .by_conversation
          .get(cid)
          .into_iter()
          .flatten()
          .filter_map(|id| set.entries.get_key_value(id)),
      ),
      None => Box::new(set.entries.iter()),
    };

    let query = normalized(&req.query.values);
    let mut hits: Vec<SearchHit> = candidates
      .filter(|(_, e)| !req.exclude.contains(&e.attrs.conversation_id))
      .filter(|(_, e)| req.predicate.is_none_or(|p| p(&e.attrs)))
      .map(|(id, e)| SearchHit {
        id:              id.clone(),
        conversation_id: e.attrs.conversation_id.clone(),
        score:           req.metric.score(&query, &e.vector),
        model_version:   version.clone(),
      })
      .filter(|h| req.min_score.is_none_or(|min| h.score >= min))
      .collect();

    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(req.k);
    Ok(hits)
  }
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;

  fn emb(values: &[f32]) -> Embedding { Embedding::new(values.to_vec(), ModelVersion::new("m1")) }

  fn attrs(conversation: &str, depth: usize) -> IndexAttributes {
    IndexAttributes {
      conversation_id: conversation.into(),
      role:            Some(Role::User),
      is_mainline:     depth == 0,
      branch_depth:    depth,
      turn_number:     1,
    }
  }

  fn unit(deg: f64) -> Vec<f32> {
    let r = deg.to_radians();
    vec![r.cos() as f32, r.sin() as f32]
  }

  #[test]
  fn threshold_search_returns_only_matches_in_order() {
    let mut idx = SimilarityIndex::new(None);
    // cos(θ) ≥ 0.7 for θ ≤ 45.57°.
    let angles = [10.0, 80.0, 30.0, 120.0, 0.0, 170.0, 44.0, 60.0, 90.0, 100.0];
    for (i, deg) in angles.iter().enumerate() {
      idx.upsert(EntityKind::Node, format!("n{i}"), &emb(&unit(*deg)), attrs("c", 0)).unwrap();
    }
    let query = emb(&[1.0, 0.0]);
    let hits = idx.search(EntityKind::Node, &SearchRequest::new(&query, 10).min_score(0.7)).unwrap();
    let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, ["n4", "n0", "n2", "n6"]);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
  }

  #[test]
  fn ties_break_by_ascending_id() {
    let mut idx = SimilarityIndex::new(None);
    for id in ["b", "c", "a"] {
      idx.upsert(EntityKind::Node, id, &emb(&[0.0, 1.0]), attrs("c", 0)).unwrap();
    }
    let query = emb(&[0.0, 1.0]);
    let hits = idx.search(EntityKind::Node, &SearchRequest::new(&query, 2)).unwrap();
    assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
  }

  #[test]
  fn versions_are_never_mixed() {
    let mut idx = SimilarityIndex::new(None);
    idx.upsert(EntityKind::Node, "old", &emb(&[1.0, 0.0]), attrs("c", 0)).unwrap();
    let v2 = Embedding::new(vec![1.0, 0.0, 0.0], ModelVersion::new("m2"));
    idx.upsert(EntityKind::Node, "new", &v2, attrs("c", 0)).unwrap();

    let hits = idx.search(EntityKind::Node, &SearchRequest::new(&v2, 5)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].model_version.as_str(), "m2");

    // Re-embedding under the new model moves the id.
    idx.upsert(EntityKind::Node, "old", &v2, attrs("c", 0)).unwrap();
    assert_eq!(idx.search(EntityKind::Node, &SearchRequest::new(&emb(&[1.0, 0.0]), 5)).unwrap(), vec![]);
    assert_eq!(idx.len(EntityKind::Node), 2);
    assert_eq!(idx.versions(EntityKind::Node), [ModelVersion::new("m2")]);
  }

  #[test]
  fn metrics_rank_alike_and_differ_in_scale() {
    let mut idx = SimilarityIndex::new(None);
    // Magnitudes are discarded on insert.
    for (i, (deg, scale)) in [(0.0, 5.0), (30.0, 0.1), (75.0, 2.0), (140.0, 1.0)].iter().enumerate() {
      let v: Vec<f32> = unit(*deg).iter().map(|x| x * *scale as f32).collect();
      idx.upsert(EntityKind::Node, format!("n{i}"), &emb(&v), attrs("c", 0)).unwrap();
    }
    let query = emb(&unit(10.0));
    let ranked = |metric| {
      idx.search(EntityKind::Node, &SearchRequest::new(&query, 4).metric(metric)).unwrap()
    };
    let cosine = ranked(SimilarityMetric::Cosine);
    let ids: Vec<_> = cosine.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, ["n0", "n1", "n2", "n3"]);

    for metric in [SimilarityMetric::Euclidean, SimilarityMetric::InnerProduct] {
      let hits = ranked(metric);
      assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), ids, "{metric:?}");
    }
    let inner = ranked(SimilarityMetric::InnerProduct);
    for (c, i) in cosine.iter().zip(&inner) {
      assert!((c.score - i.score).abs() < 1e-6);
    }
    assert!(ranked(SimilarityMetric::Euclidean).iter().all(|h| h.score > 0.0 && h.score <= 1.0));
  }

  #[test]
  fn reservation_fixes_dimension_before_insert() {
    let mut idx = SimilarityIndex::new(None);
    assert_eq!(idx.reserve(EntityKind::Node, &emb(&[1.0, 0.0])).unwrap(), 2);
    assert!(idx.versions(EntityKind::Node).is_empty());
    assert!(idx.is_empty());

    let err = idx.reserve(EntityKind::Node, &emb(&[1.0, 0.0, 0.0])).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 2, found: 3 }));
    assert!(idx.upsert(EntityKind::Node, "a", &emb(&[0.0, 1.0, 0.0]), attrs("c", 0)).is_err());
    idx.upsert(EntityKind::Node, "a", &emb(&[0.0, 1.0]), attrs("c", 0)).unwrap();
    // Pairs keep their own sets.
    assert_eq!(idx.reserve(EntityKind::Pair, &emb(&[1.0, 0.0, 0.0])).unwrap(), 3);
  }

  #[test]
  fn dimension_is_fixed_per_set() {
    let mut idx = SimilarityIndex::new(None);
    idx.upsert(EntityKind::Node, "a", &emb(&[1.0, 0.0]), attrs("c", 0)).unwrap();
    let err = idx.upsert(EntityKind::Node, "b", &emb(&[1.0, 0.0, 0.0]), attrs("c", 0)).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 2, found: 3 }));

    let err = idx.search(EntityKind::Node, &SearchRequest::new(&emb(&[1.0]), 1)).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { .. }));

    let mut fixed = SimilarityIndex::new(Some(3));
    assert!(fixed.upsert(EntityKind::Pair, "p", &emb(&[1.0, 0.0]), attrs("c", 0)).is_err());
  }

  #[test]
  fn filters_apply_before_scoring() {
    let mut idx = SimilarityIndex::new(None);
    idx.upsert(EntityKind::Node, "a1", &emb(&[1.0, 0.0]), attrs("a", 0)).unwrap();
    idx.upsert(EntityKind::Node, "a2", &emb(&[1.0, 0.1]), attrs("a", 2)).unwrap();
    idx.upsert(EntityKind::Node, "b1", &emb(&[1.0, 0.0]), attrs("b", 0)).unwrap();
    let query = emb(&[1.0, 0.0]);

    let a = ConversationId::from("a");
    let hits = idx.search(EntityKind::Node, &SearchRequest::new(&query, 10).in_conversation(&a)).unwrap();
    assert_eq!(hits.len(), 2);

    let exclude = [a.clone()];
    let hits = idx.search(EntityKind::Node, &SearchRequest::new(&query, 10).excluding(&exclude)).unwrap();
    assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), ["b1"]);

    let deep = |a: &IndexAttributes| a.branch_depth > 1;
    let hits = idx.search(EntityKind::Node, &SearchRequest::new(&query, 10).filter(&deep)).unwrap();
    assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), ["a2"]);

    // Pairs live in their own sets.
    assert!(idx.search(EntityKind::Pair, &SearchRequest::new(&query, 10)).unwrap().is_empty());
  }

  #[test]
  fn conversation_purge() {
    let mut idx = SimilarityIndex::new(None);
    idx.upsert(EntityKind::Node, "a1", &emb(&[1.0, 0.0]), attrs("a", 0)).unwrap();
    idx.upsert(EntityKind::Pair, "a1_a2", &emb(&[1.0, 0.0]), attrs("a", 0)).unwrap();
    idx.upsert(EntityKind::Node, "b1", &emb(&[1.0, 0.0]), attrs("b", 0)).unwrap();
    assert_eq!(idx.remove_conversation(&"a".into()), 2);
    assert!(!idx.contains(EntityKind::Node, "a1"));
    assert!(idx.contains(EntityKind::Node, "b1"));
    assert!(idx.remove(EntityKind::Node, "b1"));
    assert!(idx.is_empty());
  }

  proptest! {
    #[test]
    fn a_vector_is_its_own_nearest_neighbour(
      vectors in prop::collection::vec(prop::collection::vec(-1.0f32..1.0, 4), 2..20),
      pick in any::<prop::sample::Index>(),
    ) {
      prop_assume!(vectors.iter().all(|v| v.iter().any(|x| x.abs() > 1e-3)));
      for metric in [SimilarityMetric::Cosine, SimilarityMetric::Euclidean, SimilarityMetric::InnerProduct] {
        let mut idx = SimilarityIndex::new(None);
        for (i, v) in vectors.iter().enumerate() {
          idx.upsert(EntityKind::Node, format!("{i:03}"), &emb(v), attrs("c", 0)).unwrap();
        }
        let i = pick.index(vectors.len());
        let query = emb(&vectors[i]);
        let hits = idx.search(EntityKind::Node, &SearchRequest::new(&query, vectors.len()).metric(metric)).unwrap();
        let own = hits.iter().find(|h| h.id == format!("{i:03}")).unwrap().score;
        prop_assert!(hits.iter().all(|h| h.score <= own + 1e-6), "{metric:?}");
      }
    }
  }
}
