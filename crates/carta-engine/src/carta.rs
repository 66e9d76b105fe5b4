//! The [`Carta`] façade.
//!
//! Writes to one conversation are serialised behind a per-conversation
//! mutex; writes to different conversations never contend. Every write
//! records the nodes it touched as pending, and metrics stay null until an
//! incremental pass (on demand or in the [`MetricsWorker`]) folds the
//! pending set in. Reads work on tree snapshots and never take a writer
//! lock.
//!
//! A write reaches the store in several calls, each atomic on its own, in a
//! fixed order. `append_nodes` publishes the nodes, then their pairs, then
//! the conversation envelope. A metrics pass publishes node metrics and
//! tension, then pairs, then ancestry rows. A concurrent reader may see the
//! earlier steps of a write before the later ones land; [`Carta::ancestry`]
//! walks the tree live while rows are missing.

use std::{
  collections::{BTreeSet, HashMap},
  sync::Arc,
};

use carta_core::{
  Error, ErrorKind, Result,
  ancestry::{AncestryPath, materialize},
  config::CartaConfig,
  conversation::{Conversation, ConversationId, Node, NodeId, NodeMetrics},
  index::{EntityKind, IndexAttributes, SearchHit, SearchRequest, SimilarityIndex},
  ingest::{IngestBatch, NodeInput, build_tree},
  metrics::MetricsEngine,
  pair::{Pair, PairId},
  pairs::PairDeriver,
  score::{Normalizer, Signal, weighted_sum},
  stats::{self, BranchStatistics, ConversationSummary, TurnDrift},
  store::{ConversationStore, NodeQuery},
  traversal::{AlternatePath, BranchMember, Descendant, Traversal},
  tree::ConversationTree,
  vector::{Embedding, ModelVersion},
};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::{
  query::{
    CompositeHit, CompositeQuery, NodeHit, PairHit, PatternHit, PatternQuery, SimilarityQuery,
  },
  worker::MetricsWorker,
};

/// Signals a composite query can weigh.
const COMPOSITE_SIGNALS: [Signal; 6] = [
  Signal::Similarity,
  Signal::Spark,
  Signal::Entropy,
  Signal::Drift,
  Signal::DriftAcceleration,
  Signal::CognitiveLoad,
];

/// Summary of one metrics pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshOutcome {
  pub conversation_id: ConversationId,
  pub nodes_updated:   usize,
  pub pairs_updated:   usize,
  /// Spark was renormalised across the whole conversation.
  pub rescaled:        bool,
  pub tension_score:   Option<f64>,
}

impl RefreshOutcome {
  fn idle(tree: &ConversationTree) -> Self {
    Self {
      conversation_id: tree.id().clone(),
      nodes_updated:   0,
      pairs_updated:   0,
      rescaled:        false,
      tension_score:   tree.conversation().tension_score,
    }
  }
}

pub(crate) struct Inner<S> {
  store:   S,
  config:  CartaConfig,
  metrics: MetricsEngine,
  pairs:   PairDeriver,
  index:   RwLock<SimilarityIndex>,
  writers: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
  pending: Mutex<HashMap<ConversationId, BTreeSet<NodeId>>>,
  notify:  Mutex<Option<mpsc::UnboundedSender<ConversationId>>>,
}

/// Query façade over a [`ConversationStore`]. Cheap to clone.
pub struct Carta<S> {
  pub(crate) inner: Arc<Inner<S>>,
}

impl<S> Clone for Carta<S> {
  fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

fn backend<E: Into<Error>>(err: E) -> Error { err.into() }

/// Fail unless every vector fits the index, including vectors of the same
/// new model version that disagree with each other. On success the
/// dimensionality of every version seen is reserved, so a concurrent writer
/// cannot claim a different one before these vectors are indexed.
fn admit_vectors<'e>(
  index: &mut SimilarityIndex,
  kind: EntityKind,
  vectors: impl IntoIterator<Item = &'e Embedding>,
) -> Result<()> {
  let mut first: HashMap<&ModelVersion, &Embedding> = HashMap::new();
  let mut dims: HashMap<&ModelVersion, usize> = HashMap::new();
  for e in vectors {
    let expected = match dims.get(&e.model_version) {
      Some(d) => *d,
      None => index.check(kind, e)?,
    };
    if e.dimension() != expected {
      return Err(Error::DimensionMismatch { expected, found: e.dimension() });
    }
    dims.insert(&e.model_version, expected);
    first.entry(&e.model_version).or_insert(e);
  }
  for e in first.into_values() {
    index.reserve(kind, e)?;
  }
  Ok(())
}

fn node_signal(m: &NodeMetrics, signal: Signal) -> Option<f64> {
  match signal {
    Signal::Spark => m.spark_factor,
    Signal::Entropy => m.branch_entropy,
    Signal::Drift => m.drift_since_root,
    Signal::DriftAcceleration => m.drift_acceleration,
    Signal::CognitiveLoad => m.cognitive_load,
    Signal::Similarity | Signal::Coherence => None,
  }
}

/// `ids` plus every node below them.
fn with_descendants(tree: &ConversationTree, ids: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
  let mut out = BTreeSet::new();
  let mut stack: Vec<&NodeId> = ids.iter().collect();
  while let Some(id) = stack.pop() {
    if out.insert(id.clone()) {
      stack.extend(tree.children(id));
    }
  }
  out
}

impl<S: ConversationStore> Carta<S> {
  /// Wrap `store`. The similarity index starts empty; call
  /// [`rebuild_index`](Self::rebuild_index) when the store already holds
  /// embedded conversations.
  pub fn new(store: S, config: CartaConfig) -> Result<Self> {
    config.validate()?;
    let inner = Inner {
      metrics: MetricsEngine::new(&config),
      pairs: PairDeriver::new(&config),
      index: RwLock::new(SimilarityIndex::new(config.embedding.dimension)),
      writers: Mutex::new(HashMap::new()),
      pending: Mutex::new(HashMap::new()),
      notify: Mutex::new(None),
      store,
      config,
    };
    Ok(Self { inner: Arc::new(inner) })
  }

  pub fn config(&self) -> &CartaConfig { &self.inner.config }

  pub fn store(&self) -> &S { &self.inner.store }

  // ─── Internals ───────────────────────────────────────────────────────────

  pub(crate) async fn writer(&self, id: &ConversationId) -> Arc<Mutex<()>> {
    self.inner.writers.lock().await.entry(id.clone()).or_default().clone()
  }

  async fn tree(&self, id: &ConversationId) -> Result<Arc<ConversationTree>> {
    self
      .inner
      .store
      .load_tree(id)
      .await
      .map_err(backend)?
      .ok_or_else(|| Error::not_found(format!("conversation {id}")))
  }

  async fn mark_pending(&self, id: &ConversationId, nodes: impl IntoIterator<Item = NodeId>) {
    self.inner.pending.lock().await.entry(id.clone()).or_default().extend(nodes);
    if let Some(tx) = self.inner.notify.lock().await.as_ref()
      && tx.send(id.clone()).is_err()
    {
      debug!(conversation = %id, "metrics worker is gone; change stays pending");
    }
  }

  async fn take_pending(&self, id: &ConversationId) -> BTreeSet<NodeId> {
    self.inner.pending.lock().await.remove(id).unwrap_or_default()
  }

  /// Whether `id` has changes no metrics pass has seen yet.
  pub async fn is_pending(&self, id: &ConversationId) -> bool {
    self.inner.pending.lock().await.get(id).is_some_and(|p| !p.is_empty())
  }

  async fn index_nodes<'n>(&self, nodes: impl IntoIterator<Item = &'n Node>) -> Result<usize> {
    let mut index = self.inner.index.write().await;
    let mut n = 0;
    for node in nodes {
      if let Some(e) = &node.embedding {
        index.upsert(EntityKind::Node, node.id.as_str(), e, IndexAttributes::of_node(node))?;
        n += 1;
      }
    }
    Ok(n)
  }

  async fn index_pairs<'p>(&self, pairs: impl IntoIterator<Item = &'p Pair>) -> Result<usize> {
    let mut index = self.inner.index.write().await;
    let mut n = 0;
    for pair in pairs {
      if let Some(e) = &pair.embedding {
        index.upsert(EntityKind::Pair, pair.id.as_str(), e, IndexAttributes::of_pair(pair))?;
        n += 1;
      }
    }
    Ok(n)
  }

  /// Reload every stored embedding into the similarity index.
  pub async fn rebuild_index(&self) -> Result<usize> {
    let conversations = self.inner.store.list_conversations().await.map_err(backend)?;
    let mut total = 0;
    for c in conversations {
      let Some(tree) = self.inner.store.load_tree(&c.id).await.map_err(backend)? else {
        continue;
      };
      total += self.index_nodes(tree.nodes()).await?;
      total += self.index_pairs(tree.pairs()).await?;
    }
    info!(vectors = total, "rebuilt similarity index");
    Ok(total)
  }

  // ─── Writes ──────────────────────────────────────────────────────────────

  /// Build, persist and index a conversation delivered by the parser.
  ///
  /// Metrics are left null; every node is marked pending.
  pub async fn ingest(&self, batch: IngestBatch) -> Result<Conversation> {
    let mut tree = build_tree(batch, &self.inner.config.embedding)?;
    for pair in self.inner.pairs.derive_all(&tree)? {
      tree.upsert_pair(pair)?;
    }
    {
      let mut index = self.inner.index.write().await;
      admit_vectors(&mut index, EntityKind::Node, tree.nodes().filter_map(|n| n.embedding.as_ref()))?;
      admit_vectors(&mut index, EntityKind::Pair, tree.pairs().filter_map(|p| p.embedding.as_ref()))?;
    }

    let id = tree.id().clone();
    let writer = self.writer(&id).await;
    let _guard = writer.lock().await;
    self.inner.store.create_conversation(&tree).await.map_err(backend)?;

    let vectors = self.index_nodes(tree.nodes()).await? + self.index_pairs(tree.pairs()).await?;
    self.mark_pending(&id, tree.node_ids().iter().cloned()).await;
    info!(
      conversation = %id,
      nodes = tree.len(),
      pairs = tree.pairs().count(),
      vectors,
      "ingested conversation"
    );
    Ok(tree.conversation().clone())
  }

  /// Append nodes to an existing conversation, in order.
  ///
  /// A node extends the mainline only when its parent is the current
  /// mainline tip; otherwise it opens or continues a branch.
  pub async fn append_nodes(
    &self,
    conversation: &ConversationId,
    inputs: Vec<NodeInput>,
  ) -> Result<Vec<Node>> {
    if inputs.is_empty() {
      return Ok(Vec::new());
    }
    let writer = self.writer(conversation).await;
    let _guard = writer.lock().await;
    let mut tree = Arc::unwrap_or_clone(self.tree(conversation).await?);

    {
      let mut index = self.inner.index.write().await;
      admit_vectors(&mut index, EntityKind::Node, inputs.iter().filter_map(|i| i.embedding.as_ref()))?;
    }

    let mut inserted = Vec::with_capacity(inputs.len());
    for input in inputs {
      let mainline = match &input.parent_id {
        None => true,
        Some(parent) => {
          tree.conversation().current_node.as_ref() == Some(parent)
            && tree.mainline_child(parent).is_none()
        }
      };
      inserted.push(tree.insert(input, mainline)?);
    }
    let ids: BTreeSet<NodeId> = inserted.iter().map(|n| n.id.clone()).collect();
    let pairs = self.inner.pairs.derive(&tree, &ids)?;
    for pair in &pairs {
      tree.upsert_pair(pair.clone())?;
    }

    self.inner.store.insert_nodes(conversation, inserted.clone()).await.map_err(backend)?;
    if !pairs.is_empty() {
      self.inner.store.upsert_pairs(conversation, pairs.clone()).await.map_err(backend)?;
    }
    if let Some(latest) = inserted.iter().map(|n| n.created_at).max() {
      let envelope = tree.conversation_mut();
      envelope.updated_at = envelope.updated_at.max(latest);
    }
    self.inner.store.update_conversation(tree.conversation()).await.map_err(backend)?;

    self.index_nodes(&inserted).await?;
    self.index_pairs(&pairs).await?;
    self.mark_pending(conversation, ids).await;
    debug!(conversation = %conversation, nodes = inserted.len(), pairs = pairs.len(), "appended nodes");
    Ok(inserted)
  }

  /// Store vectors produced by the embedder for existing nodes.
  pub async fn attach_embeddings(
    &self,
    conversation: &ConversationId,
    embeddings: Vec<(NodeId, Embedding)>,
  ) -> Result<()> {
    if embeddings.is_empty() {
      return Ok(());
    }
    let writer = self.writer(conversation).await;
    let _guard = writer.lock().await;
    let mut tree = Arc::unwrap_or_clone(self.tree(conversation).await?);
    {
      let mut index = self.inner.index.write().await;
      admit_vectors(&mut index, EntityKind::Node, embeddings.iter().map(|(_, e)| e))?;
    }
    for (id, e) in &embeddings {
      tree.set_embedding(id, e.clone())?;
    }

    let ids: BTreeSet<NodeId> = embeddings.iter().map(|(id, _)| id.clone()).collect();
    self.inner.store.write_embeddings(conversation, embeddings).await.map_err(backend)?;
    self.index_nodes(ids.iter().filter_map(|id| tree.node(id))).await?;
    self.mark_pending(conversation, ids).await;
    Ok(())
  }

  /// Store embedder-supplied pair vectors. They replace the derived mean of
  /// the two node vectors from now on.
  pub async fn attach_pair_embeddings(
    &self,
    conversation: &ConversationId,
    embeddings: Vec<(PairId, Embedding)>,
  ) -> Result<()> {
    if embeddings.is_empty() {
      return Ok(());
    }
    let writer = self.writer(conversation).await;
    let _guard = writer.lock().await;
    let tree = self.tree(conversation).await?;
    {
      let mut index = self.inner.index.write().await;
      admit_vectors(&mut index, EntityKind::Pair, embeddings.iter().map(|(_, e)| e))?;
    }

    let mut pairs = Vec::with_capacity(embeddings.len());
    for (id, e) in embeddings {
      let mut pair = tree.pair(&id).cloned().ok_or_else(|| Error::not_found(format!("pair {id}")))?;
      pair.embedding = Some(e);
      pair.embedding_derived = false;
      pairs.push(pair);
    }
    let responses: Vec<NodeId> = pairs.iter().map(|p| p.response_id.clone()).collect();
    self.inner.store.upsert_pairs(conversation, pairs.clone()).await.map_err(backend)?;
    self.index_pairs(&pairs).await?;
    self.mark_pending(conversation, responses).await;
    Ok(())
  }

  /// Remove a conversation, everything it owns, and its index entries.
  pub async fn delete_conversation(&self, id: &ConversationId) -> Result<bool> {
    let writer = self.writer(id).await;
    let _guard = writer.lock().await;
    let existed = self.inner.store.delete_conversation(id).await.map_err(backend)?;
    let purged = self.inner.index.write().await.remove_conversation(id);
    self.inner.pending.lock().await.remove(id);
    // The writer entry stays: a writer queued on it must keep excluding one
    // that recreates the same id.
    if existed {
      info!(conversation = %id, purged, "deleted conversation");
    }
    Ok(existed)
  }

  // ─── Metrics ─────────────────────────────────────────────────────────────

  /// Fold the pending changes of `conversation` into its metrics.
  pub async fn refresh_metrics(&self, conversation: &ConversationId) -> Result<RefreshOutcome> {
    let writer = self.writer(conversation).await;
    let _guard = writer.lock().await;
    let changed = self.take_pending(conversation).await;
    let outcome = self.run_pass(conversation, Some(&changed)).await;
    if let Err(e) = &outcome
      && e.kind() != ErrorKind::NotFound
    {
      self.inner.pending.lock().await.entry(conversation.clone()).or_default().extend(changed);
    }
    outcome
  }

  /// Recompute every metric of `conversation` from scratch.
  pub async fn recompute_metrics(&self, conversation: &ConversationId) -> Result<RefreshOutcome> {
    let writer = self.writer(conversation).await;
    let _guard = writer.lock().await;
    let changed = self.take_pending(conversation).await;
    let outcome = self.run_pass(conversation, None).await;
    if let Err(e) = &outcome
      && e.kind() != ErrorKind::NotFound
    {
      self.inner.pending.lock().await.entry(conversation.clone()).or_default().extend(changed);
    }
    outcome
  }

  /// `changed = None` runs a full pass. The caller holds the writer lock.
  async fn run_pass(
    &self,
    conversation: &ConversationId,
    changed: Option<&BTreeSet<NodeId>>,
  ) -> Result<RefreshOutcome> {
    let mut tree = Arc::unwrap_or_clone(self.tree(conversation).await?);
    let pass = match changed {
      None => self.inner.metrics.recompute_all(&tree)?,
      Some(c) if c.is_empty() => return Ok(RefreshOutcome::idle(&tree)),
      Some(c) => self.inner.metrics.recompute(&tree, c)?,
    };
    pass.apply(&mut tree)?;

    let touched: BTreeSet<NodeId> = pass.nodes.keys().cloned().collect();
    let pairs = match changed {
      None => self.inner.pairs.derive_all(&tree)?,
      Some(_) => {
        let scope = self.inner.pairs.scope_for(&tree, &touched);
        self.inner.pairs.derive(&tree, &scope)?
      }
    };
    for pair in &pairs {
      tree.upsert_pair(pair.clone())?;
    }

    // Cumulative drift of a row depends on every hop above the node.
    let mut ancestry = Vec::new();
    for id in with_descendants(&tree, &touched) {
      ancestry.extend(materialize(&tree, &id, &self.inner.config.traversal)?);
    }

    let store = &self.inner.store;
    let nodes_updated = pass.nodes.len();
    store
      .write_node_metrics(conversation, pass.nodes.into_iter().collect(), pass.tension_score)
      .await
      .map_err(backend)?;
    let pairs_updated = pairs.len();
    if !pairs.is_empty() {
      store.upsert_pairs(conversation, pairs.clone()).await.map_err(backend)?;
    }
    if !ancestry.is_empty() {
      store.write_ancestry(conversation, ancestry).await.map_err(backend)?;
    }
    self.index_pairs(&pairs).await?;

    debug!(
      conversation = %conversation,
      nodes = nodes_updated,
      pairs = pairs_updated,
      rescaled = pass.rescaled,
      full = changed.is_none(),
      "metrics refreshed"
    );
    Ok(RefreshOutcome {
      conversation_id: conversation.clone(),
      nodes_updated,
      pairs_updated,
      rescaled: pass.rescaled,
      tension_score: pass.tension_score,
    })
  }

  // ─── Search ──────────────────────────────────────────────────────────────

  /// Refuse (strict) or report (permissive) a query vector whose model
  /// version has nothing indexed while other versions do.
  fn check_version(&self, index: &SimilarityIndex, kind: EntityKind, query: &Embedding) -> Result<()> {
    let versions = index.versions(kind);
    if versions.is_empty() || versions.contains(&query.model_version) {
      return Ok(());
    }
    let configured = &self.inner.config.embedding.model_version;
    let expected =
      if versions.contains(configured) { configured.clone() } else { versions[0].clone() };
    if self.inner.config.embedding.strict_versions {
      return Err(Error::ModelVersionMismatch { expected, found: query.model_version.clone() });
    }
    warn!(
      query = %query.model_version,
      indexed = %expected,
      "query model version has no indexed vectors; results will be empty"
    );
    Ok(())
  }

  async fn search_index(
    &self,
    kind: EntityKind,
    query: &SimilarityQuery,
    k: usize,
  ) -> Result<Vec<SearchHit>> {
    let metric = query.metric.unwrap_or(self.inner.config.query.default_metric);
    let admits = |attrs: &IndexAttributes| query.admits(attrs);

    let index = self.inner.index.read().await;
    self.check_version(&index, kind, &query.embedding)?;
    let mut req = SearchRequest::new(&query.embedding, k).metric(metric);
    if let Some(c) = &query.conversation {
      req = req.in_conversation(c);
    }
    if query.is_filtered() {
      req = req.filter(&admits);
    }
    if let Some(t) = query.threshold {
      req = req.min_score(t);
    }
    index.search(kind, &req)
  }

  async fn resolve_nodes(&self, hits: Vec<SearchHit>) -> Result<Vec<(Node, SearchHit)>> {
    let mut out = Vec::with_capacity(hits.len());
    for hit in hits {
      let id = NodeId::new(hit.id.clone());
      match self.inner.store.get_node(&hit.conversation_id, &id).await.map_err(backend)? {
        Some(node) => out.push((node, hit)),
        None => debug!(node = %id, "indexed node no longer stored"),
      }
    }
    Ok(out)
  }

  /// Nodes most similar to the query, best first; ties by ascending id.
  pub async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<NodeHit>> {
    let limit = query.limit.unwrap_or(self.inner.config.query.default_limit);
    let hits = self.search_index(EntityKind::Node, query, limit).await?;
    Ok(
      self
        .resolve_nodes(hits)
        .await?
        .into_iter()
        .map(|(node, hit)| NodeHit { node, score: hit.score, model_version: hit.model_version })
        .collect(),
    )
  }

  /// Similarity search re-ranked by `Σ wᵢ · xᵢ` over the weighted signals.
  ///
  /// Node metrics are min–max normalised over the over-fetched candidate
  /// pool; the similarity score enters unnormalised.
  pub async fn composite_search(&self, query: &CompositeQuery) -> Result<Vec<CompositeHit>> {
    let cfg = &self.inner.config.query;
    let weights = query.weights.as_ref().unwrap_or(&cfg.composite_weights);
    weights.validate("weights")?;
    let limit = query.similarity.limit.unwrap_or(cfg.default_limit);

    let hits = self
      .search_index(EntityKind::Node, &query.similarity, limit.saturating_mul(cfg.overfetch))
      .await?;
    let candidates = self.resolve_nodes(hits).await?;

    let mut bounds = Normalizer::new();
    for (node, _) in &candidates {
      for signal in COMPOSITE_SIGNALS {
        bounds.observe(signal, node_signal(&node.metrics, signal));
      }
    }

    let mut ranked: Vec<CompositeHit> = candidates
      .into_iter()
      .map(|(node, hit)| {
        let value = |signal: Signal| match signal {
          Signal::Similarity => signal.admit(hit.score),
          _ => bounds.normalize(signal, node_signal(&node.metrics, signal)),
        };
        let components = weights
          .iter()
          .filter(|(_, w)| *w != 0.0)
          .filter_map(|(signal, _)| value(signal).map(|v| (signal, v)))
          .collect();
        let combined = weighted_sum(weights, value);
        CompositeHit { similarity: hit.score, combined, components, node }
      })
      .collect();

    ranked.sort_by(|a, b| b.combined.total_cmp(&a.combined).then_with(|| a.node.id.cmp(&b.node.id)));
    ranked.truncate(limit);
    Ok(ranked)
  }

  /// Pairs most similar to the query; the role filter does not apply.
  pub async fn search_pairs(&self, query: &SimilarityQuery) -> Result<Vec<PairHit>> {
    let limit = query.limit.unwrap_or(self.inner.config.query.default_limit);
    let hits = self.search_index(EntityKind::Pair, query, limit).await?;
    let mut out = Vec::with_capacity(hits.len());
    for hit in hits {
      let id = PairId::from_stored(hit.id.clone());
      match self.inner.store.get_pair(&hit.conversation_id, &id).await.map_err(backend)? {
        Some(pair) => out.push(PairHit { pair, score: hit.score, model_version: hit.model_version }),
        None => debug!(pair = %id, "indexed pair no longer stored"),
      }
    }
    Ok(out)
  }

  /// Similar nodes across conversations, mildly boosted by spark factor.
  pub async fn find_patterns(&self, query: &PatternQuery) -> Result<Vec<PatternHit>> {
    let cfg = &self.inner.config.query;
    let limit = query.limit.unwrap_or(cfg.default_limit);
    let metric = query.metric.unwrap_or(cfg.default_metric);

    let hits = {
      let index = self.inner.index.read().await;
      self.check_version(&index, EntityKind::Node, &query.embedding)?;
      let mut req = SearchRequest::new(&query.embedding, limit.saturating_mul(cfg.overfetch))
        .metric(metric)
        .excluding(&query.exclude);
      if let Some(min) = query.min_similarity {
        req = req.min_score(min);
      }
      index.search(EntityKind::Node, &req)?
    };

    let mut ranked: Vec<PatternHit> = self
      .resolve_nodes(hits)
      .await?
      .into_iter()
      .map(|(node, hit)| {
        let spark = node.metrics.spark_factor.unwrap_or(0.0);
        let score = hit.score * (1.0 + cfg.pattern_spark_boost * spark);
        PatternHit { similarity: hit.score, score, node }
      })
      .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node.id.cmp(&b.node.id)));
    ranked.truncate(limit);
    Ok(ranked)
  }

  // ─── Traversal ───────────────────────────────────────────────────────────

  pub async fn complete_branch(
    &self,
    conversation: &ConversationId,
    divergence: &NodeId,
  ) -> Result<Vec<BranchMember>> {
    let tree = self.tree(conversation).await?;
    Traversal::new(&tree, &self.inner.config.traversal).complete_branch(divergence)
  }

  /// Root→`target`, root first.
  pub async fn path_to_node(&self, conversation: &ConversationId, target: &NodeId) -> Result<Vec<Node>> {
    let tree = self.tree(conversation).await?;
    let path = Traversal::new(&tree, &self.inner.config.traversal).path_to_node(target)?;
    path.iter().map(|id| tree.require(id).cloned()).collect()
  }

  pub async fn descendants(
    &self,
    conversation: &ConversationId,
    node: &NodeId,
    max_depth: Option<usize>,
  ) -> Result<Vec<Descendant>> {
    let tree = self.tree(conversation).await?;
    Traversal::new(&tree, &self.inner.config.traversal).descendants(node, max_depth)
  }

  pub async fn alternate_paths(
    &self,
    conversation: &ConversationId,
    start: &NodeId,
    max_depth: Option<usize>,
  ) -> Result<Vec<AlternatePath>> {
    let tree = self.tree(conversation).await?;
    Traversal::new(&tree, &self.inner.config.traversal).alternate_paths(start, max_depth)
  }

  /// Materialised ancestry of `node`, nearest first. Falls back to a live
  /// walk when no metrics pass has stored rows yet.
  pub async fn ancestry(&self, conversation: &ConversationId, node: &NodeId) -> Result<Vec<AncestryPath>> {
    let stored = self.inner.store.ancestry_of(conversation, node).await.map_err(backend)?;
    if !stored.is_empty() {
      return Ok(stored);
    }
    let tree = self.tree(conversation).await?;
    materialize(&tree, node, &self.inner.config.traversal)
  }

  // ─── Statistics ──────────────────────────────────────────────────────────

  pub async fn conversation_summary(&self, conversation: &ConversationId) -> Result<ConversationSummary> {
    Ok(stats::summarize(&*self.tree(conversation).await?))
  }

  pub async fn branch_statistics(&self, conversation: &ConversationId) -> Result<Vec<BranchStatistics>> {
    Ok(stats::branch_statistics(&*self.tree(conversation).await?))
  }

  pub async fn drift_by_turn(&self, conversation: &ConversationId) -> Result<Vec<TurnDrift>> {
    Ok(stats::drift_by_turn(&*self.tree(conversation).await?))
  }

  // ─── Lookups ─────────────────────────────────────────────────────────────

  pub async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
    self
      .inner
      .store
      .get_conversation(id)
      .await
      .map_err(backend)?
      .ok_or_else(|| Error::not_found(format!("conversation {id}")))
  }

  pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
    self.inner.store.list_conversations().await.map_err(backend)
  }

  pub async fn get_node(&self, conversation: &ConversationId, id: &NodeId) -> Result<Node> {
    self
      .inner
      .store
      .get_node(conversation, id)
      .await
      .map_err(backend)?
      .ok_or_else(|| Error::not_found(format!("node {id}")))
  }

  pub async fn get_pair(&self, conversation: &ConversationId, id: &PairId) -> Result<Pair> {
    self
      .inner
      .store
      .get_pair(conversation, id)
      .await
      .map_err(backend)?
      .ok_or_else(|| Error::not_found(format!("pair {id}")))
  }

  pub async fn scan_nodes(&self, query: &NodeQuery) -> Result<Vec<Node>> {
    self.inner.store.scan_nodes(query).await.map_err(backend)
  }
}

impl<S: ConversationStore + 'static> Carta<S> {
  /// Start a background task that refreshes metrics whenever a write
  /// leaves a conversation pending. Replaces any previous worker's feed.
  pub async fn spawn_metrics_worker(&self) -> MetricsWorker {
    let (tx, rx) = mpsc::unbounded_channel();
    *self.inner.notify.lock().await = Some(tx.clone());
    for id in self.inner.pending.lock().await.keys() {
      let _ = tx.send(id.clone());
    }
    MetricsWorker::spawn(Arc::downgrade(&self.inner), rx)
  }
}
