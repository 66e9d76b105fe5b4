//! Integration tests for `SqliteStore` against an in-memory database.

use carta_core::{
  ErrorKind,
  ancestry::materialize,
  config::{EmbeddingConfig, TraversalConfig},
  conversation::{ConversationId, NodeId, NodeMetrics, Role},
  ingest::{ConversationMeta, IngestBatch, NodeInput, build_tree},
  pair::PairId,
  pairs::PairDeriver,
  store::{ConversationStore, NodeQuery},
  traversal::Traversal,
  tree::ConversationTree,
  vector::{Embedding, ModelVersion},
};
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn at(secs: i64) -> DateTime<Utc> {
  Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
}

fn input(id: &str, parent: Option<&str>, role: Role, secs: i64) -> NodeInput {
  NodeInput::new(id, parent.map(NodeId::from), role, format!("content of {id}"), at(secs))
}

/// r ─ a ─ b ─ c   (mainline)
///         └ x
fn tree(id: &str) -> ConversationTree {
  let batch = IngestBatch {
    conversation: ConversationMeta {
      id: Some(ConversationId::new(id)),
      title: Some("Tea ceremonies".into()),
      created_at: Some(at(0)),
      updated_at: Some(at(0)),
      current_node: Some("c".into()),
      ..Default::default()
    },
    nodes:        vec![
      input("r", None, Role::User, 0),
      input("a", Some("r"), Role::Assistant, 10),
      input("b", Some("a"), Role::User, 20),
      input("c", Some("b"), Role::Assistant, 30),
      input("x", Some("b"), Role::Assistant, 40),
    ],
  };
  build_tree(batch, &EmbeddingConfig::default()).unwrap()
}

fn emb(values: &[f32]) -> Embedding {
  Embedding::new(values.to_vec(), ModelVersion::new("m1"))
}

fn cid(id: &str) -> ConversationId { ConversationId::new(id) }

fn nid(id: &str) -> NodeId { NodeId::new(id) }

// ─── Conversations ───────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_load_round_trip() {
  let s = store().await;
  let t = tree("c1");
  s.create_conversation(&t).await.unwrap();

  let loaded = s.load_tree(&cid("c1")).await.unwrap().unwrap();
  assert_eq!(loaded.conversation(), t.conversation());
  assert_eq!(loaded.node_ids(), t.node_ids());
  for n in t.nodes() {
    assert_eq!(loaded.node(&n.id), Some(n));
  }
  assert_eq!(loaded.children(&nid("b")), [nid("c"), nid("x")]);
}

#[tokio::test]
async fn missing_conversation_loads_as_none() {
  let s = store().await;
  assert!(s.load_tree(&cid("nope")).await.unwrap().is_none());
  assert!(s.get_conversation(&cid("nope")).await.unwrap().is_none());
}

#[tokio::test]
async fn creating_twice_is_rejected() {
  let s = store().await;
  let t = tree("c1");
  s.create_conversation(&t).await.unwrap();
  let err = s.create_conversation(&t).await.unwrap_err();
  assert!(matches!(err, Error::ConversationExists(_)));
}

#[tokio::test]
async fn list_and_update_conversations() {
  let s = store().await;
  s.create_conversation(&tree("c2")).await.unwrap();
  s.create_conversation(&tree("c1")).await.unwrap();

  let all = s.list_conversations().await.unwrap();
  let ids: Vec<_> = all.iter().map(|c| c.id.as_str()).collect();
  assert_eq!(ids, ["c1", "c2"]);

  let mut c = all[0].clone();
  c.title = "Renamed".into();
  c.tension_score = Some(1.25);
  s.update_conversation(&c).await.unwrap();
  let fetched = s.get_conversation(&cid("c1")).await.unwrap().unwrap();
  assert_eq!(fetched.title, "Renamed");
  assert_eq!(fetched.tension_score, Some(1.25));

  c.id = cid("ghost");
  let err: carta_core::Error = s.update_conversation(&c).await.unwrap_err().into();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ─── Nodes ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn appended_nodes_refresh_sibling_counts() {
  let s = store().await;
  s.create_conversation(&tree("c1")).await.unwrap();

  let mut t = (*s.load_tree(&cid("c1")).await.unwrap().unwrap()).clone();
  let y = t.insert(input("y", Some("b"), Role::Assistant, 50), false).unwrap();
  s.insert_nodes(&cid("c1"), vec![y]).await.unwrap();

  for id in ["c", "x", "y"] {
    let n = s.get_node(&cid("c1"), &nid(id)).await.unwrap().unwrap();
    assert_eq!(n.sibling_count, 2, "{id}");
  }
}

#[tokio::test]
async fn insert_is_all_or_nothing() {
  let s = store().await;
  let t = tree("c1");
  s.create_conversation(&t).await.unwrap();

  let mut scratch = t.clone();
  let good = scratch.insert(input("d", Some("c"), Role::User, 50), true).unwrap();
  let mut orphan = good.clone();
  orphan.id = nid("orphan");
  orphan.parent_id = Some(nid("missing"));

  let err: carta_core::Error =
    s.insert_nodes(&cid("c1"), vec![good, orphan]).await.unwrap_err().into();
  assert_eq!(err.kind(), ErrorKind::StructuralIntegrity);
  assert!(s.get_node(&cid("c1"), &nid("d")).await.unwrap().is_none());
}

#[tokio::test]
async fn terminal_parent_and_second_root_are_rejected() {
  let s = store().await;
  let mut t = tree("c1");
  let mut end = input("end", Some("c"), Role::User, 50);
  end.is_terminal = true;
  t.insert(end, true).unwrap();
  s.create_conversation(&t).await.unwrap();

  let mut child = t.node(&nid("end")).unwrap().clone();
  child.id = nid("after");
  child.parent_id = Some(nid("end"));
  let err = s.insert_nodes(&cid("c1"), vec![child]).await.unwrap_err();
  assert!(matches!(
    err,
    Error::Core(carta_core::Error::StructuralIntegrity(carta_core::Violation::TerminalParent(_)))
  ));

  let mut root = t.node(&nid("r")).unwrap().clone();
  root.id = nid("r2");
  let err: carta_core::Error = s.insert_nodes(&cid("c1"), vec![root]).await.unwrap_err().into();
  assert_eq!(err.kind(), ErrorKind::StructuralIntegrity);
}

#[tokio::test]
async fn embeddings_and_metrics_are_overwritten() {
  let s = store().await;
  s.create_conversation(&tree("c1")).await.unwrap();

  s.write_embeddings(&cid("c1"), vec![(nid("a"), emb(&[0.5, -0.25, 1.0]))]).await.unwrap();
  let metrics = NodeMetrics { distance_from_parent: Some(0.3), ..Default::default() };
  for _ in 0..2 {
    s.write_node_metrics(&cid("c1"), vec![(nid("a"), metrics.clone())], Some(0.7))
      .await
      .unwrap();
  }

  let a = s.get_node(&cid("c1"), &nid("a")).await.unwrap().unwrap();
  assert_eq!(a.embedding, Some(emb(&[0.5, -0.25, 1.0])));
  assert_eq!(a.metrics, metrics);
  let c = s.get_conversation(&cid("c1")).await.unwrap().unwrap();
  assert_eq!(c.tension_score, Some(0.7));

  let err: carta_core::Error = s
    .write_embeddings(&cid("c1"), vec![(nid("ghost"), emb(&[1.0]))])
    .await
    .unwrap_err()
    .into();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn scan_filters_and_pages() {
  let s = store().await;
  s.create_conversation(&tree("c1")).await.unwrap();
  s.create_conversation(&tree("c2")).await.unwrap();
  s.write_embeddings(&cid("c2"), vec![(nid("b"), emb(&[1.0, 0.0]))]).await.unwrap();

  let all = s.scan_nodes(&NodeQuery::default()).await.unwrap();
  assert_eq!(all.len(), 10);

  let q = NodeQuery { role: Some(Role::Assistant), ..NodeQuery::in_conversation(cid("c1")) };
  let ids: Vec<_> = s.scan_nodes(&q).await.unwrap().into_iter().map(|n| n.id).collect();
  assert_eq!(ids, [nid("a"), nid("c"), nid("x")]);

  let q = NodeQuery { mainline: Some(false), ..Default::default() };
  let hits = s.scan_nodes(&q).await.unwrap();
  assert_eq!(hits.len(), 2);
  assert!(hits.iter().all(|n| n.id == nid("x") && n.branch_depth == 1));

  let q = NodeQuery { embedded_only: true, ..Default::default() };
  let hits = s.scan_nodes(&q).await.unwrap();
  assert_eq!(hits.len(), 1);
  assert_eq!(hits[0].conversation_id, cid("c2"));

  let q = NodeQuery { min_turn: Some(2), max_turn: Some(3), limit: Some(2), offset: Some(1), ..NodeQuery::in_conversation(cid("c1")) };
  let ids: Vec<_> = s.scan_nodes(&q).await.unwrap().into_iter().map(|n| n.id).collect();
  assert_eq!(ids, [nid("b")]);
}

// ─── Pairs ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pairs_upsert_and_reload() {
  let s = store().await;
  let t = tree("c1");
  s.create_conversation(&t).await.unwrap();

  let pairs = PairDeriver::new(&Default::default()).derive_all(&t).unwrap();
  assert_eq!(pairs.len(), 3);
  s.upsert_pairs(&cid("c1"), pairs.clone()).await.unwrap();
  s.upsert_pairs(&cid("c1"), pairs.clone()).await.unwrap();

  let id = PairId::for_edge(&nid("b"), &nid("x"));
  let stored = s.get_pair(&cid("c1"), &id).await.unwrap().unwrap();
  assert_eq!(Some(&stored), pairs.iter().find(|p| p.id == id));

  let loaded = s.load_tree(&cid("c1")).await.unwrap().unwrap();
  assert_eq!(loaded.pairs().count(), 3);
}

#[tokio::test]
async fn pair_off_an_edge_is_rejected() {
  let s = store().await;
  let t = tree("c1");
  s.create_conversation(&t).await.unwrap();

  let mut pair = PairDeriver::new(&Default::default()).derive_all(&t).unwrap().remove(0);
  pair.response_id = nid("x");
  pair.prompt_id = nid("r");
  pair.id = PairId::for_edge(&pair.prompt_id, &pair.response_id);
  let err: carta_core::Error = s.upsert_pairs(&cid("c1"), vec![pair]).await.unwrap_err().into();
  assert_eq!(err.kind(), ErrorKind::StructuralIntegrity);
}

// ─── Ancestry ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ancestry_rows_are_replaced_per_node() {
  let s = store().await;
  let t = tree("c1");
  s.create_conversation(&t).await.unwrap();

  let rows = materialize(&t, &nid("x"), &TraversalConfig::default()).unwrap();
  s.write_ancestry(&cid("c1"), rows.clone()).await.unwrap();
  s.write_ancestry(&cid("c1"), rows.clone()).await.unwrap();

  let stored = s.ancestry_of(&cid("c1"), &nid("x")).await.unwrap();
  assert_eq!(stored, rows);
  assert_eq!(stored[0].distance, 0);
  assert_eq!(stored.last().unwrap().ancestor_id, nid("r"));
}

// ─── Cascade delete ──────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_cascades_to_owned_rows() {
  let s = store().await;
  let t = tree("c1");
  s.create_conversation(&t).await.unwrap();
  s.create_conversation(&tree("c2")).await.unwrap();
  let pairs = PairDeriver::new(&Default::default()).derive_all(&t).unwrap();
  s.upsert_pairs(&cid("c1"), pairs).await.unwrap();
  let rows = materialize(&t, &nid("c"), &TraversalConfig::default()).unwrap();
  s.write_ancestry(&cid("c1"), rows).await.unwrap();

  assert!(s.delete_conversation(&cid("c1")).await.unwrap());
  assert!(!s.delete_conversation(&cid("c1")).await.unwrap());

  assert!(s.get_node(&cid("c1"), &nid("a")).await.unwrap().is_none());
  assert!(s.ancestry_of(&cid("c1"), &nid("c")).await.unwrap().is_empty());
  let id = PairId::for_edge(&nid("r"), &nid("a"));
  assert!(s.get_pair(&cid("c1"), &id).await.unwrap().is_none());
  assert!(s.get_node(&cid("c2"), &nid("a")).await.unwrap().is_some());
}

// ─── Corruption ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn corrupted_parent_pointer_faults_traversal() {
  let s = store().await;
  s.create_conversation(&tree("c1")).await.unwrap();
  s.execute_raw("UPDATE nodes SET parent_id = 'c' WHERE node_id = 'a'").await.unwrap();

  let t = s.load_tree(&cid("c1")).await.unwrap().unwrap();
  let limits = TraversalConfig::default();
  let err = Traversal::new(&t, &limits).path_to_node(&nid("c")).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::StructuralIntegrity);
}
