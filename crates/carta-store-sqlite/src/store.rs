//! [`SqliteStore`], the SQLite implementation of [`ConversationStore`].

use std::{collections::BTreeSet, path::Path, sync::Arc};

use rusqlite::{OptionalExtension as _, types::Value};
use tracing::debug;

use carta_core::{
  Violation,
  ancestry::AncestryPath,
  conversation::{Conversation, ConversationId, Node, NodeId, NodeMetrics},
  pair::{Pair, PairId},
  store::{ConversationStore, NodeQuery},
  tree::ConversationTree,
  vector::Embedding,
};

use crate::{
  encode::{
    CONVERSATION_COLUMNS, NODE_COLUMNS, PAIR_COLUMNS, RawAncestry, RawConversation, RawNode,
    RawPair, encode_count, encode_embedding, encode_node_metrics,
  },
  schema::SCHEMA,
  Error, Result,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Carta conversation store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Every
/// multi-row write runs in one transaction, so readers never observe a
/// partially inserted branch.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

/// Result of a write that may be refused for a domain reason after the
/// transaction started; the transaction is rolled back on refusal.
enum Refusal {
  Structural(Violation),
  MissingConversation,
  MissingNode(NodeId),
}

impl Refusal {
  fn into_error(self, conversation: &ConversationId) -> Error {
    match self {
      Self::Structural(v) => Error::Core(v.into()),
      Self::MissingConversation => Error::ConversationNotFound(conversation.clone()),
      Self::MissingNode(id) => Error::Core(carta_core::Error::not_found(format!("node {id}"))),
    }
  }
}

fn conversation_exists(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM conversations WHERE conversation_id = ?1",
        rusqlite::params![id],
        |_| Ok(true),
      )
      .optional()?
      .unwrap_or(false),
  )
}

fn insert_node_row(tx: &rusqlite::Transaction<'_>, n: &RawNode) -> rusqlite::Result<()> {
  tx.execute(
    "INSERT INTO nodes (
       node_id, parent_id, role, content, content_type, created_at,
       embedding, embedding_model, is_mainline, is_terminal, sibling_count, branch_depth,
       ancestor_path, turn_number, generation_type, mainline_divergence_point,
       replaced_node_id, metrics, conversation_id
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
    rusqlite::params![
      n.node_id,
      n.parent_id,
      n.role,
      n.content,
      n.content_type,
      n.created_at,
      n.embedding,
      n.embedding_model,
      n.is_mainline,
      n.is_terminal,
      n.sibling_count,
      n.branch_depth,
      n.ancestor_path,
      n.turn_number,
      n.generation_type,
      n.mainline_divergence_point,
      n.replaced_node_id,
      n.metrics,
      n.conversation_id,
    ],
  )?;
  Ok(())
}

fn upsert_pair_row(tx: &rusqlite::Transaction<'_>, p: &RawPair) -> rusqlite::Result<()> {
  tx.execute(
    "INSERT INTO pairs (
       pair_id, prompt_id, response_id, is_mainline, is_alternate, is_terminal_arc,
       alternative_count, branch_depth, divergence_point, divergence_turn,
       exchange_position_in_branch, turn_number, embedding, embedding_model,
       embedding_derived, metrics, conversation_id
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
     ON CONFLICT (conversation_id, pair_id) DO UPDATE SET
       is_mainline                 = excluded.is_mainline,
       is_alternate                = excluded.is_alternate,
       is_terminal_arc             = excluded.is_terminal_arc,
       alternative_count           = excluded.alternative_count,
       branch_depth                = excluded.branch_depth,
       divergence_point            = excluded.divergence_point,
       divergence_turn             = excluded.divergence_turn,
       exchange_position_in_branch = excluded.exchange_position_in_branch,
       turn_number                 = excluded.turn_number,
       embedding                   = excluded.embedding,
       embedding_model             = excluded.embedding_model,
       embedding_derived           = excluded.embedding_derived,
       metrics                     = excluded.metrics",
    rusqlite::params![
      p.pair_id,
      p.prompt_id,
      p.response_id,
      p.is_mainline,
      p.is_alternate,
      p.is_terminal_arc,
      p.alternative_count,
      p.branch_depth,
      p.divergence_point,
      p.divergence_turn,
      p.exchange_position_in_branch,
      p.turn_number,
      p.embedding,
      p.embedding_model,
      p.embedding_derived,
      p.metrics,
      p.conversation_id,
    ],
  )?;
  Ok(())
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run raw SQL against the connection, bypassing every check.
  #[cfg(test)]
  pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<usize> {
    Ok(self.conn.call(move |conn| Ok(conn.execute(sql, [])?)).await?)
  }
}

// ─── ConversationStore impl ──────────────────────────────────────────────────

impl ConversationStore for SqliteStore {
  type Error = Error;

  // ── Conversations ───────────────────────────────────────────────────────

  async fn create_conversation(&self, tree: &ConversationTree) -> Result<()> {
    let id = tree.id().clone();
    let conversation = RawConversation::from_conversation(tree.conversation());
    let nodes = tree.nodes().map(RawNode::from_node).collect::<Result<Vec<_>>>()?;
    let pairs = tree.pairs().map(RawPair::from_pair).collect::<Result<Vec<_>>>()?;
    let node_count = nodes.len();

    let created: bool = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if conversation_exists(&tx, &conversation.conversation_id)? {
          return Ok(false);
        }
        let c = &conversation;
        tx.execute(
          "INSERT INTO conversations (
             conversation_id, title, created_at, updated_at, root_id,
             current_node, tension_score, embedding_model_version, default_model_slug
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          rusqlite::params![
            c.conversation_id,
            c.title,
            c.created_at,
            c.updated_at,
            c.root_id,
            c.current_node,
            c.tension_score,
            c.embedding_model_version,
            c.default_model_slug,
          ],
        )?;
        for n in &nodes {
          insert_node_row(&tx, n)?;
        }
        for p in &pairs {
          upsert_pair_row(&tx, p)?;
        }
        tx.commit()?;
        Ok(true)
      })
      .await?;

    if !created {
      return Err(Error::ConversationExists(id));
    }
    debug!(conversation = %id, nodes = node_count, "stored conversation");
    Ok(())
  }

  async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
    let cid = id.as_str().to_owned();
    let raw: Option<RawConversation> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_id = ?1"),
              rusqlite::params![cid],
              RawConversation::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawConversation::into_conversation).transpose()
  }

  async fn list_conversations(&self) -> Result<Vec<Conversation>> {
    let raws: Vec<RawConversation> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY created_at, conversation_id"
        ))?;
        let rows = stmt
          .query_map([], RawConversation::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawConversation::into_conversation).collect()
  }

  async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
    let c = RawConversation::from_conversation(conversation);
    let changed: usize = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE conversations SET
             title = ?2, created_at = ?3, updated_at = ?4, root_id = ?5,
             current_node = ?6, tension_score = ?7, default_model_slug = ?8
           WHERE conversation_id = ?1",
          rusqlite::params![
            c.conversation_id,
            c.title,
            c.created_at,
            c.updated_at,
            c.root_id,
            c.current_node,
            c.tension_score,
            c.default_model_slug,
          ],
        )?)
      })
      .await?;
    if changed == 0 {
      return Err(Error::ConversationNotFound(conversation.id.clone()));
    }
    Ok(())
  }

  async fn delete_conversation(&self, id: &ConversationId) -> Result<bool> {
    let cid = id.as_str().to_owned();
    let removed: usize = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM conversations WHERE conversation_id = ?1",
          rusqlite::params![cid],
        )?)
      })
      .await?;
    debug!(conversation = %id, removed = removed > 0, "deleted conversation");
    Ok(removed > 0)
  }

  // ── Nodes ───────────────────────────────────────────────────────────────

  async fn insert_nodes(&self, conversation: &ConversationId, nodes: Vec<Node>) -> Result<()> {
    let cid = conversation.as_str().to_owned();
    let raws = nodes.iter().map(RawNode::from_node).collect::<Result<Vec<_>>>()?;
    let ids: Vec<NodeId> = nodes.into_iter().map(|n| n.id).collect();

    let outcome: Option<Refusal> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !conversation_exists(&tx, &cid)? {
          return Ok(Some(Refusal::MissingConversation));
        }
        let mut parents = BTreeSet::new();
        for (raw, id) in raws.iter().zip(&ids) {
          if raw.conversation_id != cid {
            return Ok(Some(Refusal::Structural(Violation::ForeignNode {
              node:     id.clone(),
              expected: cid.clone(),
              found:    raw.conversation_id.clone(),
            })));
          }
          let exists = tx
            .query_row(
              "SELECT 1 FROM nodes WHERE conversation_id = ?1 AND node_id = ?2",
              rusqlite::params![cid, raw.node_id],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
          if exists {
            return Ok(Some(Refusal::Structural(Violation::DuplicateNode(id.clone()))));
          }

          match &raw.parent_id {
            None => {
              let root: Option<String> = tx
                .query_row(
                  "SELECT node_id FROM nodes WHERE conversation_id = ?1 AND parent_id IS NULL",
                  rusqlite::params![cid],
                  |r| r.get(0),
                )
                .optional()?;
              if let Some(existing) = root {
                return Ok(Some(Refusal::Structural(Violation::SecondRoot {
                  existing: NodeId::new(existing),
                  node:     id.clone(),
                })));
              }
            }
            Some(parent) => {
              let terminal: Option<bool> = tx
                .query_row(
                  "SELECT is_terminal FROM nodes WHERE conversation_id = ?1 AND node_id = ?2",
                  rusqlite::params![cid, parent],
                  |r| r.get(0),
                )
                .optional()?;
              match terminal {
                None => {
                  return Ok(Some(Refusal::Structural(Violation::UnknownParent {
                    node:   id.clone(),
                    parent: NodeId::new(parent.clone()),
                  })));
                }
                Some(true) => {
                  return Ok(Some(Refusal::Structural(Violation::TerminalParent(NodeId::new(
                    parent.clone(),
                  )))));
                }
                Some(false) => {
                  parents.insert(parent.clone());
                }
              }
            }
          }
          insert_node_row(&tx, raw)?;
        }

        for parent in &parents {
          tx.execute(
            "UPDATE nodes SET sibling_count = (
               SELECT COUNT(*) - 1 FROM nodes AS s
               WHERE s.conversation_id = ?1 AND s.parent_id = ?2
             )
             WHERE conversation_id = ?1 AND parent_id = ?2",
            rusqlite::params![cid, parent],
          )?;
        }
        tx.commit()?;
        Ok(None)
      })
      .await?;

    match outcome {
      Some(refusal) => Err(refusal.into_error(conversation)),
      None => Ok(()),
    }
  }

  async fn get_node(&self, conversation: &ConversationId, id: &NodeId) -> Result<Option<Node>> {
    let cid = conversation.as_str().to_owned();
    let nid = id.as_str().to_owned();
    let raw: Option<RawNode> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE conversation_id = ?1 AND node_id = ?2"
              ),
              rusqlite::params![cid, nid],
              RawNode::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawNode::into_node).transpose()
  }

  async fn scan_nodes(&self, query: &NodeQuery) -> Result<Vec<Node>> {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if let Some(cid) = &query.conversation_id {
      clauses.push("conversation_id = ?");
      params.push(Value::Text(cid.as_str().to_owned()));
    }
    if let Some(role) = &query.role {
      clauses.push("role = ?");
      params.push(Value::Text(role.as_str().to_owned()));
    }
    if let Some(mainline) = query.mainline {
      clauses.push("is_mainline = ?");
      params.push(Value::Integer(i64::from(mainline)));
    }
    for (clause, bound) in [
      ("branch_depth >= ?", query.min_branch_depth),
      ("branch_depth <= ?", query.max_branch_depth),
      ("turn_number >= ?", query.min_turn),
      ("turn_number <= ?", query.max_turn),
    ] {
      if let Some(bound) = bound {
        clauses.push(clause);
        params.push(Value::Integer(encode_count(bound)));
      }
    }
    if query.embedded_only {
      clauses.push("embedding IS NOT NULL");
    }

    let filter =
      if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
    // SQLite needs a LIMIT before an OFFSET; -1 means unbounded.
    params.push(Value::Integer(query.limit.map_or(-1, encode_count)));
    params.push(Value::Integer(query.offset.map_or(0, encode_count)));
    let sql = format!(
      "SELECT {NODE_COLUMNS} FROM nodes {filter} ORDER BY conversation_id, seq LIMIT ? OFFSET ?"
    );

    let raws: Vec<RawNode> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawNode::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawNode::into_node).collect()
  }

  async fn load_tree(&self, id: &ConversationId) -> Result<Option<Arc<ConversationTree>>> {
    let cid = id.as_str().to_owned();
    // One closure, so no other write on this connection interleaves.
    let raw: Option<(RawConversation, Vec<RawNode>, Vec<RawPair>)> = self
      .conn
      .call(move |conn| {
        let Some(conversation) = conn
          .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_id = ?1"),
            rusqlite::params![cid],
            RawConversation::from_row,
          )
          .optional()?
        else {
          return Ok(None);
        };
        let nodes = conn
          .prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE conversation_id = ?1 ORDER BY seq"
          ))?
          .query_map(rusqlite::params![cid], RawNode::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        let pairs = conn
          .prepare(&format!(
            "SELECT {PAIR_COLUMNS} FROM pairs WHERE conversation_id = ?1 ORDER BY pair_id"
          ))?
          .query_map(rusqlite::params![cid], RawPair::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some((conversation, nodes, pairs)))
      })
      .await?;

    let Some((conversation, nodes, pairs)) = raw else {
      return Ok(None);
    };
    let tree = ConversationTree::from_stored(
      conversation.into_conversation()?,
      nodes.into_iter().map(RawNode::into_node).collect::<Result<Vec<_>>>()?,
      pairs.into_iter().map(RawPair::into_pair).collect::<Result<Vec<_>>>()?,
    )?;
    Ok(Some(Arc::new(tree)))
  }

  async fn write_embeddings(
    &self,
    conversation: &ConversationId,
    embeddings: Vec<(NodeId, Embedding)>,
  ) -> Result<()> {
    let cid = conversation.as_str().to_owned();
    let rows: Vec<(NodeId, Option<Vec<u8>>, Option<String>)> = embeddings
      .iter()
      .map(|(id, e)| {
        let (blob, model) = encode_embedding(Some(e));
        (id.clone(), blob, model)
      })
      .collect();

    let outcome: Option<Refusal> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        for (id, blob, model) in &rows {
          let changed = tx.execute(
            "UPDATE nodes SET embedding = ?3, embedding_model = ?4
             WHERE conversation_id = ?1 AND node_id = ?2",
            rusqlite::params![cid, id.as_str(), blob, model],
          )?;
          if changed == 0 {
            return Ok(Some(Refusal::MissingNode(id.clone())));
          }
        }
        tx.commit()?;
        Ok(None)
      })
      .await?;

    match outcome {
      Some(refusal) => Err(refusal.into_error(conversation)),
      None => Ok(()),
    }
  }

  async fn write_node_metrics(
    &self,
    conversation: &ConversationId,
    metrics: Vec<(NodeId, NodeMetrics)>,
    tension_score: Option<f64>,
  ) -> Result<()> {
    let cid = conversation.as_str().to_owned();
    let rows = metrics
      .iter()
      .map(|(id, m)| Ok((id.clone(), encode_node_metrics(m)?)))
      .collect::<Result<Vec<_>>>()?;

    let outcome: Option<Refusal> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          "UPDATE conversations SET tension_score = ?2 WHERE conversation_id = ?1",
          rusqlite::params![cid, tension_score],
        )?;
        if changed == 0 {
          return Ok(Some(Refusal::MissingConversation));
        }
        for (id, json) in &rows {
          let changed = tx.execute(
            "UPDATE nodes SET metrics = ?3 WHERE conversation_id = ?1 AND node_id = ?2",
            rusqlite::params![cid, id.as_str(), json],
          )?;
          if changed == 0 {
            return Ok(Some(Refusal::MissingNode(id.clone())));
          }
        }
        tx.commit()?;
        Ok(None)
      })
      .await?;

    match outcome {
      Some(refusal) => Err(refusal.into_error(conversation)),
      None => Ok(()),
    }
  }

  // ── Pairs ───────────────────────────────────────────────────────────────

  async fn upsert_pairs(&self, conversation: &ConversationId, pairs: Vec<Pair>) -> Result<()> {
    let cid = conversation.as_str().to_owned();
    let raws = pairs.iter().map(RawPair::from_pair).collect::<Result<Vec<_>>>()?;
    let edges: Vec<(PairId, NodeId, NodeId)> = pairs
      .into_iter()
      .map(|p| (p.id, p.prompt_id, p.response_id))
      .collect();

    let outcome: Option<Refusal> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        for (raw, (id, prompt, response)) in raws.iter().zip(&edges) {
          let parent: Option<Option<String>> = tx
            .query_row(
              "SELECT parent_id FROM nodes WHERE conversation_id = ?1 AND node_id = ?2",
              rusqlite::params![cid, response.as_str()],
              |r| r.get(0),
            )
            .optional()?;
          let on_edge = parent.flatten().as_deref() == Some(prompt.as_str())
            && *id == PairId::for_edge(prompt, response)
            && raw.conversation_id == cid;
          if !on_edge {
            return Ok(Some(Refusal::Structural(Violation::NotAnEdge {
              prompt:   prompt.clone(),
              response: response.clone(),
            })));
          }
          upsert_pair_row(&tx, raw)?;
        }
        tx.commit()?;
        Ok(None)
      })
      .await?;

    match outcome {
      Some(refusal) => Err(refusal.into_error(conversation)),
      None => Ok(()),
    }
  }

  async fn get_pair(&self, conversation: &ConversationId, id: &PairId) -> Result<Option<Pair>> {
    let cid = conversation.as_str().to_owned();
    let pid = id.as_str().to_owned();
    let raw: Option<RawPair> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {PAIR_COLUMNS} FROM pairs WHERE conversation_id = ?1 AND pair_id = ?2"
              ),
              rusqlite::params![cid, pid],
              RawPair::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawPair::into_pair).transpose()
  }

  // ── Ancestry ────────────────────────────────────────────────────────────

  async fn write_ancestry(&self, conversation: &ConversationId, rows: Vec<AncestryPath>) -> Result<()> {
    let cid = conversation.as_str().to_owned();
    let owners: BTreeSet<String> = rows.iter().map(|r| r.node_id.as_str().to_owned()).collect();
    let raws = rows.iter().map(RawAncestry::from_path).collect::<Result<Vec<_>>>()?;

    let outcome: Option<Refusal> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !conversation_exists(&tx, &cid)? {
          return Ok(Some(Refusal::MissingConversation));
        }
        for owner in &owners {
          tx.execute(
            "DELETE FROM ancestry_paths WHERE conversation_id = ?1 AND node_id = ?2",
            rusqlite::params![cid, owner],
          )?;
        }
        for r in &raws {
          tx.execute(
            "INSERT INTO ancestry_paths (
               conversation_id, node_id, ancestor_id, distance, intermediate, cumulative_drift
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
              cid,
              r.node_id,
              r.ancestor_id,
              r.distance,
              r.intermediate,
              r.cumulative_drift,
            ],
          )?;
        }
        tx.commit()?;
        Ok(None)
      })
      .await?;

    match outcome {
      Some(refusal) => Err(refusal.into_error(conversation)),
      None => Ok(()),
    }
  }

  async fn ancestry_of(&self, conversation: &ConversationId, node: &NodeId) -> Result<Vec<AncestryPath>> {
    let cid = conversation.as_str().to_owned();
    let nid = node.as_str().to_owned();
    let raws: Vec<RawAncestry> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT node_id, ancestor_id, distance, intermediate, cumulative_drift
           FROM ancestry_paths
           WHERE conversation_id = ?1 AND node_id = ?2
           ORDER BY distance",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![cid, nid], |row| {
            Ok(RawAncestry {
              node_id:          row.get(0)?,
              ancestor_id:      row.get(1)?,
              distance:         row.get(2)?,
              intermediate:     row.get(3)?,
              cumulative_drift: row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAncestry::into_path).collect()
  }
}
