//! Encoding and decoding helpers between Rust domain types and the column
//! representations stored in SQLite.
//!
//! Timestamps are stored as RFC 3339 strings, embeddings as little-endian
//! `f32` blobs next to their model tag, id sequences and metric sets as
//! compact JSON.

use carta_core::{
  ancestry::AncestryPath,
  conversation::{Conversation, ConversationId, GenerationType, Node, NodeId, NodeMetrics, Role},
  pair::{Pair, PairId, PairMetrics},
  vector::{Embedding, ModelVersion},
};
use chrono::{DateTime, Utc};

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_count(n: usize) -> i64 { i64::try_from(n).unwrap_or(i64::MAX) }

pub fn decode_count(n: i64) -> Result<usize> {
  usize::try_from(n).map_err(|_| Error::Decode(format!("negative count {n}")))
}

pub fn encode_generation_type(g: GenerationType) -> &'static str { g.as_str() }

pub fn decode_generation_type(s: &str) -> Result<GenerationType> {
  GenerationType::parse(s).ok_or_else(|| Error::Decode(format!("unknown generation type: {s:?}")))
}

// ─── Embeddings ──────────────────────────────────────────────────────────────

pub fn encode_vector(values: &[f32]) -> Vec<u8> {
  values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
  if bytes.len() % 4 != 0 {
    return Err(Error::Decode(format!("embedding blob of {} bytes", bytes.len())));
  }
  Ok(
    bytes
      .chunks_exact(4)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
      .collect(),
  )
}

/// `(blob, model tag)` column pair.
pub fn encode_embedding(e: Option<&Embedding>) -> (Option<Vec<u8>>, Option<String>) {
  match e {
    Some(e) => (Some(encode_vector(&e.values)), Some(e.model_version.as_str().to_owned())),
    None => (None, None),
  }
}

pub fn decode_embedding(blob: Option<Vec<u8>>, model: Option<String>) -> Result<Option<Embedding>> {
  match (blob, model) {
    (Some(blob), Some(model)) => {
      Ok(Some(Embedding::new(decode_vector(&blob)?, ModelVersion::new(model))))
    }
    (None, None) => Ok(None),
    _ => Err(Error::Decode("embedding blob and model tag must be set together".into())),
  }
}

// ─── JSON columns ────────────────────────────────────────────────────────────

pub fn encode_ids(ids: &[NodeId]) -> Result<String> { Ok(serde_json::to_string(ids)?) }

pub fn decode_ids(s: &str) -> Result<Vec<NodeId>> { Ok(serde_json::from_str(s)?) }

pub fn encode_node_metrics(m: &NodeMetrics) -> Result<String> { Ok(serde_json::to_string(m)?) }

pub fn encode_pair_metrics(m: &PairMetrics) -> Result<String> { Ok(serde_json::to_string(m)?) }

// ─── Row types ───────────────────────────────────────────────────────────────

pub const CONVERSATION_COLUMNS: &str = "conversation_id, title, created_at, updated_at, root_id, \
   current_node, tension_score, embedding_model_version, default_model_slug";

/// Raw values of a `conversations` row.
pub struct RawConversation {
  pub conversation_id:         String,
  pub title:                   String,
  pub created_at:              String,
  pub updated_at:              String,
  pub root_id:                 Option<String>,
  pub current_node:            Option<String>,
  pub tension_score:           Option<f64>,
  pub embedding_model_version: String,
  pub default_model_slug:      Option<String>,
}

impl RawConversation {
  pub fn from_conversation(c: &Conversation) -> Self {
    Self {
      conversation_id:         c.id.as_str().to_owned(),
      title:                   c.title.clone(),
      created_at:              encode_dt(c.created_at),
      updated_at:              encode_dt(c.updated_at),
      root_id:                 c.root_id.as_ref().map(|id| id.as_str().to_owned()),
      current_node:            c.current_node.as_ref().map(|id| id.as_str().to_owned()),
      tension_score:           c.tension_score,
      embedding_model_version: c.embedding_model_version.as_str().to_owned(),
      default_model_slug:      c.default_model_slug.clone(),
    }
  }

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      conversation_id:         row.get(0)?,
      title:                   row.get(1)?,
      created_at:              row.get(2)?,
      updated_at:              row.get(3)?,
      root_id:                 row.get(4)?,
      current_node:            row.get(5)?,
      tension_score:           row.get(6)?,
      embedding_model_version: row.get(7)?,
      default_model_slug:      row.get(8)?,
    })
  }

  pub fn into_conversation(self) -> Result<Conversation> {
    Ok(Conversation {
      id:                      ConversationId::new(self.conversation_id),
      title:                   self.title,
      created_at:              decode_dt(&self.created_at)?,
      updated_at:              decode_dt(&self.updated_at)?,
      root_id:                 self.root_id.map(NodeId::from),
      current_node:            self.current_node.map(NodeId::from),
      tension_score:           self.tension_score,
      embedding_model_version: ModelVersion::new(self.embedding_model_version),
      default_model_slug:      self.default_model_slug,
    })
  }
}

pub const NODE_COLUMNS: &str = "node_id, parent_id, role, content, content_type, created_at, \
   embedding, embedding_model, is_mainline, is_terminal, sibling_count, branch_depth, \
   ancestor_path, turn_number, generation_type, mainline_divergence_point, replaced_node_id, \
   metrics, conversation_id";

/// Raw values of a `nodes` row, in [`NODE_COLUMNS`] order.
pub struct RawNode {
  pub node_id:                   String,
  pub parent_id:                 Option<String>,
  pub role:                      String,
  pub content:                   String,
  pub content_type:              String,
  pub created_at:                String,
  pub embedding:                 Option<Vec<u8>>,
  pub embedding_model:           Option<String>,
  pub is_mainline:               bool,
  pub is_terminal:               bool,
  pub sibling_count:             i64,
  pub branch_depth:              i64,
  pub ancestor_path:             String,
  pub turn_number:               i64,
  pub generation_type:           String,
  pub mainline_divergence_point: Option<String>,
  pub replaced_node_id:          Option<String>,
  pub metrics:                   String,
  pub conversation_id:           String,
}

impl RawNode {
  pub fn from_node(n: &Node) -> Result<Self> {
    let (embedding, embedding_model) = encode_embedding(n.embedding.as_ref());
    Ok(Self {
      node_id: n.id.as_str().to_owned(),
      parent_id: n.parent_id.as_ref().map(|id| id.as_str().to_owned()),
      role: n.role.as_str().to_owned(),
      content: n.content.clone(),
      content_type: n.content_type.clone(),
      created_at: encode_dt(n.created_at),
      embedding,
      embedding_model,
      is_mainline: n.is_mainline,
      is_terminal: n.is_terminal,
      sibling_count: encode_count(n.sibling_count),
      branch_depth: encode_count(n.branch_depth),
      ancestor_path: encode_ids(&n.ancestor_path)?,
      turn_number: encode_count(n.turn_number),
      generation_type: encode_generation_type(n.generation_type).to_owned(),
      mainline_divergence_point: n
        .mainline_divergence_point
        .as_ref()
        .map(|id| id.as_str().to_owned()),
      replaced_node_id: n.replaced_node_id.as_ref().map(|id| id.as_str().to_owned()),
      metrics: encode_node_metrics(&n.metrics)?,
      conversation_id: n.conversation_id.as_str().to_owned(),
    })
  }

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      node_id:                   row.get(0)?,
      parent_id:                 row.get(1)?,
      role:                      row.get(2)?,
      content:                   row.get(3)?,
      content_type:              row.get(4)?,
      created_at:                row.get(5)?,
      embedding:                 row.get(6)?,
      embedding_model:           row.get(7)?,
      is_mainline:               row.get(8)?,
      is_terminal:               row.get(9)?,
      sibling_count:             row.get(10)?,
      branch_depth:              row.get(11)?,
      ancestor_path:             row.get(12)?,
      turn_number:               row.get(13)?,
      generation_type:           row.get(14)?,
      mainline_divergence_point: row.get(15)?,
      replaced_node_id:          row.get(16)?,
      metrics:                   row.get(17)?,
      conversation_id:           row.get(18)?,
    })
  }

  pub fn into_node(self) -> Result<Node> {
    Ok(Node {
      id:                        NodeId::new(self.node_id),
      conversation_id:           ConversationId::new(self.conversation_id),
      parent_id:                 self.parent_id.map(NodeId::from),
      role:                      Role::from(self.role),
      content:                   self.content,
      content_type:              self.content_type,
      created_at:                decode_dt(&self.created_at)?,
      embedding:                 decode_embedding(self.embedding, self.embedding_model)?,
      is_mainline:               self.is_mainline,
      is_terminal:               self.is_terminal,
      sibling_count:             decode_count(self.sibling_count)?,
      branch_depth:              decode_count(self.branch_depth)?,
      ancestor_path:             decode_ids(&self.ancestor_path)?,
      turn_number:               decode_count(self.turn_number)?,
      generation_type:           decode_generation_type(&self.generation_type)?,
      mainline_divergence_point: self.mainline_divergence_point.map(NodeId::from),
      replaced_node_id:          self.replaced_node_id.map(NodeId::from),
      metrics:                   serde_json::from_str(&self.metrics)?,
    })
  }
}

pub const PAIR_COLUMNS: &str = "pair_id, prompt_id, response_id, is_mainline, is_alternate, \
   is_terminal_arc, alternative_count, branch_depth, divergence_point, divergence_turn, \
   exchange_position_in_branch, turn_number, embedding, embedding_model, embedding_derived, \
   metrics, conversation_id";

/// Raw values of a `pairs` row, in [`PAIR_COLUMNS`] order.
pub struct RawPair {
  pub pair_id:                     String,
  pub prompt_id:                   String,
  pub response_id:                 String,
  pub is_mainline:                 bool,
  pub is_alternate:                bool,
  pub is_terminal_arc:             bool,
  pub alternative_count:           i64,
  pub branch_depth:                i64,
  pub divergence_point:            Option<String>,
  pub divergence_turn:             Option<i64>,
  pub exchange_position_in_branch: i64,
  pub turn_number:                 i64,
  pub embedding:                   Option<Vec<u8>>,
  pub embedding_model:             Option<String>,
  pub embedding_derived:           bool,
  pub metrics:                     String,
  pub conversation_id:             String,
}

impl RawPair {
  pub fn from_pair(p: &Pair) -> Result<Self> {
    let (embedding, embedding_model) = encode_embedding(p.embedding.as_ref());
    Ok(Self {
      pair_id: p.id.as_str().to_owned(),
      prompt_id: p.prompt_id.as_str().to_owned(),
      response_id: p.response_id.as_str().to_owned(),
      is_mainline: p.is_mainline,
      is_alternate: p.is_alternate,
      is_terminal_arc: p.is_terminal_arc,
      alternative_count: encode_count(p.alternative_count),
      branch_depth: encode_count(p.branch_depth),
      divergence_point: p.divergence_point.as_ref().map(|id| id.as_str().to_owned()),
      divergence_turn: p.divergence_turn.map(encode_count),
      exchange_position_in_branch: encode_count(p.exchange_position_in_branch),
      turn_number: encode_count(p.turn_number),
      embedding,
      embedding_model,
      embedding_derived: p.embedding_derived,
      metrics: encode_pair_metrics(&p.metrics)?,
      conversation_id: p.conversation_id.as_str().to_owned(),
    })
  }

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      pair_id:                     row.get(0)?,
      prompt_id:                   row.get(1)?,
      response_id:                 row.get(2)?,
      is_mainline:                 row.get(3)?,
      is_alternate:                row.get(4)?,
      is_terminal_arc:             row.get(5)?,
      alternative_count:           row.get(6)?,
      branch_depth:                row.get(7)?,
      divergence_point:            row.get(8)?,
      divergence_turn:             row.get(9)?,
      exchange_position_in_branch: row.get(10)?,
      turn_number:                 row.get(11)?,
      embedding:                   row.get(12)?,
      embedding_model:             row.get(13)?,
      embedding_derived:           row.get(14)?,
      metrics:                     row.get(15)?,
      conversation_id:             row.get(16)?,
    })
  }

  pub fn into_pair(self) -> Result<Pair> {
    Ok(Pair {
      id:                          PairId::from_stored(self.pair_id),
      conversation_id:             ConversationId::new(self.conversation_id),
      prompt_id:                   NodeId::new(self.prompt_id),
      response_id:                 NodeId::new(self.response_id),
      is_mainline:                 self.is_mainline,
      is_alternate:                self.is_alternate,
      is_terminal_arc:             self.is_terminal_arc,
      alternative_count:           decode_count(self.alternative_count)?,
      branch_depth:                decode_count(self.branch_depth)?,
      divergence_point:            self.divergence_point.map(NodeId::from),
      divergence_turn:             self.divergence_turn.map(decode_count).transpose()?,
      exchange_position_in_branch: decode_count(self.exchange_position_in_branch)?,
      turn_number:                 decode_count(self.turn_number)?,
      embedding:                   decode_embedding(self.embedding, self.embedding_model)?,
      embedding_derived:           self.embedding_derived,
      metrics:                     serde_json::from_str(&self.metrics)?,
    })
  }
}

/// Raw values of an `ancestry_paths` row.
pub struct RawAncestry {
  pub node_id:          String,
  pub ancestor_id:      String,
  pub distance:         i64,
  pub intermediate:     String,
  pub cumulative_drift: Option<f64>,
}

impl RawAncestry {
  pub fn from_path(p: &AncestryPath) -> Result<Self> {
    Ok(Self {
      node_id:          p.node_id.as_str().to_owned(),
      ancestor_id:      p.ancestor_id.as_str().to_owned(),
      distance:         encode_count(p.distance),
      intermediate:     encode_ids(&p.intermediate)?,
      cumulative_drift: p.cumulative_drift,
    })
  }

  pub fn into_path(self) -> Result<AncestryPath> {
    Ok(AncestryPath {
      node_id:          NodeId::new(self.node_id),
      ancestor_id:      NodeId::new(self.ancestor_id),
      distance:         decode_count(self.distance)?,
      intermediate:     decode_ids(&self.intermediate)?,
      cumulative_drift: self.cumulative_drift,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn vectors_survive_the_blob_encoding() {
    let v = vec![0.25_f32, -1.5, 3.0e-7, f32::MAX];
    assert_eq!(decode_vector(&encode_vector(&v)).unwrap(), v);
  }

  #[test]
  fn truncated_blob_is_rejected() {
    assert!(matches!(decode_vector(&[0, 0, 128]), Err(Error::Decode(_))));
  }

  #[test]
  fn half_set_embedding_columns_are_rejected() {
    assert!(decode_embedding(Some(vec![0; 4]), None).is_err());
    assert!(decode_embedding(None, None).unwrap().is_none());
  }
}
