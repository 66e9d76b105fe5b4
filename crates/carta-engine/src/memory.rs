//! [`MemoryStore`], an in-process [`ConversationStore`].
//!
//! Each conversation lives in its own slot holding an `Arc` snapshot of the
//! tree. Writers clone the snapshot, apply their change and swap the new
//! snapshot in, so a reader that already holds a snapshot never sees a
//! partially applied write. The outer map lock is only held long enough to
//! find a slot; writers on different conversations never wait on each
//! other.

use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
};

use tokio::sync::RwLock;

use carta_core::{
  Error, Result, Violation,
  ancestry::AncestryPath,
  conversation::{Conversation, ConversationId, Node, NodeId, NodeMetrics},
  pair::{Pair, PairId},
  store::{ConversationStore, NodeQuery},
  tree::ConversationTree,
  vector::Embedding,
};

struct Slot {
  tree:     Arc<ConversationTree>,
  ancestry: HashMap<NodeId, Vec<AncestryPath>>,
}

type SlotRef = Arc<RwLock<Slot>>;

#[derive(Clone, Default)]
pub struct MemoryStore {
  slots: Arc<RwLock<HashMap<ConversationId, SlotRef>>>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }

  async fn slot(&self, id: &ConversationId) -> Option<SlotRef> {
    self.slots.read().await.get(id).cloned()
  }

  async fn require(&self, id: &ConversationId) -> Result<SlotRef> {
    self.slot(id).await.ok_or_else(|| Error::not_found(format!("conversation {id}")))
  }

  /// Clone the current snapshot, let `edit` change it, and publish the
  /// result only if `edit` succeeded.
  async fn modify<T>(
    &self,
    id: &ConversationId,
    edit: impl FnOnce(&mut ConversationTree) -> Result<T>,
  ) -> Result<T> {
    let slot = self.require(id).await?;
    let mut slot = slot.write().await;
    let mut tree = (*slot.tree).clone();
    let out = edit(&mut tree)?;
    slot.tree = Arc::new(tree);
    Ok(out)
  }
}

impl ConversationStore for MemoryStore {
  type Error = Error;

  async fn create_conversation(&self, tree: &ConversationTree) -> Result<()> {
    let mut slots = self.slots.write().await;
    if slots.contains_key(tree.id()) {
      return Err(Violation::DuplicateConversation(tree.id().clone()).into());
    }
    let slot = Slot { tree: Arc::new(tree.clone()), ancestry: HashMap::new() };
    slots.insert(tree.id().clone(), Arc::new(RwLock::new(slot)));
    Ok(())
  }

  async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
    let Some(slot) = self.slot(id).await else { return Ok(None) };
    let conversation = slot.read().await.tree.conversation().clone();
    Ok(Some(conversation))
  }

  async fn list_conversations(&self) -> Result<Vec<Conversation>> {
    let slots: Vec<SlotRef> = self.slots.read().await.values().cloned().collect();
    let mut out = Vec::with_capacity(slots.len());
    for slot in slots {
      out.push(slot.read().await.tree.conversation().clone());
    }
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(out)
  }

  async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
    self
      .modify(&conversation.id, |tree| {
        let envelope = tree.conversation_mut();
        envelope.title = conversation.title.clone();
        envelope.created_at = conversation.created_at;
        envelope.updated_at = conversation.updated_at;
        envelope.root_id = conversation.root_id.clone();
        envelope.current_node = conversation.current_node.clone();
        envelope.tension_score = conversation.tension_score;
        envelope.default_model_slug = conversation.default_model_slug.clone();
        Ok(())
      })
      .await
  }

  async fn delete_conversation(&self, id: &ConversationId) -> Result<bool> {
    Ok(self.slots.write().await.remove(id).is_some())
  }

  async fn insert_nodes(&self, conversation: &ConversationId, nodes: Vec<Node>) -> Result<()> {
    self
      .modify(conversation, |tree| {
        for node in nodes {
          tree.attach(node)?;
        }
        Ok(())
      })
      .await
  }

  async fn get_node(&self, conversation: &ConversationId, id: &NodeId) -> Result<Option<Node>> {
    let Some(slot) = self.slot(conversation).await else { return Ok(None) };
    let node = slot.read().await.tree.node(id).cloned();
    Ok(node)
  }

  async fn scan_nodes(&self, query: &NodeQuery) -> Result<Vec<Node>> {
    let mut slots: Vec<(ConversationId, SlotRef)> = self
      .slots
      .read()
      .await
      .iter()
      .filter(|(id, _)| query.conversation_id.as_ref().is_none_or(|c| c == *id))
      .map(|(id, slot)| (id.clone(), slot.clone()))
      .collect();
    slots.sort_by(|a, b| a.0.cmp(&b.0));

    let mut matched = Vec::new();
    for (_, slot) in slots {
      let tree = slot.read().await.tree.clone();
      matched.extend(tree.nodes().filter(|n| query.matches(n)).cloned());
    }
    Ok(
      matched
        .into_iter()
        .skip(query.offset.unwrap_or(0))
        .take(query.limit.unwrap_or(usize::MAX))
        .collect(),
    )
  }

  async fn load_tree(&self, id: &ConversationId) -> Result<Option<Arc<ConversationTree>>> {
    let Some(slot) = self.slot(id).await else { return Ok(None) };
    let tree = slot.read().await.tree.clone();
    Ok(Some(tree))
  }

  async fn write_embeddings(
    &self,
    conversation: &ConversationId,
    embeddings: Vec<(NodeId, Embedding)>,
  ) -> Result<()> {
    self
      .modify(conversation, |tree| {
        for (id, embedding) in embeddings {
          tree.set_embedding(&id, embedding)?;
        }
        Ok(())
      })
      .await
  }

  async fn write_node_metrics(
    &self,
    conversation: &ConversationId,
    metrics: Vec<(NodeId, NodeMetrics)>,
    tension_score: Option<f64>,
  ) -> Result<()> {
    self
      .modify(conversation, |tree| {
        for (id, m) in metrics {
          tree.set_metrics(&id, m)?;
        }
        tree.conversation_mut().tension_score = tension_score;
        Ok(())
      })
      .await
  }

  async fn upsert_pairs(&self, conversation: &ConversationId, pairs: Vec<Pair>) -> Result<()> {
    self
      .modify(conversation, |tree| {
        for pair in pairs {
          if pair.conversation_id != *tree.id() {
            return Err(
              Violation::NotAnEdge { prompt: pair.prompt_id, response: pair.response_id }.into(),
            );
          }
          tree.upsert_pair(pair)?;
        }
        Ok(())
      })
      .await
  }

  async fn get_pair(&self, conversation: &ConversationId, id: &PairId) -> Result<Option<Pair>> {
    let Some(slot) = self.slot(conversation).await else { return Ok(None) };
    let pair = slot.read().await.tree.pair(id).cloned();
    Ok(pair)
  }

  async fn write_ancestry(&self, conversation: &ConversationId, rows: Vec<AncestryPath>) -> Result<()> {
    let slot = self.require(conversation).await?;
    let mut slot = slot.write().await;
    let owners: HashSet<NodeId> = rows.iter().map(|r| r.node_id.clone()).collect();
    for owner in &owners {
      slot.ancestry.remove(owner);
    }
    for row in rows {
      slot.ancestry.entry(row.node_id.clone()).or_default().push(row);
    }
    for owner in &owners {
      if let Some(rows) = slot.ancestry.get_mut(owner) {
        rows.sort_by_key(|r| r.distance);
      }
    }
    Ok(())
  }

  async fn ancestry_of(&self, conversation: &ConversationId, node: &NodeId) -> Result<Vec<AncestryPath>> {
    let Some(slot) = self.slot(conversation).await else { return Ok(Vec::new()) };
    let rows = slot.read().await.ancestry.get(node).cloned().unwrap_or_default();
    Ok(rows)
  }
}
