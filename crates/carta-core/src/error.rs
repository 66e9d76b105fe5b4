//! Error types for `carta-core`.

use thiserror::Error;

use crate::{
  conversation::{ConversationId, NodeId},
  vector::ModelVersion,
};

/// A broken structural invariant of a conversation tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
  #[error("conversation {0} already exists")]
  DuplicateConversation(ConversationId),

  #[error("node {0} already exists")]
  DuplicateNode(NodeId),

  #[error("parent {parent} of node {node} is unknown")]
  UnknownParent { node: NodeId, parent: NodeId },

  #[error("parent {0} is terminal and cannot take children")]
  TerminalParent(NodeId),

  #[error("conversation already has root {existing}; rejected {node}")]
  SecondRoot { existing: NodeId, node: NodeId },

  #[error("parent-pointer cycle detected at {0}")]
  Cycle(NodeId),

  #[error("pair {prompt} -> {response} already exists")]
  DuplicatePair { prompt: NodeId, response: NodeId },

  #[error("{response} is not a child of {prompt}")]
  NotAnEdge { prompt: NodeId, response: NodeId },

  #[error("node {node} cannot extend the mainline from {parent}")]
  MainlineExtension { node: NodeId, parent: NodeId },

  #[error("replaced node {replaced} of {node} is unknown")]
  UnknownReplacement { node: NodeId, replaced: NodeId },

  #[error("node {node} belongs to conversation {found}, expected {expected}")]
  ForeignNode {
    node:     NodeId,
    expected: String,
    found:    String,
  },
}

/// The taxonomy class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  StructuralIntegrity,
  NotFound,
  DimensionMismatch,
  Configuration,
  DepthExceeded,
  Store,
  Serialization,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("structural integrity violation: {0}")]
  StructuralIntegrity(#[from] Violation),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("dimension mismatch: expected {expected} components, found {found}")]
  DimensionMismatch { expected: usize, found: usize },

  #[error("embedding model version mismatch: expected {expected}, found {found}")]
  ModelVersionMismatch {
    expected: ModelVersion,
    found:    ModelVersion,
  },

  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("traversal depth limit {limit} exceeded at node {node}")]
  DepthExceeded { limit: usize, node: NodeId },

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn not_found(what: impl std::fmt::Display) -> Self {
    Self::NotFound(what.to_string())
  }

  /// Wrap a backend error, recovering a core error passed through verbatim.
  pub fn store<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
    match boxed.downcast::<Error>() {
      Ok(core) => *core,
      Err(other) => Self::Store(other),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::StructuralIntegrity(_) => ErrorKind::StructuralIntegrity,
      Self::NotFound(_) => ErrorKind::NotFound,
      Self::DimensionMismatch { .. } | Self::ModelVersionMismatch { .. } => {
        ErrorKind::DimensionMismatch
      }
      Self::Configuration(_) => ErrorKind::Configuration,
      Self::DepthExceeded { .. } => ErrorKind::DepthExceeded,
      Self::Store(_) => ErrorKind::Store,
      Self::Serialization(_) => ErrorKind::Serialization,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn store_recovers_core_errors() {
    let err = Error::store(Error::not_found("node x"));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let io = std::io::Error::other("disk on fire");
    assert_eq!(Error::store(io).kind(), ErrorKind::Store);
  }

  #[test]
  fn version_mismatch_is_a_dimension_class_error() {
    let err = Error::ModelVersionMismatch {
      expected: ModelVersion::new("a"),
      found:    ModelVersion::new("b"),
    };
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
  }
}
