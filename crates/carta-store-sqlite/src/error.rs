//! Error type for `carta-store-sqlite`.

use carta_core::{Violation, conversation::ConversationId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] carta_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A column held a value that does not decode into its domain type.
  #[error("decode error: {0}")]
  Decode(String),

  #[error("conversation already exists: {0}")]
  ConversationExists(ConversationId),

  #[error("conversation not found: {0}")]
  ConversationNotFound(ConversationId),
}

impl From<Error> for carta_core::Error {
  fn from(err: Error) -> Self {
    match err {
      Error::Core(core) => core,
      Error::Json(json) => Self::Serialization(json),
      Error::ConversationNotFound(id) => Self::not_found(format!("conversation {id}")),
      Error::ConversationExists(id) => Violation::DuplicateConversation(id).into(),
      other => Self::store(other),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
