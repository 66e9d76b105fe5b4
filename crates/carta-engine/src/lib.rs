//! The Carta query façade.
//!
//! [`Carta`] sits in front of any [`ConversationStore`] backend. It owns the
//! similarity index, serialises writers per conversation, and folds pending
//! changes into incremental metrics passes, either on demand or in a
//! background [`MetricsWorker`].
//!
//! [`ConversationStore`]: carta_core::store::ConversationStore

mod carta;
mod memory;
mod worker;

pub mod query;

pub use carta::{Carta, RefreshOutcome};
pub use memory::MemoryStore;
pub use worker::MetricsWorker;
