//! Core types and algorithms for the Carta conversation atlas.
//!
//! A conversation is a tree: one root message fanning out into alternate
//! continuations. This crate holds the data model, the derived-metrics
//! engine, the pair deriver, the similarity index, and the bounded traversal
//! algorithms. It is deliberately free of database and runtime dependencies;
//! storage backends implement [`store::ConversationStore`].

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod ancestry;
pub mod config;
pub mod conversation;
pub mod error;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod pair;
pub mod pairs;
pub mod score;
pub mod stats;
pub mod store;
pub mod traversal;
pub mod tree;
pub mod vector;

pub use error::{Error, ErrorKind, Result, Violation};
