//! Common utilities and types shared across driftsync crates.
//!
//! This crate holds the erased record representation, the outbox data model
//! and the query predicate language, so that storage backends and the sync
//! core agree on one vocabulary.

pub mod error;
pub mod model;
pub mod query;
pub mod types;

pub use error::{Error, Result};
pub use model::{AnyModel, DeadLetter, MutationEvent, MutationSync, MutationSyncMetadata, MutationType};
pub use query::{compare_models, sort_models, QueryOperator, QueryPredicate, QuerySortDescriptor, SortOrder};
pub use types::{monotonic_timestamp, ModelId, ModelName};
