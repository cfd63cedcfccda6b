//! Local store abstraction for driftsync.
//!
//! This module provides the trait-based interface the sync core uses to
//! reach durable record storage, two reference implementations and the
//! schema registry used to decode erased payloads.
//!
//! # Design Principles
//! - Backend isolation: no backend-specific logic in the sync core
//! - Async operations: all I/O operations are async
//! - One error vocabulary: every backend reports `driftsync_common::Error`
//! - Outbox ordering: mutation events always come back in `createdAt` order

pub mod file;
pub mod memory;
pub mod registry;
pub mod store;

mod state;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use registry::{FieldType, ModelField, ModelRegistry, ModelSchema};
pub use store::LocalStore;
