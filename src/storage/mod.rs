//! Document storage.
//!
//! `DocumentStore` is the contract collections and channels are written
//! against; `MemoryStore` is the bundled implementation.

use std::sync::Arc;

mod memory;
mod traits;

pub use memory::MemoryStore;
pub use traits::{
    CappedOptions, CollectionOptions, Document, DocumentStore, IndexSpec, LogRecord, Query,
    SortOrder, StoreError, StoreResult, UpdateResult,
};

/// Shared handle to a store.
pub type StoreHandle = Arc<dyn DocumentStore>;
