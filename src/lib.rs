//! # tbone - Document models for async services
//!
//! tbone declares document models as schemas of typed fields, converts
//! instances between their wire form (JSON) and their native form, and
//! persists them in a document store with bounded retries. Writes emit
//! async signals, and channels carry events over a capped log to
//! subscribed carriers.
//!
//! ## Core Concepts
//!
//! - **Field**: Import, export, validation and async serialization of one
//!   attribute, including lists, dicts and embedded models
//! - **Schema**: An ordered, inheritable set of fields and derived values
//! - **Model**: An instance of a schema holding native values
//! - **Collection**: A schema bound to a store collection with retrying CRUD
//! - **Signal**: Async publish/subscribe between in-process components
//! - **Channel**: Named event stream over a capped log with a tailing consumer
//!
//! ## Usage
//!
//! ```rust
//! use serde_json::json;
//! use tbone::{Field, Model, Projection, Schema};
//!
//! let person = Schema::builder("Person")
//!     .field("name", Field::string().required())
//!     .field("age", Field::integer().min(0.0))
//!     .field("password", Field::string().projection(Projection::Never))
//!     .build()?;
//!
//! let mut alice = Model::new(&person);
//! alice.deserialize(&json!({"name": "Alice", "age": "31"}))?;
//! assert_eq!(alice.get("age").and_then(|v| v.as_int()), Some(31));
//! # Ok::<(), tbone::TboneError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod object_id;
pub mod value;

// Declarations and instances
pub mod field;
pub mod model;

// Storage, persistence and dispatch
pub mod dispatch;
pub mod persist;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use config::{ChannelConfig, RetryPolicy};
pub use error::{
    ConfigError, FieldError, SignalError, TboneError, TboneResult, ValidationError,
};
pub use field::{Field, FieldKind, Projection, ScalarKind, Validator};
pub use model::{DerivedValue, Model, ModelTypeId, Schema, SchemaBuilder};
pub use object_id::{DbRef, ObjectId};
pub use value::{NativeMap, Value};

pub use dispatch::{channels, Carrier, Channel, ChannelState, MpscCarrier, SenderKey, Signal};
pub use persist::{model_signals, Collection, CollectionBuilder, ModelSignals, WriteEvent};
pub use storage::{
    Document, DocumentStore, IndexSpec, MemoryStore, Query, SortOrder, StoreError, StoreHandle,
};

/// Builds a `Document` from a JSON object literal.
///
/// Anything other than an object literal yields an empty document.
///
/// ```
/// let filter = tbone::doc!({"isbn": "123", "pages": {"$gt": 100}});
/// assert_eq!(filter.len(), 2);
/// ```
#[macro_export]
macro_rules! doc {
    ($($json:tt)+) => {
        match ::serde_json::json!($($json)+) {
            ::serde_json::Value::Object(map) => map,
            _ => $crate::Document::new(),
        }
    };
}
