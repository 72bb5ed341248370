//! Write lifecycle signals emitted by collections.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::dispatch::Signal;
use crate::model::{Model, ModelTypeId};
use crate::storage::StoreHandle;

/// Payload of a single-instance write signal.
pub struct WriteEvent {
    /// Model type of the written instance.
    pub sender: ModelTypeId,
    /// Store the write went to.
    pub store: StoreHandle,
    /// Snapshot of the written instance.
    pub instance: Model,
    /// True when the write created the document.
    pub created: bool,
}

/// Payload of a bulk insert signal.
pub struct BulkWriteEvent {
    /// Model type of the inserted instances.
    pub sender: ModelTypeId,
    /// Store the insert went to.
    pub store: StoreHandle,
    /// Snapshot of the inserted instances.
    pub instances: Vec<Model>,
}

impl fmt::Debug for WriteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteEvent")
            .field("sender", &self.sender)
            .field("instance", &self.instance)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for BulkWriteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkWriteEvent")
            .field("sender", &self.sender)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

/// The signals a collection emits around writes.
///
/// A failing `pre_save` receiver aborts the write. Failures of the other
/// signals are logged and never undo a committed write.
#[derive(Debug)]
pub struct ModelSignals {
    /// Sent before a save or insert; a failing receiver aborts the write.
    pub pre_save: Signal<WriteEvent>,
    /// Sent after a save, insert or update.
    pub post_save: Signal<WriteEvent>,
    /// Sent after a delete.
    pub post_delete: Signal<WriteEvent>,
    /// Sent after `insert_many`.
    pub post_bulk_save: Signal<BulkWriteEvent>,
}

impl ModelSignals {
    /// Fresh signals with no receivers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pre_save: Signal::new("pre_save"),
            post_save: Signal::new("post_save"),
            post_delete: Signal::new("post_delete"),
            post_bulk_save: Signal::new("post_bulk_save"),
        }
    }
}

impl Default for ModelSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Signals shared by every collection that does not bring its own.
pub fn model_signals() -> Arc<ModelSignals> {
    static SIGNALS: OnceLock<Arc<ModelSignals>> = OnceLock::new();
    Arc::clone(SIGNALS.get_or_init(|| Arc::new(ModelSignals::new())))
}
