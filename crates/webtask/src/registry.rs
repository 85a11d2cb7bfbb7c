//! Transfer registry: routes transport callbacks to the owning task

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::RegistryError;
use crate::relocation::Relocation;
use crate::transport::{TransferId, TransferKind};

/// Per-transfer state held by the registry
pub struct TransferEntry<T> {
    pub kind: TransferKind,
    pub task: Weak<T>,
    data: BytesMut,
    relocation: Option<Arc<Relocation>>,
}

impl<T> TransferEntry<T> {
    fn new(kind: TransferKind, task: Weak<T>) -> Self {
        Self { kind, task, data: BytesMut::new(), relocation: None }
    }

    /// Bytes accumulated so far
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn take_data(&mut self) -> Bytes {
        std::mem::take(&mut self.data).freeze()
    }

    pub fn take_relocation(&mut self) -> Option<Arc<Relocation>> {
        self.relocation.take()
    }
}

/// Map from transfer identifier to task, buffered bytes and pending
/// relocation. Tasks are held weakly; the registry never keeps one alive.
///
/// Every operation runs under a single mutex, so a data chunk racing a
/// completion for the same transfer either lands before the entry is
/// removed or is dropped.
pub struct TransferRegistry<T> {
    entries: Mutex<HashMap<TransferId, TransferEntry<T>>>,
}

impl<T> TransferRegistry<T> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Register a transfer. An identifier that is already present is
    /// rejected and the existing entry is left untouched.
    pub fn register(
        &self,
        id: TransferId,
        kind: TransferKind,
        task: Weak<T>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            tracing::error!(transfer_id = %id, "Transfer identifier reused while still registered");
            return Err(RegistryError::Duplicate(id));
        }
        entries.insert(id, TransferEntry::new(kind, task));
        tracing::debug!(transfer_id = %id, kind = %kind, "Transfer registered");
        Ok(())
    }

    /// Look up the live task for a transfer
    pub fn resolve(&self, id: TransferId) -> Option<Arc<T>> {
        let entries = self.entries.lock();
        entries.get(&id).and_then(|entry| entry.task.upgrade())
    }

    pub fn kind(&self, id: TransferId) -> Option<TransferKind> {
        self.entries.lock().get(&id).map(|entry| entry.kind)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Remove a transfer, returning its entry. Idempotent.
    pub fn unregister(&self, id: TransferId) -> Option<TransferEntry<T>> {
        let removed = self.entries.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!(transfer_id = %id, "Transfer unregistered");
        }
        removed
    }

    /// Append a chunk to the transfer's buffer. Returns false for unknown ids.
    pub fn append_data(&self, id: TransferId, chunk: &[u8]) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.data.extend_from_slice(chunk);
                true
            }
            None => {
                tracing::debug!(transfer_id = %id, bytes = chunk.len(), "Dropping data for unknown transfer");
                false
            }
        }
    }

    /// Attach a pending relocation to a download. Returns false for unknown ids.
    pub fn attach_relocation(&self, id: TransferId, relocation: Arc<Relocation>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.relocation = Some(relocation);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every entry (client teardown)
    pub fn drain(&self) -> Vec<(TransferId, TransferEntry<T>)> {
        self.entries.lock().drain().collect()
    }
}

impl<T> Default for TransferRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
