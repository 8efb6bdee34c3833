use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{SpensoError, SpensoResult};
use crate::profile::Fields;

/// Remote document store holding profile documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get the store name
    fn name(&self) -> &str;

    /// Read a document. `None` when it does not exist.
    async fn get(&self, collection: &str, id: &str) -> SpensoResult<Option<Fields>>;

    /// Write the given fields, leaving all others untouched. Creates the
    /// document if it does not exist.
    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> SpensoResult<()>;
}

/// In-memory document store with scriptable failures
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, Fields>,
    read_failures: Mutex<VecDeque<SpensoError>>,
    write_failures: Mutex<VecDeque<SpensoError>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

fn document_key(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next read fail. Calls queue up.
    pub async fn fail_next_read(&self, error: impl Into<SpensoError>) {
        self.read_failures.lock().await.push_back(error.into());
    }

    /// Make the next write fail. Calls queue up.
    pub async fn fail_next_write(&self, error: impl Into<SpensoError>) {
        self.write_failures.lock().await.push_back(error.into());
    }

    /// Put a document in place without going through `merge`
    pub fn insert(&self, collection: &str, id: &str, fields: Fields) {
        self.documents.insert(document_key(collection, id), fields);
    }

    /// Current contents of a document
    pub fn document(&self, collection: &str, id: &str) -> Option<Fields> {
        self.documents
            .get(&document_key(collection, id))
            .map(|doc| doc.value().clone())
    }

    /// Reads attempted so far, failed ones included
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Writes attempted so far, failed ones included
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, collection: &str, id: &str) -> SpensoResult<Option<Fields>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.read_failures.lock().await.pop_front() {
            debug!(collection, id, "Injected read failure");
            return Err(error);
        }
        Ok(self.document(collection, id))
    }

    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> SpensoResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.write_failures.lock().await.pop_front() {
            debug!(collection, id, "Injected write failure");
            return Err(error);
        }

        let mut document = self.documents.entry(document_key(collection, id)).or_default();
        for (name, value) in fields {
            document.insert(name.clone(), value.clone());
        }
        trace!(collection, id, fields = fields.len(), "Document merged");
        Ok(())
    }
}
