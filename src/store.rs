//! Storage capability traits for the cache synchronizer.
//!
//! The synchronizer talks to two stores through narrow seams:
//!
//! - [`BlobStore`] — put/delete of HTML bodies (production: R2 via
//!   [`crate::r2`]).
//! - [`KvStore`] — get/put of index records with a TTL (production:
//!   Workers KV via [`crate::kv`]).
//!
//! Provider-specific failure types stop at these traits: a KV "not found"
//! is `Ok(None)`, everything else is an `anyhow` error with no provider
//! detail the synchronizer could be tempted to match on.
//!
//! The in-memory implementations ([`MemBlobStore`], [`MemKvStore`]) back
//! the scenario tests. They share an [`OpJournal`] so tests can assert the
//! cross-store operation order, and they support failure injection for the
//! blob-put / KV-put failure scenarios.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

/// One blob upload: body plus the headers and metadata stored with it.
#[derive(Debug, Clone)]
pub struct BlobUpload {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub cache_control: String,
    /// Flat string map: index-record fields plus stringified SEO signals.
    pub metadata: BTreeMap<String, String>,
}

/// Blob storage: upload and delete HTML bodies by key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, upload: BlobUpload) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Key-value storage for index records.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. `Ok(None)` means the key does not exist; `Err` means
    /// the read itself failed.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value with a TTL in seconds.
    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
}

// ============ In-memory implementations ============

/// Shared, ordered log of store operations. Each store records an entry on
/// every call (including calls that then fail), so tests can assert both
/// presence and order.
#[derive(Debug, Clone, Default)]
pub struct OpJournal(Arc<Mutex<Vec<String>>>);

impl OpJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, op: impl Into<String>) {
        self.0.lock().expect("journal poisoned").push(op.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal poisoned").clone()
    }
}

/// In-memory [`BlobStore`] with failure injection.
#[derive(Default)]
pub struct MemBlobStore {
    objects: Mutex<HashMap<String, BlobUpload>>,
    journal: OpJournal,
    fail_put: bool,
    fail_delete: bool,
}

impl MemBlobStore {
    pub fn new(journal: OpJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    /// Make every `put` fail.
    pub fn failing_put(mut self) -> Self {
        self.fail_put = true;
        self
    }

    /// Make every `delete` fail.
    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    /// Seed an existing object, bypassing the journal.
    pub fn seed(&self, key: &str) {
        self.objects.lock().expect("objects poisoned").insert(
            key.to_string(),
            BlobUpload {
                key: key.to_string(),
                body: Vec::new(),
                content_type: String::new(),
                cache_control: String::new(),
                metadata: BTreeMap::new(),
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .expect("objects poisoned")
            .contains_key(key)
    }

    pub fn stored(&self, key: &str) -> Option<BlobUpload> {
        self.objects
            .lock()
            .expect("objects poisoned")
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl BlobStore for MemBlobStore {
    async fn put(&self, upload: BlobUpload) -> Result<()> {
        self.journal.record(format!("blob.put {}", upload.key));
        if self.fail_put {
            bail!("injected blob put failure");
        }
        self.objects
            .lock()
            .expect("objects poisoned")
            .insert(upload.key.clone(), upload);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.journal.record(format!("blob.delete {}", key));
        if self.fail_delete {
            bail!("injected blob delete failure");
        }
        self.objects.lock().expect("objects poisoned").remove(key);
        Ok(())
    }
}

/// In-memory [`KvStore`] with failure injection.
#[derive(Default)]
pub struct MemKvStore {
    values: Mutex<HashMap<String, (String, u64)>>,
    journal: OpJournal,
    fail_get: bool,
    fail_put: bool,
}

impl MemKvStore {
    pub fn new(journal: OpJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    /// Make every `get` fail (distinct from "not found").
    pub fn failing_get(mut self) -> Self {
        self.fail_get = true;
        self
    }

    /// Make every `put` fail.
    pub fn failing_put(mut self) -> Self {
        self.fail_put = true;
        self
    }

    /// Seed a prior record, bypassing the journal.
    pub fn seed(&self, key: &str, value: &str) {
        self.values
            .lock()
            .expect("values poisoned")
            .insert(key.to_string(), (value.to_string(), 0));
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .expect("values poisoned")
            .get(key)
            .map(|(v, _)| v.clone())
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.values
            .lock()
            .expect("values poisoned")
            .get(key)
            .map(|(_, ttl)| *ttl)
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.journal.record(format!("kv.get {}", key));
        if self.fail_get {
            bail!("injected kv get failure");
        }
        Ok(self.value(key))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.journal.record(format!("kv.put {}", key));
        if self.fail_put {
            bail!("injected kv put failure");
        }
        self.values
            .lock()
            .expect("values poisoned")
            .insert(key.to_string(), (value.to_string(), ttl_secs));
        Ok(())
    }
}
