pub mod drive;
pub mod local;
pub mod remote;

use std::collections::HashMap;

use crate::error::DestinationError;
use crate::record::Record;

pub use drive::DriveStore;
pub use local::LocalDestination;
pub use remote::{ObjectStore, RemoteDestination, StorageQuota, StoredObject};

/// How much room a destination reports before a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Free bytes on the filesystem holding the target directory, if it could be found
    FreeSpace(Option<u64>),
    /// Account-level quota; a missing limit means the store enforces none
    Quota { usage: u64, limit: Option<u64> },
}

/// A successful write: where the bytes ended up and whether provenance was embedded.
#[derive(Debug, Clone)]
pub struct Written {
    pub location: String,
    pub metadata_embedded: bool,
}

/// Storage backend the sync manager commits into.
pub trait Destination {
    /// Human-readable target, used in logs and error messages.
    fn describe(&self) -> String;
    /// Names currently present at the target, with their location references.
    fn snapshot(&mut self) -> Result<DestinationIndex, DestinationError>;
    fn capacity(&self) -> Result<Capacity, DestinationError>;
    fn write(&mut self, name: &str, bytes: &[u8], record: &Record) -> Result<Written, DestinationError>;
    fn delete(&mut self, name: &str, location: &str) -> Result<(), DestinationError>;
}

/// Existing-name index: name -> location references (paths or object IDs).
/// A remote store may hold several objects under one name.
#[derive(Debug, Clone, Default)]
pub struct DestinationIndex {
    entries: HashMap<String, Vec<String>>,
}

impl DestinationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, location: String) {
        self.entries.entry(name.to_string()).or_default().push(location);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|locs| !locs.is_empty())
    }

    pub fn get(&self, name: &str) -> &[String] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn remove(&mut self, name: &str) -> Vec<String> {
        self.entries.remove(name).unwrap_or_default()
    }

    /// Whether any existing name begins with `prefix`.
    pub fn any_starts_with(&self, prefix: &str) -> bool {
        self.entries.keys().any(|name| name.starts_with(prefix))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
