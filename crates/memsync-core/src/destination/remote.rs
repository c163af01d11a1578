use std::path::Path;

use tracing::{debug, warn};

use super::{Capacity, Destination, DestinationIndex, Written};
use crate::error::DestinationError;
use crate::metadata::{self, EmbedError};
use crate::record::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub id: String,
    pub name: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageQuota {
    pub usage: u64,
    pub limit: Option<u64>,
}

/// Object operations against one pre-authorised folder/container.
pub trait ObjectStore {
    fn describe(&self) -> String;
    fn list(&self) -> Result<Vec<StoredObject>, DestinationError>;
    fn create(
        &self,
        name: &str,
        bytes: &[u8],
        mime_type: &str,
        attributes: &[(&'static str, String)],
    ) -> Result<StoredObject, DestinationError>;
    fn delete(&self, id: &str) -> Result<(), DestinationError>;
    fn quota(&self) -> Result<StorageQuota, DestinationError>;
}

/// Commits into an object store through one session that lives for the whole run.
pub struct RemoteDestination<S> {
    store: S,
}

impl<S: ObjectStore> RemoteDestination<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: ObjectStore> Destination for RemoteDestination<S> {
    fn describe(&self) -> String {
        self.store.describe()
    }

    fn snapshot(&mut self) -> Result<DestinationIndex, DestinationError> {
        let mut index = DestinationIndex::new();
        for object in self.store.list()? {
            index.insert(&object.name, object.id);
        }
        Ok(index)
    }

    fn capacity(&self) -> Result<Capacity, DestinationError> {
        let quota = self.store.quota()?;
        Ok(Capacity::Quota {
            usage: quota.usage,
            limit: quota.limit,
        })
    }

    fn write(&mut self, name: &str, bytes: &[u8], record: &Record) -> Result<Written, DestinationError> {
        let meta = record.metadata();
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        // Uploaded objects cannot be rewritten afterwards, so embed before the upload.
        let embedded = match metadata::embed_bytes(bytes, extension, &meta, record.parsed_date()) {
            Ok(updated) => Some(updated),
            Err(EmbedError::UnsupportedFormat(_)) | Err(EmbedError::NothingToWrite) => {
                debug!(name, "no in-file metadata slot, relying on object attributes");
                None
            }
            Err(e) => {
                warn!(name, error = %e, "failed embedding metadata before upload");
                None
            }
        };
        let metadata_embedded = embedded.is_some();
        let body = embedded.as_deref().unwrap_or(bytes);

        let mime = mime_guess::from_path(name).first_or_octet_stream();
        let created = self
            .store
            .create(name, body, mime.essence_str(), &meta.attributes())?;
        debug!(name, id = %created.id, link = ?created.link, "uploaded");

        Ok(Written {
            location: created.id,
            metadata_embedded,
        })
    }

    fn delete(&mut self, _name: &str, location: &str) -> Result<(), DestinationError> {
        self.store.delete(location)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    pub(crate) struct MemoryState {
        pub objects: Vec<(StoredObject, Vec<u8>, Vec<(&'static str, String)>)>,
        pub creates: usize,
        pub deletes: usize,
        pub quota: Option<StorageQuota>,
        pub fail_create: Option<(u16, String)>,
        pub fail_delete: bool,
        next_id: usize,
    }

    /// In-memory object store; clones share state so tests can inspect it after handing one off.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MemoryStore {
        pub state: Rc<RefCell<MemoryState>>,
    }

    impl MemoryStore {
        pub fn with_quota(usage: u64, limit: Option<u64>) -> Self {
            let store = Self::default();
            store.state.borrow_mut().quota = Some(StorageQuota { usage, limit });
            store
        }

        pub fn seed(&self, name: &str, bytes: &[u8]) -> String {
            let mut state = self.state.borrow_mut();
            state.next_id += 1;
            let id = format!("seed-{}", state.next_id);
            state.objects.push((
                StoredObject {
                    id: id.clone(),
                    name: name.to_string(),
                    link: None,
                },
                bytes.to_vec(),
                Vec::new(),
            ));
            id
        }

        pub fn named(&self, name: &str) -> Vec<Vec<u8>> {
            self.state
                .borrow()
                .objects
                .iter()
                .filter(|(o, _, _)| o.name == name)
                .map(|(_, b, _)| b.clone())
                .collect()
        }
    }

    impl ObjectStore for MemoryStore {
        fn describe(&self) -> String {
            "memory".to_string()
        }

        fn list(&self) -> Result<Vec<StoredObject>, DestinationError> {
            Ok(self.state.borrow().objects.iter().map(|(o, _, _)| o.clone()).collect())
        }

        fn create(
            &self,
            name: &str,
            bytes: &[u8],
            _mime_type: &str,
            attributes: &[(&'static str, String)],
        ) -> Result<StoredObject, DestinationError> {
            let mut state = self.state.borrow_mut();
            if let Some((status, message)) = state.fail_create.clone() {
                return Err(DestinationError::Status { status, message });
            }
            state.creates += 1;
            state.next_id += 1;
            let object = StoredObject {
                id: format!("obj-{}", state.next_id),
                name: name.to_string(),
                link: None,
            };
            state.objects.push((object.clone(), bytes.to_vec(), attributes.to_vec()));
            Ok(object)
        }

        fn delete(&self, id: &str) -> Result<(), DestinationError> {
            let mut state = self.state.borrow_mut();
            if state.fail_delete {
                return Err(DestinationError::Status {
                    status: 500,
                    message: "backend error".into(),
                });
            }
            state.deletes += 1;
            state.objects.retain(|(o, _, _)| o.id != id);
            Ok(())
        }

        fn quota(&self) -> Result<StorageQuota, DestinationError> {
            self.state
                .borrow()
                .quota
                .ok_or_else(|| DestinationError::Response("quota unavailable".into()))
        }
    }
}
