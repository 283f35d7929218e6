//! Instance store backed by JSON files.
//!
//! Layout under the root directory:
//!
//! ```text
//! {kind}/{collection}/{id}/instance.json
//! {kind}/{collection}/{id}/parameters/{name}.json
//! {kind}/{collection}/{id}/results/{name}.json
//! ```
//!
//! Every path segment derived from a name goes through `encode_segment`.
//! Writes are atomic (temp file + rename).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::{InstanceStore, StoreError, ValueSlot, encode_segment};
use crate::core::types::{CollectionKey, Instance};
use crate::io::fs_atomic::write_atomic;

const INSTANCE_FILE: &str = "instance.json";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root).map_err(|source| StoreError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn collection_dir(&self, collection: &CollectionKey) -> PathBuf {
        self.root
            .join(collection.kind.segment())
            .join(encode_segment(&collection.name))
    }

    fn instance_dir(&self, collection: &CollectionKey, id: &str) -> PathBuf {
        self.collection_dir(collection).join(encode_segment(id))
    }

    fn value_path(&self, slot: ValueSlot, collection: &CollectionKey, id: &str, name: &str) -> PathBuf {
        self.instance_dir(collection, id)
            .join(slot.segment())
            .join(format!("{}.json", encode_segment(name)))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut buf = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
        what: path.display().to_string(),
        source,
    })?;
    buf.push('\n');
    write_atomic(path, &buf).map_err(|err| StoreError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::other(format!("{err:#}")),
    })
}

fn remove_path(path: &Path, recursive: bool) -> Result<bool, StoreError> {
    let result = if recursive {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl InstanceStore for FileStore {
    fn get(&self, collection: &CollectionKey, id: &str) -> Result<Option<Instance>, StoreError> {
        read_json(&self.instance_dir(collection, id).join(INSTANCE_FILE))
    }

    fn get_all(&self, collection: &CollectionKey) -> Result<Vec<Instance>, StoreError> {
        let dir = self.collection_dir(collection);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut instances = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(INSTANCE_FILE);
            match read_json::<Instance>(&path) {
                Ok(Some(instance)) => instances.push(instance),
                // Directory left behind by a concurrent remove.
                Ok(None) => debug!(path = %path.display(), "skipping directory without instance"),
                Err(err) => {
                    warn!(err = %err, "skipping unreadable instance record");
                }
            }
        }
        Ok(instances)
    }

    fn set(&self, collection: &CollectionKey, instance: &Instance) -> Result<(), StoreError> {
        write_json(
            &self.instance_dir(collection, &instance.id).join(INSTANCE_FILE),
            instance,
        )
    }

    fn remove(&self, collection: &CollectionKey, id: &str) -> Result<bool, StoreError> {
        remove_path(&self.instance_dir(collection, id), true)
    }

    fn get_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        read_json(&self.value_path(slot, collection, id, name))
    }

    fn set_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        write_json(&self.value_path(slot, collection, id, name), value)
    }

    fn remove_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        remove_path(&self.value_path(slot, collection, id, name), false)
    }
}
