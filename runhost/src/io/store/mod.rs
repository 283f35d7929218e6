//! Instance persistence.
//!
//! [`InstanceStore`] is the pluggable key-value backend, keyed by collection
//! and instance id, with a separate slot per instance for out-of-band
//! parameter and result values. [`Instances`] wraps a backend and decides
//! which values are large enough to live out-of-band.

mod file;
mod memory;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::core::types::{CollectionKey, Instance, Status};
use crate::io::config::{StoreBackend, StoreConfig};

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store record {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store lock poisoned")]
    Poisoned,
}

/// Which out-of-band value slot of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueSlot {
    Parameter,
    Result,
}

impl ValueSlot {
    pub fn segment(self) -> &'static str {
        match self {
            ValueSlot::Parameter => "parameters",
            ValueSlot::Result => "results",
        }
    }
}

/// Key-value persistence for instances and their out-of-band values.
pub trait InstanceStore: Send + Sync {
    fn get(&self, collection: &CollectionKey, id: &str) -> Result<Option<Instance>, StoreError>;

    fn get_all(&self, collection: &CollectionKey) -> Result<Vec<Instance>, StoreError>;

    fn set(&self, collection: &CollectionKey, instance: &Instance) -> Result<(), StoreError>;

    /// Remove an instance and all its out-of-band values. Returns whether it existed.
    fn remove(&self, collection: &CollectionKey, id: &str) -> Result<bool, StoreError>;

    fn get_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<Option<Value>, StoreError>;

    fn set_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), StoreError>;

    /// Remove one out-of-band value. Returns whether it existed.
    fn remove_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<bool, StoreError>;
}

/// Which out-of-band values to embed into a read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    None,
    All,
    Names(Vec<String>),
}

impl Selection {
    pub fn includes(&self, name: &str) -> bool {
        match self {
            Selection::None => false,
            Selection::All => true,
            Selection::Names(names) => names.iter().any(|candidate| candidate == name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Embed {
    pub parameters: Selection,
    pub results: Selection,
}

impl Embed {
    pub fn all() -> Self {
        Self {
            parameters: Selection::All,
            results: Selection::All,
        }
    }

    pub fn parameters() -> Self {
        Self {
            parameters: Selection::All,
            results: Selection::None,
        }
    }
}

/// Open the backend selected by `config`.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn InstanceStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("using in-memory instance store");
            Ok(Arc::new(MemoryStore::default()))
        }
        StoreBackend::File => {
            let store = FileStore::open(&config.dir)
                .with_context(|| format!("open instance store {}", config.dir.display()))?;
            info!(dir = %config.dir.display(), "using file instance store");
            Ok(Arc::new(store))
        }
    }
}

/// Instance access with automatic out-of-band placement of large values.
#[derive(Clone)]
pub struct Instances {
    backend: Arc<dyn InstanceStore>,
    inline_limit_bytes: usize,
}

impl Instances {
    pub fn new(backend: Arc<dyn InstanceStore>, inline_limit_bytes: usize) -> Self {
        Self {
            backend,
            inline_limit_bytes,
        }
    }

    /// Read a stored record as persisted (out-of-band values not embedded).
    pub fn get(&self, collection: &CollectionKey, id: &str) -> Result<Option<Instance>, StoreError> {
        self.backend.get(collection, id)
    }

    /// Read a record with the selected out-of-band values embedded.
    pub fn get_embedded(
        &self,
        collection: &CollectionKey,
        id: &str,
        embed: &Embed,
    ) -> Result<Option<Instance>, StoreError> {
        match self.backend.get(collection, id)? {
            Some(instance) => self.embed(collection, instance, embed).map(Some),
            None => Ok(None),
        }
    }

    /// Copy selected out-of-band values into the inline maps.
    pub fn embed(
        &self,
        collection: &CollectionKey,
        mut instance: Instance,
        embed: &Embed,
    ) -> Result<Instance, StoreError> {
        for name in instance.parameters_stored.clone() {
            if !embed.parameters.includes(&name) {
                continue;
            }
            if let Some(value) =
                self.backend
                    .get_value(ValueSlot::Parameter, collection, &instance.id, &name)?
            {
                instance.parameters.insert(name, value);
            }
        }
        for name in instance.results_stored.clone() {
            if !embed.results.includes(&name) {
                continue;
            }
            if let Some(value) =
                self.backend
                    .get_value(ValueSlot::Result, collection, &instance.id, &name)?
            {
                instance.results.insert(name, value);
            }
        }
        Ok(instance)
    }

    /// List a collection, optionally filtered by status, ordered by creation time then id.
    pub fn list(
        &self,
        collection: &CollectionKey,
        status: Option<Status>,
    ) -> Result<Vec<Instance>, StoreError> {
        let mut instances: Vec<Instance> = self
            .backend
            .get_all(collection)?
            .into_iter()
            .filter(|instance| status.is_none_or(|wanted| instance.status == wanted))
            .collect();
        instances.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(instances)
    }

    /// Persist `instance`, moving values above the inline limit out-of-band.
    ///
    /// Returns the record as stored.
    pub fn save(
        &self,
        collection: &CollectionKey,
        mut instance: Instance,
    ) -> Result<Instance, StoreError> {
        let id = instance.id.clone();
        self.place_values(
            ValueSlot::Parameter,
            collection,
            &id,
            &mut instance.parameters,
            &mut instance.parameters_stored,
        )?;
        self.place_values(
            ValueSlot::Result,
            collection,
            &id,
            &mut instance.results,
            &mut instance.results_stored,
        )?;
        self.backend.set(collection, &instance)?;
        Ok(instance)
    }

    pub fn remove(&self, collection: &CollectionKey, id: &str) -> Result<bool, StoreError> {
        self.backend.remove(collection, id)
    }

    pub fn value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.backend.get_value(slot, collection, id, name)
    }

    pub fn set_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        self.backend.set_value(slot, collection, id, name, value)
    }

    pub fn remove_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        self.backend.remove_value(slot, collection, id, name)
    }

    fn place_values(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        inline: &mut Map<String, Value>,
        stored: &mut Vec<String>,
    ) -> Result<(), StoreError> {
        let mut moved = Vec::new();
        for (name, value) in inline.iter() {
            let encoded = serde_json::to_vec(value).map_err(|source| StoreError::Serialize {
                what: format!("{} '{}'", slot.segment(), name),
                source,
            })?;
            if encoded.len() > self.inline_limit_bytes {
                self.backend.set_value(slot, collection, id, name, value)?;
                moved.push(name.clone());
            } else if stored.contains(name) {
                // A small inline value replaces an older out-of-band one.
                self.backend.remove_value(slot, collection, id, name)?;
                stored.retain(|candidate| candidate != name);
            }
        }
        for name in moved {
            debug!(slot = slot.segment(), name = %name, "value stored out-of-band");
            inline.remove(&name);
            if !stored.contains(&name) {
                stored.push(name);
            }
        }
        Ok(())
    }
}

/// Encode an arbitrary name as a single safe path segment.
///
/// ASCII letters, digits, `-` and `_` pass through; every other byte becomes
/// `%XX`, so `.`, `/` and `..` can never escape the parent directory.
pub(crate) fn encode_segment(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}
