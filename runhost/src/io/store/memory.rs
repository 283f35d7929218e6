//! In-memory instance store (lost on restart).

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;

use super::{InstanceStore, StoreError, ValueSlot};
use crate::core::types::{CollectionKey, Instance};

type ValueKey = (ValueSlot, CollectionKey, String, String);

#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: RwLock<BTreeMap<CollectionKey, BTreeMap<String, Instance>>>,
    values: RwLock<BTreeMap<ValueKey, Value>>,
}

fn value_key(slot: ValueSlot, collection: &CollectionKey, id: &str, name: &str) -> ValueKey {
    (slot, collection.clone(), id.to_string(), name.to_string())
}

impl InstanceStore for MemoryStore {
    fn get(&self, collection: &CollectionKey, id: &str) -> Result<Option<Instance>, StoreError> {
        let instances = self.instances.read().map_err(|_| StoreError::Poisoned)?;
        Ok(instances
            .get(collection)
            .and_then(|by_id| by_id.get(id))
            .cloned())
    }

    fn get_all(&self, collection: &CollectionKey) -> Result<Vec<Instance>, StoreError> {
        let instances = self.instances.read().map_err(|_| StoreError::Poisoned)?;
        Ok(instances
            .get(collection)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default())
    }

    fn set(&self, collection: &CollectionKey, instance: &Instance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().map_err(|_| StoreError::Poisoned)?;
        instances
            .entry(collection.clone())
            .or_default()
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    fn remove(&self, collection: &CollectionKey, id: &str) -> Result<bool, StoreError> {
        let existed = {
            let mut instances = self.instances.write().map_err(|_| StoreError::Poisoned)?;
            instances
                .get_mut(collection)
                .and_then(|by_id| by_id.remove(id))
                .is_some()
        };
        let mut values = self.values.write().map_err(|_| StoreError::Poisoned)?;
        values.retain(|(_, value_collection, value_id, _), _| {
            !(value_collection == collection && value_id == id)
        });
        Ok(existed)
    }

    fn get_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        let values = self.values.read().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(&value_key(slot, collection, id, name)).cloned())
    }

    fn set_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let mut values = self.values.write().map_err(|_| StoreError::Poisoned)?;
        values.insert(value_key(slot, collection, id, name), value.clone());
        Ok(())
    }

    fn remove_value(
        &self,
        slot: ValueSlot,
        collection: &CollectionKey,
        id: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        let mut values = self.values.write().map_err(|_| StoreError::Poisoned)?;
        Ok(values.remove(&value_key(slot, collection, id, name)).is_some())
    }
}
