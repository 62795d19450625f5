//! Key → field routing for persisted settings

use anyhow::anyhow;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

use crate::error::{SettingsError, SettingsResult};
use crate::service::FieldRef;
use crate::settings::store::SettingStore;
use crate::types::SettingSpec;

/// One bound setting: the durable key, the field path it drives and the
/// field slot itself.
pub struct Binding {
    pub key: String,
    pub path: String,
    pub field: FieldRef,
}

/// Remembers which exported field every setting key drives, so change
/// notifications route without a global search. Built once at startup.
#[derive(Default)]
pub struct SettingRegistry {
    bindings: HashMap<String, Binding>,
}

impl SettingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a key with a setting-backed field. Must happen before
    /// `initialize`. Rebinding a key is a wiring bug.
    pub fn bind(&mut self, key: &str, field: &FieldRef) -> SettingsResult<()> {
        if self.bindings.contains_key(key) {
            return Err(SettingsError::DuplicateBinding(key.to_string()));
        }
        let path = field.borrow().path.clone();
        if field.borrow().setting.is_none() {
            return Err(anyhow!("field {path} carries no setting metadata").into());
        }
        debug!(key = %key, path = %path, "bound setting");
        self.bindings.insert(
            key.to_string(),
            Binding {
                key: key.to_string(),
                path,
                field: Rc::clone(field),
            },
        );
        Ok(())
    }

    /// Two-phase startup dance: the store needs every default before it
    /// can decide create-or-preserve, and each field must then reflect the
    /// durable value rather than its compile-time default. Repeating this
    /// with identical bindings causes no additional durable writes.
    pub fn initialize(&self, store: &mut SettingStore) -> SettingsResult<()> {
        let mut specs: Vec<(String, SettingSpec)> = Vec::with_capacity(self.bindings.len());
        for binding in self.bindings.values() {
            // bind() guarantees the metadata is present
            if let Some(spec) = binding.field.borrow().setting.clone() {
                specs.push((binding.key.clone(), spec));
            }
        }
        store.register(specs)?;

        for binding in self.bindings.values() {
            let value = store.get(&binding.key)?;
            debug!(key = %binding.key, value = %value, "applying stored setting");
            binding.field.borrow_mut().publish(value);
        }
        Ok(())
    }

    /// Used by the change propagator to route a store notification.
    pub fn resolve(&self, key: &str) -> SettingsResult<&Binding> {
        self.bindings
            .get(key)
            .ok_or_else(|| SettingsError::UnknownKey(key.to_string()))
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.values()
    }
}
