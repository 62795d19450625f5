//! Durable key/value storage for registered settings
//!
//! Values live in a flat TOML table keyed by the full setting path. Every
//! mutation is persisted immediately with a write-temp-then-rename so a
//! crash can never leave a half-applied write. Edits made by other
//! processes are picked up by `poll_external`, which re-reads the file and
//! diffs it against the in-memory image.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::constants;
use crate::error::{SettingsError, SettingsResult};
use crate::types::{FieldValue, SettingSpec};

/// Callback for changes arriving through any channel other than this
/// process's own `set`. One per store; a later registration replaces it.
pub type ExternalChangeHandler = Box<dyn FnMut(&str, &FieldValue, &FieldValue)>;

pub struct SettingStore {
    path: PathBuf,
    values: BTreeMap<String, FieldValue>,
    specs: BTreeMap<String, SettingSpec>,
    on_external: Option<ExternalChangeHandler>,
}

impl SettingStore {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(constants::store::APP_DIR);
        path.push(constants::store::FILENAME);
        path
    }

    /// Open the durable store. Failure here is fatal for the process: no
    /// core functionality is possible without durable storage.
    pub fn open(path: impl Into<PathBuf>) -> SettingsResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SettingsError::StoreUnavailable(format!(
                    "cannot create {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let values = Self::read_file(&path)
            .map_err(|e| SettingsError::StoreUnavailable(format!("{}: {e:#}", path.display())))?;
        Ok(Self {
            path,
            values,
            specs: BTreeMap::new(),
            on_external: None,
        })
    }

    fn read_file(path: &Path) -> Result<BTreeMap<String, FieldValue>> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .context(format!("failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).context(format!("failed to read {}", path.display())),
        }
    }

    fn persist(&self) -> SettingsResult<()> {
        let contents = toml::to_string_pretty(&self.values)
            .map_err(|e| SettingsError::StoreUnavailable(e.to_string()))?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, contents)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                SettingsError::StoreUnavailable(format!("{}: {e}", self.path.display()))
            })?;
        Ok(())
    }

    /// Register the full set of settings this process needs. Keys absent
    /// from durable storage are created with their defaults; keys already
    /// present keep their durable value (the default is never reapplied).
    /// A duplicate key in the input fails the whole registration before
    /// anything is mutated. Re-registering an identical set is a no-op on
    /// disk.
    pub fn register(
        &mut self,
        specs: impl IntoIterator<Item = (String, SettingSpec)>,
    ) -> SettingsResult<()> {
        let mut incoming: BTreeMap<String, SettingSpec> = BTreeMap::new();
        for (key, spec) in specs {
            if key.is_empty() || !key.starts_with('/') {
                return Err(anyhow::anyhow!("malformed setting key: {key:?}").into());
            }
            if incoming.insert(key.clone(), spec).is_some() {
                return Err(SettingsError::DuplicateBinding(key));
            }
        }

        let mut created = 0usize;
        for (key, spec) in &incoming {
            if !self.values.contains_key(key) {
                self.values.insert(key.clone(), spec.default.clone());
                created += 1;
            }
        }
        self.specs = incoming;
        if created > 0 {
            self.persist()?;
            info!(created, path = %self.path.display(), "created missing settings with defaults");
        }
        Ok(())
    }

    /// Current durable value of a registered key.
    pub fn get(&self, key: &str) -> SettingsResult<FieldValue> {
        if !self.specs.contains_key(key) {
            return Err(SettingsError::UnknownKey(key.to_string()));
        }
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| SettingsError::UnknownKey(key.to_string()))
    }

    /// Deliberate local write: validate, persist, done. Out-of-range
    /// values are rejected (never clamped) and leave the durable value
    /// intact. Does not fire the external-change handler; file and memory
    /// move together, so the next poll sees no difference.
    pub fn set(&mut self, key: &str, value: FieldValue) -> SettingsResult<()> {
        let spec = self
            .specs
            .get(key)
            .ok_or_else(|| SettingsError::UnknownKey(key.to_string()))?;
        if let Some(bounds) = spec.bounds {
            let Some(v) = value.as_f64() else {
                warn!(key = %key, value = %value, "rejecting non-numeric write to bounded setting");
                return Err(SettingsError::OutOfBounds {
                    key: key.to_string(),
                    value,
                    min: bounds.min,
                    max: bounds.max,
                });
            };
            if !bounds.contains(v) {
                warn!(key = %key, value = %value, min = bounds.min, max = bounds.max,
                      "rejecting out-of-bounds write");
                return Err(SettingsError::OutOfBounds {
                    key: key.to_string(),
                    value,
                    min: bounds.min,
                    max: bounds.max,
                });
            }
        }

        let prev = self.values.insert(key.to_string(), value.clone());
        if let Err(e) = self.persist() {
            // Roll back so memory never runs ahead of disk
            match prev {
                Some(p) => {
                    self.values.insert(key.to_string(), p);
                }
                None => {
                    self.values.remove(key);
                }
            }
            return Err(e);
        }
        debug!(key = %key, value = %value, "stored setting");
        Ok(())
    }

    pub fn on_external_change(&mut self, handler: ExternalChangeHandler) {
        self.on_external = Some(handler);
    }

    /// Re-read the backing file and fire the external-change handler for
    /// every registered key whose durable value no longer matches the
    /// in-memory image. Returns the number of changes propagated. A
    /// transient read or parse failure here is logged and dropped, never
    /// fatal.
    pub fn poll_external(&mut self) -> usize {
        let disk = match Self::read_file(&self.path) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "dropping external poll, settings file unreadable");
                return 0;
            }
        };

        let mut changes = Vec::new();
        for key in self.specs.keys() {
            let Some(new) = disk.get(key) else { continue };
            if let Some(old) = self.values.get(key)
                && old != new
            {
                changes.push((key.clone(), old.clone(), new.clone()));
            }
        }

        let count = changes.len();
        for (key, old, new) in changes {
            info!(key = %key, old = %old, new = %new, "setting changed externally");
            self.values.insert(key.clone(), new.clone());
            if let Some(handler) = self.on_external.as_mut() {
                handler(&key, &old, &new);
            }
        }
        count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const CAPACITY: &str = "/Settings/Tank/1/Capacity";
    const NAME: &str = "/Settings/Tank/1/CustomName";

    fn capacity_spec() -> SettingSpec {
        SettingSpec::bounded(0i64, 0.0, 1000.0)
    }

    fn open_registered(path: &Path) -> SettingStore {
        let mut store = SettingStore::open(path).unwrap();
        store
            .register(vec![
                (CAPACITY.to_string(), capacity_spec()),
                (NAME.to_string(), SettingSpec::new("")),
            ])
            .unwrap();
        store
    }

    #[test]
    fn test_register_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_registered(&dir.path().join("settings.toml"));
        assert_eq!(store.get(CAPACITY).unwrap(), FieldValue::Int(0));
        assert_eq!(store.get(NAME).unwrap(), FieldValue::from(""));
    }

    #[test]
    fn test_register_preserves_existing_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let mut store = open_registered(&path);
        store.set(CAPACITY, FieldValue::Int(500)).unwrap();
        drop(store);

        // Restart: the default must not be reapplied over the stored value
        let store = open_registered(&path);
        assert_eq!(store.get(CAPACITY).unwrap(), FieldValue::Int(500));
    }

    #[test]
    fn test_register_duplicate_key_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingStore::open(dir.path().join("settings.toml")).unwrap();
        let err = store
            .register(vec![
                (CAPACITY.to_string(), capacity_spec()),
                (CAPACITY.to_string(), capacity_spec()),
            ])
            .unwrap_err();
        assert!(matches!(err, SettingsError::DuplicateBinding(_)));
        assert!(matches!(
            store.get(CAPACITY),
            Err(SettingsError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_reregister_identical_set_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut store = open_registered(&path);

        let before = fs::read_to_string(&path).unwrap();
        store
            .register(vec![
                (CAPACITY.to_string(), capacity_spec()),
                (NAME.to_string(), SettingSpec::new("")),
            ])
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_register_rejects_malformed_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingStore::open(dir.path().join("settings.toml")).unwrap();
        assert!(
            store
                .register(vec![("no-leading-slash".to_string(), capacity_spec())])
                .is_err()
        );
    }

    #[test]
    fn test_get_unregistered_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingStore::open(dir.path().join("settings.toml")).unwrap();
        assert!(matches!(
            store.get(CAPACITY),
            Err(SettingsError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_out_of_bounds_write_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut store = open_registered(&path);
        store.set(CAPACITY, FieldValue::Int(500)).unwrap();

        for bad in [FieldValue::Int(-1), FieldValue::Int(2000), FieldValue::Float(1000.5)] {
            let err = store.set(CAPACITY, bad).unwrap_err();
            assert!(matches!(err, SettingsError::OutOfBounds { .. }));
        }
        // Durable value intact after every rejection, in memory and on disk
        assert_eq!(store.get(CAPACITY).unwrap(), FieldValue::Int(500));
        let reopened = open_registered(&path);
        assert_eq!(reopened.get(CAPACITY).unwrap(), FieldValue::Int(500));
    }

    #[test]
    fn test_non_numeric_write_to_bounded_setting_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_registered(&dir.path().join("settings.toml"));
        assert!(store.set(CAPACITY, FieldValue::from("lots")).is_err());
        assert_eq!(store.get(CAPACITY).unwrap(), FieldValue::Int(0));
    }

    #[test]
    fn test_unbounded_text_setting_accepts_any_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_registered(&dir.path().join("settings.toml"));
        store.set(NAME, FieldValue::from("Fresh Water")).unwrap();
        assert_eq!(store.get(NAME).unwrap(), FieldValue::from("Fresh Water"));
    }

    #[test]
    fn test_local_set_does_not_fire_external_handler() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_registered(&dir.path().join("settings.toml"));

        let fired = Rc::new(RefCell::new(0usize));
        let fired_in_handler = Rc::clone(&fired);
        store.on_external_change(Box::new(move |_key, _old, _new| {
            *fired_in_handler.borrow_mut() += 1;
        }));

        store.set(CAPACITY, FieldValue::Int(500)).unwrap();
        assert_eq!(store.poll_external(), 0);
        assert_eq!(*fired.borrow(), 0);
    }

    #[test]
    fn test_external_edit_detected_and_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut store = open_registered(&path);
        store.set(CAPACITY, FieldValue::Int(500)).unwrap();

        // Another process edits the same durable store
        let mut other = open_registered(&path);
        other.set(CAPACITY, FieldValue::Int(750)).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in_handler = Rc::clone(&seen);
        store.on_external_change(Box::new(move |key, old, new| {
            seen_in_handler
                .borrow_mut()
                .push((key.to_string(), old.clone(), new.clone()));
        }));

        assert_eq!(store.poll_external(), 1);
        assert_eq!(
            seen.borrow().as_slice(),
            &[(
                CAPACITY.to_string(),
                FieldValue::Int(500),
                FieldValue::Int(750)
            )]
        );
        assert_eq!(store.get(CAPACITY).unwrap(), FieldValue::Int(750));

        // Already absorbed: a second poll reports nothing
        assert_eq!(store.poll_external(), 0);
    }

    #[test]
    fn test_corrupt_file_on_poll_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut store = open_registered(&path);
        store.set(CAPACITY, FieldValue::Int(500)).unwrap();

        fs::write(&path, "not = [valid").unwrap();
        assert_eq!(store.poll_external(), 0);
        assert_eq!(store.get(CAPACITY).unwrap(), FieldValue::Int(500));
    }

    #[test]
    fn test_corrupt_file_at_open_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "not = [valid").unwrap();
        assert!(matches!(
            SettingStore::open(&path),
            Err(SettingsError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_second_handler_registration_replaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut store = open_registered(&path);

        let first = Rc::new(RefCell::new(0usize));
        let first_in_handler = Rc::clone(&first);
        store.on_external_change(Box::new(move |_, _, _| {
            *first_in_handler.borrow_mut() += 1;
        }));

        let second = Rc::new(RefCell::new(0usize));
        let second_in_handler = Rc::clone(&second);
        store.on_external_change(Box::new(move |_, _, _| {
            *second_in_handler.borrow_mut() += 1;
        }));

        let mut other = open_registered(&path);
        other.set(CAPACITY, FieldValue::Int(100)).unwrap();
        store.poll_external();

        assert_eq!(*first.borrow(), 0);
        assert_eq!(*second.borrow(), 1);
    }
}
