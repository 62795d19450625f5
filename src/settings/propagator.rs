//! Bidirectional synchronization between the store and its bound fields
//!
//! Two independent one-way flows with distinct triggers:
//!
//! * Field → Store: an accepted bus write on a setting-backed field runs
//!   that field's on-change closure, which calls `SettingStore::set`.
//!   `set` never fires the external-change handler, so the write cannot
//!   echo back.
//! * Store → Field: an out-of-band edit to the durable file surfaces in
//!   `poll_external`, whose handler resolves the field through the
//!   registry and publishes the new value directly, bypassing the write
//!   path entirely.
//!
//! Wiring both callbacks through one generic "set value" entry point
//! would create an update storm; keeping the two entry points separate is
//! what makes the routing acyclic.

use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

use crate::settings::registry::SettingRegistry;
use crate::settings::store::SettingStore;

/// Install both flows. Each bound field gets its own closure carrying its
/// specific key as data, constructed once per field.
pub fn wire(store: &Rc<RefCell<SettingStore>>, registry: &Rc<SettingRegistry>) {
    for binding in registry.bindings() {
        let key = binding.key.clone();
        let store_for_field = Rc::clone(store);
        binding
            .field
            .borrow_mut()
            .set_on_change(Box::new(move |_old, new| {
                store_for_field.borrow_mut().set(&key, new.clone())
            }));
    }

    let registry_for_handler = Rc::clone(registry);
    store
        .borrow_mut()
        .on_external_change(Box::new(move |key, _old, new| {
            match registry_for_handler.resolve(key) {
                Ok(binding) => binding.field.borrow_mut().publish(new.clone()),
                // Unreachable given registration discipline, but a routing
                // miss must never take the process down
                Err(_) => {
                    warn!(key = %key, value = %new, "dropping change notification for unbound key");
                }
            }
        }));
}

/// Refresh-tick hook: absorb edits other processes made to the settings
/// file and push them into the bound fields.
pub fn tick(store: &Rc<RefCell<SettingStore>>) {
    let changed = store.borrow_mut().poll_external();
    if changed > 0 {
        debug!(changed, "propagated external setting changes");
    }
}
