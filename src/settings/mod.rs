//! Persistent settings
//!
//! Three pieces: the durable key/value **store** (TOML file, atomic
//! writes), the **registry** mapping each setting key to the exported
//! field it drives, and the **propagator** keeping both sides consistent
//! without update loops.

pub mod propagator;
pub mod registry;
pub mod store;

pub use registry::{Binding, SettingRegistry};
pub use store::SettingStore;
