//! Application-wide constants
//!
//! Single source of truth for the paths, bus identity strings and timing
//! values used throughout the daemon.

/// Sensor snapshot file constants
pub mod snapshot {
    /// Default location of the JSON snapshot dropped by the Pico udev hook
    pub const DATA_FILE: &str = "/run/udev/data/pico-data.json";
}

/// Durable settings store constants
pub mod store {
    /// Directory under the user config dir holding the settings file
    pub const APP_DIR: &str = "pico-bridge";

    /// Settings file name
    pub const FILENAME: &str = "settings.toml";

    /// Key prefix for tank settings; the numeric setting id follows
    pub const TANK_BASE: &str = "/Settings/Tank/";

    /// Key prefix for battery settings
    pub const BATTERY_BASE: &str = "/Settings/Battery/";
}

/// Bus identity constants
pub mod bus {
    /// Base namespace for published service names
    pub const BASE_NAMESPACE: &str = "com.victronenergy";

    /// Socket path relative to XDG_RUNTIME_DIR (or the cache dir fallback)
    pub const SOCKET_RELPATH: &str = "pico-bridge/bus.sock";
}

/// Refresh driver constants
pub mod refresh {
    /// Seconds between snapshot refreshes; readings move slowly so there
    /// is no need to demand much CPU time
    pub const DEFAULT_INTERVAL_SECS: u64 = 5;
}
