//! Per-tick assignment of sensor readings onto the exported services
//!
//! Readings are matched by name against each service's current
//! /CustomName, so a sensor renamed in the Pico must be renamed to match
//! on the console side before its data flows again.

use tracing::{info, warn};

use crate::service::{Service, ServiceRegistry};
use crate::snapshot::{Snapshot, SnapshotReader};
use crate::types::FieldValue;

pub const TANKS: [&str; 3] = ["tank-1", "tank-2", "tank-3"];
pub const BATTERY: &str = "battery";

/// Kelvin offset for the thermometer reading
const KELVIN_OFFSET: f64 = 273.15;

fn round_to(v: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (v * factor).round() / factor
}

fn custom_name_matches(service: &Service, name: &str) -> bool {
    matches!(service.value("/CustomName"), Some(FieldValue::Text(n)) if n == name)
}

/// Mark every service disconnected; used when no snapshot is available.
pub fn mark_disconnected(services: &ServiceRegistry) {
    for service in services.iter() {
        service.publish("/Connected", 0i64);
    }
}

/// Apply one snapshot to the services.
pub fn apply_snapshot(services: &ServiceRegistry, snapshot: &Snapshot) {
    for reading in snapshot.values() {
        let Some(name) = reading.name.as_deref() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        if let Some(tank) = TANKS
            .iter()
            .filter_map(|alias| services.get(alias))
            .find(|svc| custom_name_matches(svc, name))
        {
            if let Some(level) = reading.current_level {
                tank.publish("/Level", level * 100.0);
            }
            if let Some(volume) = reading.current_volume {
                tank.publish("/Remaining", volume);
            }
            tank.publish("/Connected", 1i64);
            continue;
        }

        let Some(battery) = services.get(BATTERY) else {
            continue;
        };
        if custom_name_matches(battery, name) {
            if let (Some(voltage), Some(current)) = (reading.voltage, reading.current) {
                battery.publish("/Dc/0/Voltage", round_to(voltage, 2));
                // Discharge current is reported positive; published negative
                battery.publish("/Dc/0/Current", round_to(-current, 2));
                battery.publish("/Dc/0/Power", round_to(-(voltage * current), 1));
            }
            if let Some(remaining) = reading.time_remaining {
                battery.publish("/TimeToGo", (remaining * 6.0) as i64);
            }
            if let Some(soc) = reading.state_of_charge {
                battery.publish("/Soc", soc * 100.0);
            }
            battery.publish("/Connected", 1i64);
        } else if name == "Start Battery" {
            if let Some(voltage) = reading.voltage {
                battery.publish("/Dc/1/Voltage", round_to(voltage, 2));
            }
        } else if name == "TM 1" {
            if let Some(temperature) = reading.temperature {
                battery.publish("/Dc/0/Temperature", round_to(temperature - KELVIN_OFFSET, 1));
            }
        }
    }
}

/// One refresh cycle: read the snapshot and apply it. No snapshot marks
/// every service disconnected; a malformed one skips the cycle, leaving
/// the previous readings in place.
pub fn refresh(services: &ServiceRegistry, reader: &SnapshotReader) {
    match reader.read() {
        Ok(Some(snapshot)) => apply_snapshot(services, &snapshot),
        Ok(None) => {
            info!(path = %reader.path().display(), "no new sensor snapshot");
            mark_disconnected(services);
        }
        Err(e) => warn!(error = %format!("{e:#}"), "skipping refresh cycle"),
    }
}
