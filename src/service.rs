//! Exported fields and the services that group them
//!
//! A `Service` is one logical device (a tank sensor, the battery monitor)
//! publishing a set of named value slots on the bus. Fields that must
//! survive a restart carry `SettingSpec` metadata and get bound into the
//! `SettingRegistry` at startup.

use anyhow::{Result, anyhow};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::warn;

use crate::constants;
use crate::error::SettingsResult;
use crate::settings::SettingRegistry;
use crate::types::{FieldValue, SettingSpec};

pub type FieldRef = Rc<RefCell<ExportedField>>;

/// Write-path callback, invoked with `(old, new)` before the value is
/// applied. An `Err` rejects the write and leaves the field unchanged.
pub type OnChange = Box<dyn FnMut(&FieldValue, &FieldValue) -> SettingsResult<()>>;

/// A named, externally visible value slot.
pub struct ExportedField {
    pub path: String,
    value: FieldValue,
    pub writable: bool,
    pub setting: Option<SettingSpec>,
    on_change: Option<OnChange>,
}

impl ExportedField {
    pub fn new(path: &str, initial: impl Into<FieldValue>, writable: bool) -> FieldRef {
        Rc::new(RefCell::new(Self {
            path: path.to_string(),
            value: initial.into(),
            writable,
            setting: None,
            on_change: None,
        }))
    }

    /// A writable field backed by a persisted setting; starts at the
    /// setting's default until the registry applies the durable value.
    pub fn with_setting(path: &str, spec: SettingSpec) -> FieldRef {
        Rc::new(RefCell::new(Self {
            path: path.to_string(),
            value: spec.default.clone(),
            writable: true,
            setting: Some(spec),
            on_change: None,
        }))
    }

    pub fn value(&self) -> FieldValue {
        self.value.clone()
    }

    /// Direct assignment, bypassing the write path. Used by the refresh
    /// mapping and by the store→field propagation flow.
    pub fn publish(&mut self, value: impl Into<FieldValue>) {
        self.value = value.into();
    }

    /// External write path. The on-change callback runs before the value
    /// is applied; a rejection propagates and the field keeps its old
    /// value.
    pub fn write(&mut self, new: FieldValue) -> SettingsResult<()> {
        if !self.writable {
            return Err(anyhow!("field {} is not writable", self.path).into());
        }
        let old = self.value.clone();
        if let Some(cb) = self.on_change.as_mut() {
            cb(&old, &new)?;
        }
        self.value = new;
        Ok(())
    }

    pub fn set_on_change(&mut self, cb: OnChange) {
        self.on_change = Some(cb);
    }
}

/// One logical device and its exported fields.
pub struct Service {
    /// Short in-process alias, e.g. "tank-1"
    pub name: String,
    /// Published bus identity, e.g. "com.victronenergy.tank.pico-1_id01"
    pub bus_name: String,
    pub instance: u32,
    fields: HashMap<String, FieldRef>,
}

impl Service {
    pub fn new(name: &str, device_type: &str, physical: &str, id: u32, instance: u32) -> Self {
        let bus_name = format!(
            "{}.{}.{}_id{:02}",
            constants::bus::BASE_NAMESPACE,
            device_type,
            physical,
            id
        );
        let mut svc = Self {
            name: name.to_string(),
            bus_name,
            instance,
            fields: HashMap::new(),
        };

        // Management and mandatory objects every device publishes
        svc.add_field("/Mgmt/ProcessName", env!("CARGO_PKG_NAME"), false);
        svc.add_field("/Mgmt/ProcessVersion", env!("CARGO_PKG_VERSION"), false);
        svc.add_field("/Mgmt/Connection", physical, false);
        svc.add_field("/DeviceInstance", instance as i64, false);
        svc.add_field("/ProductId", 0i64, false);
        svc.add_field("/ProductName", "", false);
        svc.add_field("/FirmwareVersion", 0i64, false);
        svc.add_field("/HardwareVersion", 0i64, false);
        // Devices stay marked disconnected until a snapshot confirms them
        svc.add_field("/Connected", 0i64, false);
        svc.add_field("/Status", 0i64, false);
        svc
    }

    pub fn add_field(
        &mut self,
        path: &str,
        initial: impl Into<FieldValue>,
        writable: bool,
    ) -> FieldRef {
        let field = ExportedField::new(path, initial, writable);
        self.fields.insert(path.to_string(), Rc::clone(&field));
        field
    }

    pub fn add_setting_field(&mut self, path: &str, spec: SettingSpec) -> FieldRef {
        let field = ExportedField::with_setting(path, spec);
        self.fields.insert(path.to_string(), Rc::clone(&field));
        field
    }

    pub fn field(&self, path: &str) -> Option<FieldRef> {
        self.fields.get(path).cloned()
    }

    pub fn value(&self, path: &str) -> Option<FieldValue> {
        self.fields.get(path).map(|f| f.borrow().value())
    }

    /// Publish onto a field by path; a miss is a wiring bug worth logging
    /// but never worth crashing the refresh cycle.
    pub fn publish(&self, path: &str, value: impl Into<FieldValue>) {
        match self.fields.get(path) {
            Some(field) => field.borrow_mut().publish(value),
            None => warn!(service = %self.name, path = %path, "publish to unknown field"),
        }
    }
}

/// All services in the process, keyed by alias. Instance ids must be
/// unique across services.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Service>,
    instances: HashSet<u32>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: Service) -> Result<()> {
        if !self.instances.insert(service.instance) {
            return Err(anyhow!(
                "duplicate device instance {} for service {}",
                service.instance,
                service.name
            ));
        }
        if self.services.contains_key(&service.name) {
            return Err(anyhow!("duplicate service name {}", service.name));
        }
        self.services.insert(service.name.clone(), service);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }
}

/// Persisted-setting defaults per tank field path, as the console expects
/// them: everything starts at zero except the bounded capacity.
fn tank_setting_spec(path: &str) -> Option<SettingSpec> {
    match path {
        "/FluidType" | "/Alarms/Low/Active" | "/Alarms/Low/Enable" | "/Alarms/Low/Restore"
        | "/Alarms/Low/Delay" => Some(SettingSpec::new(0i64)),
        "/CustomName" => Some(SettingSpec::new("")),
        "/Capacity" => Some(SettingSpec::bounded(0i64, 0.0, 1000.0)),
        _ => None,
    }
}

fn new_tank_service(
    id: u32,
    instance: u32,
    setting_id: u32,
    settings: &mut SettingRegistry,
) -> Result<Service> {
    let physical = format!("pico-{id}");
    let mut svc = Service::new(&format!("tank-{id}"), "tank", &physical, id, instance);
    svc.publish("/ProductName", "Simarine Pico Tank sensor");

    let base = format!("{}{}", constants::store::TANK_BASE, setting_id);
    for path in [
        "/FluidType",
        "/CustomName",
        "/Alarms/Low/Active",
        "/Alarms/Low/Enable",
        "/Alarms/Low/Restore",
        "/Alarms/Low/Delay",
        "/Capacity",
    ] {
        let spec = tank_setting_spec(path)
            .ok_or_else(|| anyhow!("no setting default for tank path {path}"))?;
        let field = svc.add_setting_field(path, spec);
        settings.bind(&format!("{base}{path}"), &field)?;
    }

    svc.add_field("/Level", 0i64, true);
    svc.add_field("/Remaining", 0i64, true);
    svc.add_field("/Alarms/Low/State", 0i64, false);
    Ok(svc)
}

fn new_battery_service(
    id: u32,
    instance: u32,
    setting_id: u32,
    settings: &mut SettingRegistry,
) -> Result<Service> {
    let physical = format!("pico-{id}");
    let mut svc = Service::new("battery", "battery", &physical, id, instance);
    svc.publish("/ProductName", "BMV-700");

    let base = format!("{}{}", constants::store::BATTERY_BASE, setting_id);
    let custom_name = svc.add_setting_field("/CustomName", SettingSpec::new(""));
    settings.bind(&format!("{base}/CustomName"), &custom_name)?;

    svc.add_field("/Soc", 0i64, true);
    svc.add_field("/TimeToGo", 0i64, true);
    svc.add_field("/Dc/0/Voltage", 0i64, true);
    svc.add_field("/Dc/1/Voltage", 0i64, true);
    svc.add_field("/Dc/0/Current", 0i64, true);
    svc.add_field("/Dc/0/Power", 0i64, true);
    svc.add_field("/Dc/0/Temperature", 0i64, true);
    svc.add_field("/History/DischargedEnergy", 0i64, false);
    svc.add_field("/History/ChargedEnergy", 0i64, false);
    Ok(svc)
}

/// Build the fixed device table: three tank sensors and the battery
/// monitor, with their persisted settings bound into the registry.
pub fn build_devices(
    services: &mut ServiceRegistry,
    settings: &mut SettingRegistry,
) -> Result<()> {
    services.insert(new_tank_service(1, 30, 1, settings)?)?;
    services.insert(new_tank_service(2, 31, 2, settings)?)?;
    services.insert(new_tank_service(3, 32, 3, settings)?)?;
    services.insert(new_battery_service(4, 33, 4, settings)?)?;
    Ok(())
}
