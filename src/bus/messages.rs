//! Bus message types for client ↔ daemon communication

use serde::{Deserialize, Serialize};

use crate::types::FieldValue;

/// Requests sent by bus clients (GUI, logger)
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum BusRequest {
    /// Enumerate published services
    ListServices,

    /// Read one exported field
    GetValue { service: String, path: String },

    /// Write one exported field; subject to the writable flag and, for
    /// setting-backed fields, store validation
    SetValue {
        service: String,
        path: String,
        value: FieldValue,
    },

    /// Health check
    Ping,

    /// Request graceful shutdown
    Shutdown,
}

/// Summary of one published service
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub bus_name: String,
    pub instance: u32,
}

/// Responses sent by the daemon
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum BusResponse {
    /// Published services (response to ListServices)
    Services(Vec<ServiceInfo>),

    /// Current field value (response to GetValue)
    Value(FieldValue),

    /// Acknowledgment that the request was applied
    Ok,

    /// Health check response
    Pong,

    /// Request failed; the targeted field is unchanged
    Error(String),
}
