use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::schema::SignalDescriptor;

/// One decoded, scaled sample delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// `host:port` for TCP, the device path for serial links.
    pub source: String,
    pub driver_id: String,
    pub unit_id: u8,
    pub host: String,
    pub port: Option<u16>,
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub priority: i32,
}

/// Endpoint fields shared by every reading a driver produces.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingOrigin {
    pub source: String,
    pub driver_id: String,
    pub unit_id: u8,
    pub host: String,
    pub port: Option<u16>,
}

impl ReadingOrigin {
    pub fn from_connection(connection: &ConnectionConfig) -> Self {
        match connection {
            ConnectionConfig::Tcp(tcp) => Self {
                source: tcp.socket_addr(),
                driver_id: tcp.resolved_driver_id(),
                unit_id: tcp.unit_id,
                host: tcp.host.clone(),
                port: Some(tcp.port),
            },
            ConnectionConfig::Serial(serial) => Self {
                source: serial.port.clone(),
                driver_id: serial.resolved_driver_id(),
                unit_id: serial.unit_id,
                host: serial.port.clone(),
                port: None,
            },
        }
    }

    pub fn reading(&self, signal: &SignalDescriptor, value: f64, timestamp: f64) -> SignalReading {
        SignalReading {
            timestamp,
            source: self.source.clone(),
            driver_id: self.driver_id.clone(),
            unit_id: self.unit_id,
            host: self.host.clone(),
            port: self.port,
            name: signal.name.clone(),
            value,
            unit: signal.unit.clone(),
            priority: signal.priority,
        }
    }
}

/// Current wall-clock time as fractional epoch seconds.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
