use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing policy for one driver. Every field has a default, so an empty
/// mapping is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingOptions {
    /// Sleep between two polling cycles.
    pub poll_interval_ms: u64,
    /// Pause before the single retry round.
    pub retry_backoff_ms: u64,
    /// Whether a failed read gets one more round (primary, then fallback bank).
    pub retry: bool,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            retry_backoff_ms: 10,
            retry: true,
            connect_timeout_ms: 3000,
            read_timeout_ms: 1000,
        }
    }
}

impl PollingOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err("timeouts must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Modbus TCP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConnection {
    pub host: String,
    #[serde(default = "TcpConnection::default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id", alias = "slave_id")]
    pub unit_id: u8,
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub options: PollingOptions,
}

impl TcpConnection {
    fn default_port() -> u16 {
        502
    }

    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            driver_id: None,
            options: PollingOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PollingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Stable id: the explicit one, else `modbus_tcp_<port>`.
    pub fn resolved_driver_id(&self) -> String {
        self.driver_id
            .clone()
            .unwrap_or_else(|| format!("modbus_tcp_{}", self.port))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(alias = "N", alias = "none")]
    None,
    #[serde(alias = "E", alias = "even")]
    Even,
    #[serde(alias = "O", alias = "odd")]
    Odd,
}

/// Modbus RTU endpoint on a serial device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConnection {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    #[serde(default = "SerialConnection::default_baud", alias = "baudrate")]
    pub baud: u32,
    #[serde(default = "default_unit_id", alias = "slave_id")]
    pub unit_id: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "SerialConnection::default_stop_bits", alias = "stopbits")]
    pub stop_bits: u8,
    #[serde(default = "SerialConnection::default_data_bits", alias = "bytesize")]
    pub data_bits: u8,
    /// First register of the block read; defaults to the lowest signal address.
    #[serde(default)]
    pub read_start_address: Option<u16>,
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub options: PollingOptions,
}

impl SerialConnection {
    fn default_baud() -> u32 {
        9600
    }

    fn default_stop_bits() -> u8 {
        1
    }

    fn default_data_bits() -> u8 {
        8
    }

    pub fn new(port: impl Into<String>, baud: u32, unit_id: u8) -> Self {
        Self {
            port: port.into(),
            baud,
            unit_id,
            parity: Parity::None,
            stop_bits: 1,
            data_bits: 8,
            read_start_address: None,
            driver_id: None,
            options: PollingOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PollingOptions) -> Self {
        self.options = options;
        self
    }

    /// Stable id: the explicit one, else `modbus_rtu_<device name>`.
    pub fn resolved_driver_id(&self) -> String {
        if let Some(id) = &self.driver_id {
            return id.clone();
        }
        let device = self
            .port
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.port.as_str());
        format!("modbus_rtu_{device}")
    }
}

fn default_unit_id() -> u8 {
    1
}

/// Endpoint data handed to `connect()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectionConfig {
    #[serde(rename = "modbus_tcp")]
    Tcp(TcpConnection),
    #[serde(rename = "modbus_rtu")]
    Serial(SerialConnection),
}

impl ConnectionConfig {
    pub fn kind(&self) -> DriverKind {
        match self {
            ConnectionConfig::Tcp(_) => DriverKind::ModbusTcp,
            ConnectionConfig::Serial(_) => DriverKind::ModbusRtu,
        }
    }

    pub fn options(&self) -> &PollingOptions {
        match self {
            ConnectionConfig::Tcp(tcp) => &tcp.options,
            ConnectionConfig::Serial(serial) => &serial.options,
        }
    }

    pub fn resolved_driver_id(&self) -> String {
        match self {
            ConnectionConfig::Tcp(tcp) => tcp.resolved_driver_id(),
            ConnectionConfig::Serial(serial) => serial.resolved_driver_id(),
        }
    }

    /// Field-level checks that do not need any I/O.
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            ConnectionConfig::Tcp(tcp) => {
                if tcp.host.trim().is_empty() {
                    return Err("host is empty".to_string());
                }
                if tcp.port == 0 {
                    return Err("port must be in 1..=65535".to_string());
                }
            }
            ConnectionConfig::Serial(serial) => {
                if serial.port.trim().is_empty() {
                    return Err("serial port is empty".to_string());
                }
                if serial.baud == 0 {
                    return Err("baud rate must be greater than zero".to_string());
                }
                if !matches!(serial.stop_bits, 1 | 2) {
                    return Err(format!("unsupported stop bits: {}", serial.stop_bits));
                }
                if !(5..=8).contains(&serial.data_bits) {
                    return Err(format!("unsupported data bits: {}", serial.data_bits));
                }
                if serial.unit_id == 0 || serial.unit_id > 247 {
                    return Err(format!("serial unit id {} outside 1..=247", serial.unit_id));
                }
            }
        }
        self.options().validate()
    }
}

/// Closed set of driver implementations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    ModbusTcp,
    ModbusRtu,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::ModbusTcp => "modbus_tcp",
            DriverKind::ModbusRtu => "modbus_rtu",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modbus_tcp" | "modbustcp" | "tcp" => Ok(DriverKind::ModbusTcp),
            "modbus_rtu" | "modbusrtu" | "rtu" => Ok(DriverKind::ModbusRtu),
            other => Err(format!("unknown driver type '{other}'")),
        }
    }
}
