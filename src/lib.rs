// lib.rs

mod modbus_rtu;
mod modbus_tcp;
mod pdu;

pub mod config;
pub mod decoder;
pub mod driver;
pub mod polling;
pub mod reading;
pub mod schema;
pub mod transport;

pub use modbus_rtu::{ModbusRTU, ModbusRTUBuilder, RTU_RESPONSE_HEAD_LEN};
pub use modbus_tcp::{MBAP_HEADER_LEN, ModbusTCP, ModbusTCPBuilder};
pub use pdu::{MAX_READ_REGISTERS, ModbusUnit, ModbusUnitBuilder, ModbusUnitError, RegisterType};

pub use config::{
    ConnectionConfig, DriverKind, Parity, PollingOptions, SerialConnection, TcpConnection,
};
pub use decoder::{Endian, RegisterDecoder};
pub use driver::{
    Driver, DriverError, DriverState, ModbusRtuDriver, ModbusTcpDriver, SignalCallback,
    create_connected_driver, create_driver,
};
pub use polling::{CycleOutcome, PollingLoop, ReadMode, StopSignal};
pub use reading::{ReadingOrigin, SignalReading};
pub use schema::{PollingSchema, SchemaSource, SignalDescriptor, SignalSpec};
pub use transport::{RegisterTransport, RtuTransport, TcpTransport};

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ModbusTransportError {
    #[error("Frame too short")]
    FrameTooShort,

    #[error("Invalid protocol ID: {0}")]
    InvalidProtocolId(u16),

    #[error("Unit ID mismatch: expected {expected}, received {received}")]
    UnitIdMismatch { expected: u8, received: u8 },

    #[error("Transaction ID mismatch: expected {expected}, received {received}")]
    TransactionIdMismatch { expected: u16, received: u16 },

    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("Device ID not set")]
    DeviceIdMissing,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ModbusUnitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport is not connected")]
    NotConnected,
}

impl ModbusTransportError {
    /// True when the link itself is gone, as opposed to one bad exchange.
    pub fn is_connection_lost(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            ModbusTransportError::NotConnected => true,
            ModbusTransportError::Io(err) => matches!(
                err.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
