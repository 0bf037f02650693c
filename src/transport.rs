//! Owned register-read channels.
//!
//! A transport wraps exactly one live connection and the framing for it. The
//! polling loop is the only caller, so every method takes `&mut self`; there is
//! no internal locking.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, DataBits, SerialPort, SerialStream, StopBits};
use tracing::{debug, info};

use crate::config::{Parity, SerialConnection, TcpConnection};
use crate::{
    MBAP_HEADER_LEN, ModbusRTU, ModbusTCP, ModbusTransportError, ModbusUnit, RTU_RESPONSE_HEAD_LEN,
};

#[async_trait]
pub trait RegisterTransport: Send {
    /// Sends one read request and waits for its response.
    async fn read_registers(&mut self, unit: &ModbusUnit) -> Result<Vec<u16>, ModbusTransportError>;

    /// Releases the connection. Safe to call more than once.
    async fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Human-readable endpoint for log lines.
    fn endpoint(&self) -> &str;
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, ModbusTransportError>
where
    F: Future<Output = Result<T, ModbusTransportError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ModbusTransportError::Timeout(limit)),
    }
}

// =============================================================================
// TCP
// =============================================================================

pub struct TcpTransport {
    stream: Option<TcpStream>,
    framer: ModbusTCP,
    connect_timeout: Duration,
    read_timeout: Duration,
    endpoint: String,
    /// Set after a timed-out exchange: part of a late frame may still be in
    /// flight, so the stream can no longer be trusted to start on a header.
    desynced: bool,
}

impl TcpTransport {
    pub async fn connect(connection: &TcpConnection) -> Result<Self, ModbusTransportError> {
        let endpoint = connection.socket_addr();
        let options = &connection.options;
        let stream = Self::open_stream(&endpoint, options.connect_timeout()).await?;

        let framer = ModbusTCP::builder().device_id(connection.unit_id).build()?;
        info!(%endpoint, unit_id = connection.unit_id, "modbus tcp connected");

        Ok(Self {
            stream: Some(stream),
            framer,
            connect_timeout: options.connect_timeout(),
            read_timeout: options.read_timeout(),
            endpoint,
            desynced: false,
        })
    }

    async fn open_stream(endpoint: &str, limit: Duration) -> Result<TcpStream, ModbusTransportError> {
        let stream = bounded(limit, async {
            TcpStream::connect(endpoint)
                .await
                .map_err(ModbusTransportError::from)
        })
        .await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Replaces the stream after a timeout. On failure the transport stays
    /// desynced and the next read tries again.
    async fn resync(&mut self) -> Result<(), ModbusTransportError> {
        if let Some(mut stale) = self.stream.take() {
            let _ = stale.shutdown().await;
        }
        let stream = Self::open_stream(&self.endpoint, self.connect_timeout).await?;
        info!(endpoint = %self.endpoint, "modbus tcp reconnected after timeout");
        self.stream = Some(stream);
        self.desynced = false;
        Ok(())
    }

    /// Drops bytes left over from an exchange that timed out.
    fn discard_pending(stream: &TcpStream) {
        let mut scratch = [0u8; 256];
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => debug!(bytes = n, "discarding stale bytes"),
                Err(_) => break,
            }
        }
    }

    async fn exchange(
        stream: &mut TcpStream,
        framer: &mut ModbusTCP,
        unit: &ModbusUnit,
    ) -> Result<Vec<u16>, ModbusTransportError> {
        let request = framer.create_read_request(unit);
        stream.write_all(&request).await?;

        loop {
            let mut frame = vec![0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut frame).await?;
            let remaining = ModbusTCP::remaining_length(&frame)?;
            frame.resize(MBAP_HEADER_LEN + remaining, 0);
            stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;

            // a late answer to an earlier, timed-out request
            if ModbusTCP::response_transaction_id(&frame) != Some(framer.transaction_id()) {
                debug!(
                    expected = framer.transaction_id(),
                    received = ?ModbusTCP::response_transaction_id(&frame),
                    "skipping response for another transaction"
                );
                continue;
            }
            return framer.parse_response(unit, &frame);
        }
    }
}

#[async_trait]
impl RegisterTransport for TcpTransport {
    async fn read_registers(&mut self, unit: &ModbusUnit) -> Result<Vec<u16>, ModbusTransportError> {
        if self.desynced {
            self.resync().await?;
        }
        let stream = self.stream.as_mut().ok_or(ModbusTransportError::NotConnected)?;
        Self::discard_pending(stream);

        let result = bounded(
            self.read_timeout,
            Self::exchange(stream, &mut self.framer, unit),
        )
        .await;

        match &result {
            Err(ModbusTransportError::Timeout(_)) => {
                debug!(endpoint = %self.endpoint, "exchange timed out, reconnecting before next read");
                self.desynced = true;
            }
            Err(err) if err.is_connection_lost() => {
                debug!(endpoint = %self.endpoint, error = %err, "tcp link dropped");
                self.stream = None;
            }
            _ => {}
        }
        result
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!(endpoint = %self.endpoint, "modbus tcp connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// =============================================================================
// RTU
// =============================================================================

pub struct RtuTransport {
    port: Option<SerialStream>,
    framer: ModbusRTU,
    read_timeout: Duration,
    endpoint: String,
}

fn map_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn map_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn map_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

impl RtuTransport {
    pub async fn open(connection: &SerialConnection) -> Result<Self, ModbusTransportError> {
        let options = &connection.options;
        let builder = tokio_serial::new(connection.port.as_str(), connection.baud)
            .parity(map_parity(connection.parity))
            .data_bits(map_data_bits(connection.data_bits))
            .stop_bits(map_stop_bits(connection.stop_bits))
            .timeout(options.read_timeout());

        // opening the device blocks, keep it off the runtime threads
        let port = bounded(options.connect_timeout(), async move {
            match tokio::task::spawn_blocking(move || SerialStream::open(&builder)).await {
                Ok(opened) => opened.map_err(ModbusTransportError::from),
                Err(join) => Err(ModbusTransportError::Io(std::io::Error::other(join))),
            }
        })
        .await?;

        let framer = ModbusRTU::builder().device_id(connection.unit_id).build()?;
        info!(
            port = %connection.port,
            baud = connection.baud,
            unit_id = connection.unit_id,
            "modbus rtu port opened"
        );

        Ok(Self {
            port: Some(port),
            framer,
            read_timeout: options.read_timeout(),
            endpoint: connection.port.clone(),
        })
    }

    async fn exchange(
        port: &mut SerialStream,
        framer: &ModbusRTU,
        unit: &ModbusUnit,
    ) -> Result<Vec<u16>, ModbusTransportError> {
        let request = framer.create_read_request(unit);
        port.write_all(&request).await?;

        let mut frame = vec![0u8; RTU_RESPONSE_HEAD_LEN];
        port.read_exact(&mut frame).await?;
        let total = ModbusRTU::expected_response_len(&frame)?;
        frame.resize(total, 0);
        port.read_exact(&mut frame[RTU_RESPONSE_HEAD_LEN..]).await?;

        framer.parse_response(unit, &frame)
    }
}

#[async_trait]
impl RegisterTransport for RtuTransport {
    async fn read_registers(&mut self, unit: &ModbusUnit) -> Result<Vec<u16>, ModbusTransportError> {
        let port = self.port.as_mut().ok_or(ModbusTransportError::NotConnected)?;
        if let Err(err) = port.clear(ClearBuffer::Input) {
            debug!(endpoint = %self.endpoint, error = %err, "could not flush serial input");
        }

        let result = bounded(self.read_timeout, Self::exchange(port, &self.framer, unit)).await;

        if let Err(err) = &result {
            if err.is_connection_lost() {
                debug!(endpoint = %self.endpoint, error = %err, "serial link dropped");
                self.port = None;
            }
        }
        result
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            info!(endpoint = %self.endpoint, "modbus rtu port closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
