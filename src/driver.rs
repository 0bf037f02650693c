//! Driver lifecycle shared by every wire protocol.
//!
//! `connect()` and `configure()` only record data. `start_listen()` opens the
//! link and polls on the calling task until `stop()` is observed, so callers
//! usually hold the driver in an `Arc` and spawn the listen call.
//!
//! A stop request stays pending until a listen run ends, so `stop()` issued
//! right after spawning the listen task is not lost even if the task has not
//! been polled yet.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{Instrument, info, info_span, warn};

use crate::ModbusTransportError;
use crate::config::{ConnectionConfig, DriverKind};
use crate::polling::{CycleOutcome, PollingLoop, ReadMode, StopSignal};
use crate::reading::{ReadingOrigin, SignalReading};
use crate::schema::{PollingSchema, SchemaSource};
use crate::transport::{RegisterTransport, RtuTransport, TcpTransport};

/// Consumer of readings. Called on the polling task, once per signal per cycle.
pub type SignalCallback = Arc<dyn Fn(SignalReading) + Send + Sync>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection to {endpoint} lost: {source}")]
    ConnectionLost {
        endpoint: String,
        #[source]
        source: ModbusTransportError,
    },

    #[error("read of '{signal}' failed: {source}")]
    TransientRead {
        signal: String,
        #[source]
        source: ModbusTransportError,
    },

    #[error("signal callback failed: {0}")]
    Callback(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DriverState {
    Created,
    Configured,
    Listening,
    Stopped,
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Id stamped on readings; derived from the endpoint once `connect()` ran.
    fn driver_id(&self) -> String;

    /// Records endpoint data. No I/O.
    fn connect(&self, info: ConnectionConfig) -> Result<(), DriverError>;

    /// Validates and atomically replaces decode options and signals. Bad
    /// signals are dropped, never fatal.
    fn configure(&self, schema: &SchemaSource) -> Result<(), DriverError>;

    /// One poll of every signal over a short-lived connection.
    async fn read(&self) -> Result<Vec<SignalReading>, DriverError>;

    /// Opens the link and polls until stopped. Returns immediately if a loop
    /// is already running on this driver.
    async fn start_listen(&self, callback: SignalCallback) -> Result<(), DriverError>;

    /// Requests the loop to end at the next cycle boundary. Idempotent.
    /// A request made before the loop starts ends it before its first cycle.
    fn stop(&self);

    fn state(&self) -> DriverState;

    fn is_listening(&self) -> bool;

    /// Both endpoint and schema have been recorded.
    fn is_ready(&self) -> bool;
}

#[derive(Default)]
struct Settings {
    connection: Option<ConnectionConfig>,
    schema: Option<Arc<PollingSchema>>,
}

/// State and loop plumbing common to all drivers.
struct DriverCore {
    kind: DriverKind,
    settings: RwLock<Settings>,
    state: RwLock<DriverState>,
    listening: AtomicBool,
    stop: StopSignal,
}

/// Ends a listen run however its future finishes, including when it is
/// dropped mid-cycle: consumes the pending stop request, then clears the
/// listening flag. Only a loop that actually started leaves the driver
/// `Stopped`.
struct ListenGuard<'a> {
    core: &'a DriverCore,
    entered: bool,
}

impl Drop for ListenGuard<'_> {
    fn drop(&mut self) {
        if self.entered {
            *self.core.state.write() = DriverState::Stopped;
        }
        self.core.stop.reset();
        self.core.listening.store(false, Ordering::SeqCst);
    }
}

impl DriverCore {
    fn new(kind: DriverKind) -> Self {
        Self {
            kind,
            settings: RwLock::new(Settings::default()),
            state: RwLock::new(DriverState::Created),
            listening: AtomicBool::new(false),
            stop: StopSignal::default(),
        }
    }

    fn driver_id(&self) -> String {
        match &self.settings.read().connection {
            Some(connection) => connection.resolved_driver_id(),
            None => format!("{}_unknown", self.kind),
        }
    }

    fn connect(&self, info: ConnectionConfig) -> Result<(), DriverError> {
        if info.kind() != self.kind {
            return Err(DriverError::Configuration(format!(
                "{} driver cannot use a {} connection",
                self.kind,
                info.kind()
            )));
        }
        if self.listening.load(Ordering::SeqCst) {
            return Err(DriverError::Configuration(
                "connection cannot change while listening".to_string(),
            ));
        }
        info.validate().map_err(DriverError::Configuration)?;

        info!(
            kind = %self.kind,
            driver_id = %info.resolved_driver_id(),
            endpoint = %ReadingOrigin::from_connection(&info).source,
            "connection recorded"
        );
        self.settings.write().connection = Some(info);
        Ok(())
    }

    fn configure(&self, source: &SchemaSource) -> Result<(), DriverError> {
        let schema = PollingSchema::from_source(source);
        info!(
            driver_id = %self.driver_id(),
            word_order = %schema.word_order,
            byte_order = %schema.byte_order,
            address_limit = ?schema.address_limit,
            signals = schema.signals.len(),
            dropped = source.signals.len() - schema.signals.len(),
            "schema configured"
        );
        self.settings.write().schema = Some(Arc::new(schema));

        let mut state = self.state.write();
        if matches!(*state, DriverState::Created | DriverState::Stopped) {
            *state = DriverState::Configured;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        let settings = self.settings.read();
        settings.connection.is_some() && settings.schema.is_some()
    }

    fn current_schema(&self) -> Arc<PollingSchema> {
        self.settings.read().schema.clone().unwrap_or_default()
    }

    fn snapshot(&self) -> Result<(ConnectionConfig, Arc<PollingSchema>), DriverError> {
        let settings = self.settings.read();
        let connection = settings
            .connection
            .clone()
            .ok_or_else(|| DriverError::Configuration("connect() has not been called".to_string()))?;
        let schema = settings
            .schema
            .clone()
            .ok_or_else(|| DriverError::Configuration("configure() has not been called".to_string()))?;
        Ok((connection, schema))
    }

    fn polling_loop(&self, connection: &ConnectionConfig) -> PollingLoop {
        let mode = match connection {
            ConnectionConfig::Tcp(_) => ReadMode::PerSignal,
            ConnectionConfig::Serial(serial) => ReadMode::Block {
                start: serial.read_start_address,
            },
        };
        PollingLoop::new(
            ReadingOrigin::from_connection(connection),
            connection.options().clone(),
            mode,
        )
    }

    async fn open_transport(
        connection: &ConnectionConfig,
    ) -> Result<Box<dyn RegisterTransport>, DriverError> {
        let opened: Result<Box<dyn RegisterTransport>, ModbusTransportError> = match connection {
            ConnectionConfig::Tcp(tcp) => TcpTransport::connect(tcp)
                .await
                .map(|t| Box::new(t) as Box<dyn RegisterTransport>),
            ConnectionConfig::Serial(serial) => RtuTransport::open(serial)
                .await
                .map(|t| Box::new(t) as Box<dyn RegisterTransport>),
        };
        opened.map_err(|source| DriverError::ConnectionLost {
            endpoint: ReadingOrigin::from_connection(connection).source,
            source,
        })
    }

    async fn read_once(&self) -> Result<Vec<SignalReading>, DriverError> {
        let (connection, schema) = self.snapshot()?;
        let polling = self.polling_loop(&connection);
        let mut transport = Self::open_transport(&connection).await?;

        let mut readings = Vec::with_capacity(schema.signals.len());
        let outcome = polling
            .poll_cycle(transport.as_mut(), &schema, |reading| readings.push(reading))
            .await;
        transport.close().await;

        match outcome {
            CycleOutcome::Completed { .. } => Ok(readings),
            CycleOutcome::ConnectionLost(source) => Err(DriverError::ConnectionLost {
                endpoint: polling.origin().source.clone(),
                source,
            }),
        }
    }

    async fn start_listen(&self, callback: SignalCallback) -> Result<(), DriverError> {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(driver_id = %self.driver_id(), "already listening");
            return Ok(());
        }
        let mut guard = ListenGuard {
            core: self,
            entered: false,
        };

        let (connection, _) = self.snapshot()?;
        if self.stop.is_requested() {
            info!(driver_id = %self.driver_id(), "stop already requested, not listening");
            return Ok(());
        }
        let polling = self.polling_loop(&connection);
        let span = info_span!("listen", driver_id = %polling.origin().driver_id);

        async move {
            let mut transport = match Self::open_transport(&connection).await {
                Ok(transport) => transport,
                Err(err) => {
                    warn!(error = %err, "connect failed, not listening");
                    return Err(err);
                }
            };
            guard.entered = true;
            *self.state.write() = DriverState::Listening;
            info!(
                endpoint = %transport.endpoint(),
                signals = self.current_schema().signals.len(),
                "listening"
            );

            let result = polling
                .run(transport.as_mut(), || self.current_schema(), &callback, &self.stop)
                .await;
            transport.close().await;

            match result {
                Ok(cycles) => info!(cycles, "stopped"),
                Err(source) => {
                    let err = DriverError::ConnectionLost {
                        endpoint: polling.origin().source.clone(),
                        source,
                    };
                    warn!(error = %err, "polling ended");
                }
            }
            drop(guard);
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn stop(&self) {
        if self.listening.load(Ordering::SeqCst) {
            info!(driver_id = %self.driver_id(), "stop requested");
        }
        self.stop.request();
    }
}

macro_rules! delegate_driver {
    ($driver:ident) => {
        #[async_trait]
        impl Driver for $driver {
            fn kind(&self) -> DriverKind {
                self.core.kind
            }

            fn driver_id(&self) -> String {
                self.core.driver_id()
            }

            fn connect(&self, info: ConnectionConfig) -> Result<(), DriverError> {
                self.core.connect(info)
            }

            fn configure(&self, schema: &SchemaSource) -> Result<(), DriverError> {
                self.core.configure(schema)
            }

            async fn read(&self) -> Result<Vec<SignalReading>, DriverError> {
                self.core.read_once().await
            }

            async fn start_listen(&self, callback: SignalCallback) -> Result<(), DriverError> {
                self.core.start_listen(callback).await
            }

            fn stop(&self) {
                self.core.stop()
            }

            fn state(&self) -> DriverState {
                *self.core.state.read()
            }

            fn is_listening(&self) -> bool {
                self.core.listening.load(Ordering::SeqCst)
            }

            fn is_ready(&self) -> bool {
                self.core.is_ready()
            }
        }
    };
}

/// Modbus TCP: one exact-length read per signal, holding bank first.
pub struct ModbusTcpDriver {
    core: DriverCore,
}

impl ModbusTcpDriver {
    pub fn new() -> Self {
        Self {
            core: DriverCore::new(DriverKind::ModbusTcp),
        }
    }
}

impl Default for ModbusTcpDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Modbus RTU: one block read over the signal span per cycle.
pub struct ModbusRtuDriver {
    core: DriverCore,
}

impl ModbusRtuDriver {
    pub fn new() -> Self {
        Self {
            core: DriverCore::new(DriverKind::ModbusRtu),
        }
    }
}

impl Default for ModbusRtuDriver {
    fn default() -> Self {
        Self::new()
    }
}

delegate_driver!(ModbusTcpDriver);
delegate_driver!(ModbusRtuDriver);

/// Builds the driver implementation for `kind`.
pub fn create_driver(kind: DriverKind) -> Box<dyn Driver> {
    match kind {
        DriverKind::ModbusTcp => Box::new(ModbusTcpDriver::new()),
        DriverKind::ModbusRtu => Box::new(ModbusRtuDriver::new()),
    }
}

/// Builds the matching driver and records `connection` on it.
pub fn create_connected_driver(connection: ConnectionConfig) -> Result<Box<dyn Driver>, DriverError> {
    let driver = create_driver(connection.kind());
    driver.connect(connection)?;
    Ok(driver)
}
