//! Cycle scheduling: guard, read with bank fallback, decode, scale, emit.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::PollingOptions;
use crate::driver::{DriverError, SignalCallback};
use crate::reading::{ReadingOrigin, SignalReading, epoch_seconds};
use crate::schema::{PollingSchema, SignalDescriptor};
use crate::transport::RegisterTransport;
use crate::{MAX_READ_REGISTERS, ModbusTransportError, ModbusUnit, RegisterType};

/// How registers are fetched each cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// One exact-length request per signal.
    PerSignal,
    /// One wide request over the whole signal span, starting at `start` or at
    /// the lowest signal address.
    Block { start: Option<u16> },
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed { emitted: usize, skipped: usize },
    /// The link went away mid-cycle; the remaining signals were not attempted.
    ConnectionLost(ModbusTransportError),
}

/// Stop request shared between the polling task and `stop()` callers.
///
/// The flag is level-triggered, so a request made while a cycle is running is
/// still seen at the next boundary, and an inter-cycle sleep wakes up early.
pub struct StopSignal {
    requested: watch::Sender<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self {
            requested: watch::channel(false).0,
        }
    }
}

impl StopSignal {
    pub fn request(&self) {
        self.requested.send_replace(true);
    }

    pub fn reset(&self) {
        self.requested.send_replace(false);
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Sleeps for `period`, returning early if a stop is requested.
    pub async fn sleep(&self, period: std::time::Duration) {
        let mut rx = self.requested.subscribe();
        let stopped = async move {
            loop {
                let stop = *rx.borrow_and_update();
                if stop || rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = sleep(period) => {}
            _ = stopped => {}
        }
    }
}

/// Hands one reading to the consumer. A panicking consumer is logged and
/// otherwise ignored.
pub fn deliver(callback: &SignalCallback, reading: SignalReading) {
    let name = reading.name.clone();
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (**callback)(reading))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(signal = %name, error = %DriverError::Callback(message), "signal consumer failed");
    }
}

pub struct PollingLoop {
    origin: ReadingOrigin,
    options: PollingOptions,
    mode: ReadMode,
    primary: RegisterType,
}

impl PollingLoop {
    pub fn new(origin: ReadingOrigin, options: PollingOptions, mode: ReadMode) -> Self {
        Self {
            origin,
            options,
            mode,
            primary: RegisterType::HoldingRegister,
        }
    }

    pub fn origin(&self) -> &ReadingOrigin {
        &self.origin
    }

    async fn read_bank<T>(
        transport: &mut T,
        bank: RegisterType,
        address: u16,
        length: u16,
    ) -> Result<Vec<u16>, ModbusTransportError>
    where
        T: RegisterTransport + ?Sized,
    {
        let unit = ModbusUnit::read(bank, address, length)?;
        let words = transport.read_registers(&unit).await?;
        if words.len() < length as usize {
            return Err(ModbusTransportError::FrameTooShort);
        }
        Ok(words)
    }

    /// Primary bank, then the alternate bank for the same range.
    async fn read_round<T>(
        &self,
        transport: &mut T,
        address: u16,
        length: u16,
    ) -> Result<Vec<u16>, ModbusTransportError>
    where
        T: RegisterTransport + ?Sized,
    {
        let first = match Self::read_bank(transport, self.primary, address, length).await {
            Ok(words) => return Ok(words),
            Err(err) => err,
        };
        if first.is_connection_lost() {
            return Err(first);
        }
        debug!(
            driver_id = %self.origin.driver_id,
            address,
            length,
            bank = ?self.primary,
            error = %first,
            "primary bank read failed, trying fallback"
        );
        Self::read_bank(transport, self.primary.alternate(), address, length).await
    }

    /// Reads `[address, address + length)` with bank fallback and at most one
    /// retry round.
    pub async fn read_with_fallback<T>(
        &self,
        transport: &mut T,
        address: u16,
        length: u16,
    ) -> Result<Vec<u16>, ModbusTransportError>
    where
        T: RegisterTransport + ?Sized,
    {
        match self.read_round(transport, address, length).await {
            Ok(words) => Ok(words),
            Err(err) if err.is_connection_lost() || !self.options.retry => Err(err),
            Err(err) => {
                debug!(
                    driver_id = %self.origin.driver_id,
                    address,
                    length,
                    error = %err,
                    "read failed, retrying once"
                );
                sleep(self.options.retry_backoff()).await;
                self.read_round(transport, address, length).await
            }
        }
    }

    fn log_out_of_range(&self, signal: &SignalDescriptor, limit: Option<u16>) {
        debug!(
            driver_id = %self.origin.driver_id,
            signal = %signal.name,
            address = signal.address,
            last = signal.last_address(),
            limit = ?limit,
            "skipping signal outside address limit"
        );
    }

    fn log_read_failure(&self, signal: &SignalDescriptor, source: ModbusTransportError) {
        let err = DriverError::TransientRead {
            signal: signal.name.clone(),
            source,
        };
        warn!(
            driver_id = %self.origin.driver_id,
            endpoint = %self.origin.source,
            address = signal.address,
            length = signal.length,
            error = %err,
            "signal skipped this cycle"
        );
    }

    /// Runs one cycle over `schema`, calling `emit` in schema order.
    pub async fn poll_cycle<T, F>(
        &self,
        transport: &mut T,
        schema: &PollingSchema,
        emit: F,
    ) -> CycleOutcome
    where
        T: RegisterTransport + ?Sized,
        F: FnMut(SignalReading),
    {
        match self.mode {
            ReadMode::PerSignal => self.poll_per_signal(transport, schema, emit).await,
            ReadMode::Block { start } => self.poll_block(transport, schema, start, emit).await,
        }
    }

    async fn poll_per_signal<T, F>(
        &self,
        transport: &mut T,
        schema: &PollingSchema,
        mut emit: F,
    ) -> CycleOutcome
    where
        T: RegisterTransport + ?Sized,
        F: FnMut(SignalReading),
    {
        let decoder = schema.decoder();
        let (mut emitted, mut skipped) = (0, 0);

        for signal in &schema.signals {
            if !signal.within_limit(schema.address_limit) {
                self.log_out_of_range(signal, schema.address_limit);
                skipped += 1;
                continue;
            }

            let words = match self
                .read_with_fallback(transport, signal.address, signal.length)
                .await
            {
                Ok(words) => words,
                Err(err) if err.is_connection_lost() => return CycleOutcome::ConnectionLost(err),
                Err(err) => {
                    self.log_read_failure(signal, err);
                    skipped += 1;
                    continue;
                }
            };

            match decoder.decode_scaled(&words, signal.length, signal.scale, signal.offset) {
                Some(value) => {
                    emit(self.origin.reading(signal, value, epoch_seconds()));
                    emitted += 1;
                }
                None => {
                    warn!(signal = %signal.name, got = words.len(), "short response, skipping");
                    skipped += 1;
                }
            }
        }

        CycleOutcome::Completed { emitted, skipped }
    }

    async fn poll_block<T, F>(
        &self,
        transport: &mut T,
        schema: &PollingSchema,
        start: Option<u16>,
        mut emit: F,
    ) -> CycleOutcome
    where
        T: RegisterTransport + ?Sized,
        F: FnMut(SignalReading),
    {
        let mut skipped = 0;
        let mut wanted: Vec<&SignalDescriptor> = Vec::with_capacity(schema.signals.len());
        for signal in &schema.signals {
            if !signal.within_limit(schema.address_limit) {
                self.log_out_of_range(signal, schema.address_limit);
                skipped += 1;
            } else if start.is_some_and(|start| signal.address < start) {
                debug!(signal = %signal.name, address = signal.address, start = ?start, "signal below block start");
                skipped += 1;
            } else {
                wanted.push(signal);
            }
        }

        let Some(block_start) = start.or_else(|| wanted.iter().map(|s| s.address).min()) else {
            return CycleOutcome::Completed { emitted: 0, skipped };
        };
        let block_end = wanted
            .iter()
            .map(|s| s.end_address())
            .max()
            .unwrap_or(block_start as u32);

        // None marks words whose chunk could not be read this cycle
        let mut words: Vec<Option<u16>> = vec![None; (block_end - block_start as u32) as usize];
        let mut chunk_start = block_start as u32;
        while chunk_start < block_end {
            let count = (block_end - chunk_start).min(MAX_READ_REGISTERS as u32);
            match self
                .read_with_fallback(transport, chunk_start as u16, count as u16)
                .await
            {
                Ok(chunk) => {
                    let base = (chunk_start - block_start as u32) as usize;
                    for (i, word) in chunk.into_iter().take(count as usize).enumerate() {
                        words[base + i] = Some(word);
                    }
                }
                Err(err) if err.is_connection_lost() => return CycleOutcome::ConnectionLost(err),
                Err(err) => warn!(
                    driver_id = %self.origin.driver_id,
                    start = chunk_start,
                    count,
                    error = %err,
                    "block read failed"
                ),
            }
            chunk_start += count;
        }

        let decoder = schema.decoder();
        let mut emitted = 0;
        for signal in wanted {
            let from = (signal.address - block_start) as usize;
            let raw: Option<Vec<u16>> = words[from..from + signal.length as usize]
                .iter()
                .copied()
                .collect();
            match raw.and_then(|raw| {
                decoder.decode_scaled(&raw, signal.length, signal.scale, signal.offset)
            }) {
                Some(value) => {
                    emit(self.origin.reading(signal, value, epoch_seconds()));
                    emitted += 1;
                }
                None => skipped += 1,
            }
        }

        CycleOutcome::Completed { emitted, skipped }
    }

    /// Polls until `stop` is requested or the link is lost.
    ///
    /// `schema` is consulted at the top of every cycle so a reconfiguration is
    /// picked up whole at the next boundary.
    pub async fn run<T, S>(
        &self,
        transport: &mut T,
        schema: S,
        callback: &SignalCallback,
        stop: &StopSignal,
    ) -> Result<u64, ModbusTransportError>
    where
        T: RegisterTransport + ?Sized,
        S: Fn() -> Arc<PollingSchema>,
    {
        let mut cycles = 0u64;
        while !stop.is_requested() {
            let schema = schema();
            match self
                .poll_cycle(transport, &schema, |reading| deliver(callback, reading))
                .await
            {
                CycleOutcome::Completed { emitted, skipped } => {
                    cycles += 1;
                    debug!(
                        driver_id = %self.origin.driver_id,
                        cycle = cycles,
                        emitted,
                        skipped,
                        "poll cycle done"
                    );
                }
                CycleOutcome::ConnectionLost(err) => return Err(err),
            }
            stop.sleep(self.options.poll_interval()).await;
        }
        Ok(cycles)
    }
}
