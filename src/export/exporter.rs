//! Background drain loop.
//!
//! The [`Exporter`] owns a [`Transport`] and a handle to the shared
//! [`Buffer`]. One drain cycle:
//!
//! 1. reads the persisted destination and stops if it is unset;
//! 2. flushes the pending set into observed priority if needed;
//! 3. walks records in drain order, grouping them into batches;
//! 4. sends each batch with no buffer lock held and deletes its ids only
//!    after the collector acknowledged it.
//!
//! A failed batch stays in the buffer untouched. Outages stop the cycle and
//! the loop backs off; a rejected batch is skipped and the cycle moves on.
//!
//! [`Exporter::spawn`] moves the exporter onto its own thread and returns an
//! [`ExporterHandle`] for waking, flushing and stopping it. Producers never
//! talk to the thread: it finds new records by polling the buffer every
//! `drain_interval`.

use crate::domain::error::{Result, SpoolError};
use crate::domain::SpanRecord;
use crate::export::backoff::{Backoff, RetryConfig};
use crate::export::batch::BatchBuilder;
use crate::export::transport::Transport;
use crate::storage::Buffer;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const THREAD_NAME: &str = "trace-spool-exporter";

/// Where the exporter is in its cycle.
///
/// `Idle -> Draining -> (Sent | Failed) -> Idle`, and `Disabled` whenever no
/// destination is configured. A spawned exporter holds `Sent` or `Failed`
/// only until the next cycle is scheduled; [`Exporter::drain_cycle`] called
/// directly leaves them in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExporterState {
    /// Waiting for the next cycle.
    Idle = 0,
    /// A drain cycle is running.
    Draining = 1,
    /// The cycle just finished delivered everything it attempted.
    Sent = 2,
    /// The cycle just finished left records behind.
    Failed = 3,
    /// No destination is configured; nothing is sent.
    Disabled = 4,
}

impl ExporterState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Draining,
            2 => Self::Sent,
            3 => Self::Failed,
            4 => Self::Disabled,
            _ => Self::Idle,
        }
    }
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No destination is configured, or it was cleared mid-cycle; records
    /// stay buffered.
    Disabled {
        /// Records delivered before the destination was found cleared.
        delivered: usize,
    },
    /// Every attempted batch was delivered; holds the record count.
    Delivered(usize),
    /// Some batches failed and will be retried after a backoff.
    Deferred {
        /// Records delivered before the cycle gave up.
        delivered: usize,
        /// Records still stored when the cycle ended.
        remaining: usize,
    },
    /// The caller stopped waiting before the cycle finished.
    InProgress,
}

/// Drain loop tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    /// Pause between cycles while deliveries succeed.
    pub drain_interval: Duration,
    /// Upper bound on records per request.
    pub max_batch_records: usize,
    /// Backoff after failed cycles.
    pub retry: RetryConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(1),
            max_batch_records: 64,
            retry: RetryConfig::default(),
        }
    }
}

enum Command {
    Wake,
    Flush(Sender<Result<DrainOutcome>>),
    Shutdown {
        flush: bool,
        reply: Option<Sender<Result<DrainOutcome>>>,
    },
}

/// Drains a [`Buffer`] into a [`Transport`].
pub struct Exporter<T: Transport> {
    buffer: Arc<Buffer>,
    transport: T,
    config: ExporterConfig,
    backoff: Backoff,
    state: Arc<AtomicU8>,
}

impl<T: Transport> Exporter<T> {
    /// Creates an exporter in the [`ExporterState::Idle`] state.
    ///
    /// # Parameters
    ///
    /// - `buffer`: the buffer to drain, shared with producers
    /// - `transport`: how batches reach the collector
    /// - `config`: polling interval, batch size and retry tuning
    #[must_use]
    pub fn new(buffer: Arc<Buffer>, transport: T, config: ExporterConfig) -> Self {
        let backoff = Backoff::new(config.retry.clone());
        Self {
            buffer,
            transport,
            config,
            backoff,
            state: Arc::new(AtomicU8::new(ExporterState::Idle as u8)),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ExporterState {
        ExporterState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ExporterState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Runs one drain cycle on the calling thread.
    ///
    /// Delivery failures are logged and reported as
    /// [`DrainOutcome::Deferred`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the buffer could not be read or updated.
    /// Records are never deleted without an acknowledged send, so the buffer
    /// stays consistent either way.
    pub fn drain_cycle(&mut self) -> Result<DrainOutcome> {
        let outcome = self.cycle();
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "drain cycle aborted by storage error");
            self.set_state(ExporterState::Failed);
        }
        outcome
    }

    fn cycle(&mut self) -> Result<DrainOutcome> {
        let buffer = Arc::clone(&self.buffer);

        if buffer.destination()?.is_disabled() {
            self.set_state(ExporterState::Disabled);
            return Ok(DrainOutcome::Disabled { delivered: 0 });
        }

        let _span = tracing::debug_span!("drain_cycle", transport = self.transport.name()).entered();
        self.set_state(ExporterState::Draining);

        if !buffer.is_observed() {
            buffer.mark_observed()?;
        }

        let mut records = buffer.iter()?;
        let mut carry: Option<SpanRecord> = None;
        let mut delivered = 0usize;
        let mut failed = false;

        loop {
            let mut builder = BatchBuilder::new(self.config.max_batch_records);
            while builder.has_room() {
                let record = match carry.take() {
                    Some(record) => record,
                    None => match records.next() {
                        Some(record) => record?,
                        None => break,
                    },
                };
                if let Err(record) = builder.push(record) {
                    carry = Some(record);
                    break;
                }
            }

            let Some(batch) = builder.finish() else {
                break;
            };

            // Re-read so a destination cleared mid-cycle stops further sends.
            let destination = buffer.destination()?;
            if destination.is_disabled() {
                tracing::debug!(delivered, "destination cleared during drain, stopping");
                self.set_state(ExporterState::Disabled);
                return Ok(DrainOutcome::Disabled { delivered });
            }

            let count = batch.ids.len();
            match self.transport.send(&destination, &batch.mime, batch.body) {
                Ok(()) => {
                    buffer.delete(&batch.ids)?;
                    delivered += count;
                    tracing::debug!(count, mime = %batch.mime, "batch delivered");
                }
                Err(e) => {
                    failed = true;
                    tracing::warn!(
                        error = %e,
                        count,
                        first_id = batch.ids.first().copied(),
                        "delivery failed, records kept for retry"
                    );
                    if e.halts_cycle() {
                        break;
                    }
                }
            }
        }

        if failed {
            let remaining = buffer.len()?;
            self.set_state(ExporterState::Failed);
            return Ok(DrainOutcome::Deferred {
                delivered,
                remaining,
            });
        }

        self.set_state(if delivered > 0 {
            ExporterState::Sent
        } else {
            ExporterState::Idle
        });
        Ok(DrainOutcome::Delivered(delivered))
    }

    /// Ends the `Sent`/`Failed` step once the next cycle is scheduled.
    fn settle(&self) {
        if matches!(self.state(), ExporterState::Sent | ExporterState::Failed) {
            self.set_state(ExporterState::Idle);
        }
    }

    fn next_delay(&mut self, outcome: &Result<DrainOutcome>) -> Duration {
        match outcome {
            Ok(DrainOutcome::Deferred { .. }) | Err(_) => {
                let delay = self.backoff.fail();
                tracing::debug!(
                    failures = self.backoff.failures(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "backing off"
                );
                delay
            }
            Ok(_) => {
                self.backoff.reset();
                self.config.drain_interval
            }
        }
    }

    /// Moves the exporter onto a dedicated thread.
    ///
    /// The first cycle starts immediately, so records left by a previous
    /// process are retried right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self) -> Result<ExporterHandle>
    where
        T: 'static,
    {
        let (commands, receiver) = mpsc::channel();
        let state = Arc::clone(&self.state);

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || self.run(&receiver))?;

        tracing::debug!(thread = THREAD_NAME, "exporter started");
        Ok(ExporterHandle {
            commands,
            thread: Some(thread),
            state,
        })
    }

    fn run(mut self, commands: &Receiver<Command>) {
        let mut delay = Duration::ZERO;

        loop {
            match commands.recv_timeout(delay) {
                Ok(Command::Wake) => self.backoff.reset(),
                Ok(Command::Flush(reply)) => {
                    self.backoff.reset();
                    let outcome = self.drain_cycle();
                    delay = self.next_delay(&outcome);
                    self.settle();
                    let _ = reply.send(outcome);
                    continue;
                }
                Ok(Command::Shutdown { flush, reply }) => {
                    let outcome = if flush {
                        self.drain_cycle()
                    } else {
                        Ok(DrainOutcome::Delivered(0))
                    };
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let outcome = self.drain_cycle();
            delay = self.next_delay(&outcome);
            self.settle();
        }

        tracing::debug!("exporter stopped");
    }
}

/// Control handle for a spawned [`Exporter`].
///
/// Dropping the handle stops the thread after its current cycle without a
/// final flush.
pub struct ExporterHandle {
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    state: Arc<AtomicU8>,
}

impl ExporterHandle {
    /// Current state of the exporter thread.
    #[must_use]
    pub fn state(&self) -> ExporterState {
        ExporterState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Starts a cycle now and clears any backoff.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::ExporterStopped`] if the thread has exited.
    pub fn wake(&self) -> Result<()> {
        self.commands
            .send(Command::Wake)
            .map_err(|_| SpoolError::ExporterStopped)
    }

    /// Runs a cycle now and waits up to `timeout` for its outcome.
    ///
    /// # Returns
    ///
    /// The cycle's [`DrainOutcome`], or [`DrainOutcome::InProgress`] if it
    /// has not finished in time; it keeps running in the background.
    ///
    /// # Errors
    ///
    /// Returns the cycle's storage error, or [`SpoolError::ExporterStopped`]
    /// if the thread has exited.
    pub fn flush(&self, timeout: Duration) -> Result<DrainOutcome> {
        let (reply, outcome) = mpsc::channel();
        self.commands
            .send(Command::Flush(reply))
            .map_err(|_| SpoolError::ExporterStopped)?;
        wait_for(&outcome, timeout)
    }

    /// Flushes, then stops the thread.
    ///
    /// The thread is joined when the final cycle finishes within `timeout`,
    /// otherwise it is left to finish on its own.
    ///
    /// # Errors
    ///
    /// Same as [`ExporterHandle::flush`].
    pub fn shutdown(mut self, timeout: Duration) -> Result<DrainOutcome> {
        let (reply, outcome) = mpsc::channel();
        self.commands
            .send(Command::Shutdown {
                flush: true,
                reply: Some(reply),
            })
            .map_err(|_| SpoolError::ExporterStopped)?;

        let outcome = wait_for(&outcome, timeout);
        if let Some(thread) = self.thread.take() {
            if matches!(outcome, Ok(DrainOutcome::InProgress)) {
                tracing::warn!("exporter still draining at shutdown, detaching");
            } else if thread.join().is_err() {
                tracing::error!("exporter thread panicked");
            }
        }
        outcome
    }
}

fn wait_for(outcome: &Receiver<Result<DrainOutcome>>, timeout: Duration) -> Result<DrainOutcome> {
    match outcome.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Ok(DrainOutcome::InProgress),
        Err(RecvTimeoutError::Disconnected) => Err(SpoolError::ExporterStopped),
    }
}

impl Drop for ExporterHandle {
    fn drop(&mut self) {
        if self.thread.take().is_some() {
            let _ = self.commands.send(Command::Shutdown {
                flush: false,
                reply: None,
            });
        }
    }
}

impl std::fmt::Debug for ExporterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
