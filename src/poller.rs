//! Background polling.
//!
//! The poll loop runs on its own thread and walks the [`PollPlan`] once per
//! cycle: every block is read with bounded retries, results land in the
//! [`RegisterStore`], and the registered [`UpdateHandler`] receives a snapshot.
//! Cancellation is checked before each request and interrupts every sleep.
//!
//! [`PollPlan`]: crate::config::PollPlan

use core::time::Duration;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use strum_macros::Display;

use crate::codec::{Protocol, Response, Values};
use crate::config::{PollConfig, ReadBlock, std_duration};
use crate::error::{Error, Result};
use crate::link::{SharedLink, with_link};
use crate::store::{RegisterStore, Snapshot};
use crate::transport::Transport;

/// Lifecycle of the poll loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
pub enum PollState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// A persistent failure, reported once when it begins.
#[derive(Debug, Clone, PartialEq)]
pub struct PollFailure {
    /// Failed cycles in a row, at least the configured threshold.
    pub consecutive_failures: u32,
    pub last_error: Error,
    /// Cycle number on which the failure was reported.
    pub cycle: u64,
}

/// Receives poll results on the polling thread.
///
/// Handlers run while the handler slot is locked, so they must not register
/// another handler from inside a callback. Reading, writing and stopping the
/// device from a callback are fine.
pub trait UpdateHandler: Send + 'static {
    /// Called once per cycle in which at least one block was read.
    fn on_update(&mut self, snapshot: Snapshot);

    /// Called once when consecutive failed cycles reach the threshold.
    fn on_failure(&mut self, _failure: &PollFailure) {}

    /// Called once when a cycle succeeds after a reported failure.
    fn on_recovered(&mut self) {}
}

impl<F> UpdateHandler for F
where
    F: FnMut(Snapshot) + Send + 'static,
{
    fn on_update(&mut self, snapshot: Snapshot) {
        self(snapshot)
    }
}

/// The device's single handler slot.
pub type SharedHandler = Arc<Mutex<Option<Box<dyn UpdateHandler>>>>;

/// Counters describing the poll loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStatus {
    pub state: PollState,
    pub paused: bool,
    /// Cycles run since polling was started.
    pub cycles: u64,
    pub successful_cycles: u64,
    pub consecutive_failures: u32,
    /// A failure has been reported and no cycle has succeeded since.
    pub failing: bool,
}

/// What the loop needs from its device.
pub(crate) struct PollContext<P: Protocol, T: Transport> {
    pub name: String,
    pub link: SharedLink<P, T>,
    pub store: Arc<RegisterStore>,
    pub handler: SharedHandler,
}

struct Worker {
    /// Dropping the sender cancels the loop.
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the poll thread. At most one loop runs at a time.
#[derive(Default)]
pub struct Poller {
    status: Arc<Mutex<PollStatus>>,
    worker: Mutex<Option<Worker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the loop and wait until it is running.
    pub(crate) fn start<P, T>(&self, config: PollConfig, context: PollContext<P, T>) -> Result<()>
    where
        P: Protocol,
        T: Transport,
    {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        config.validate()?;
        *lock(&self.status) = PollStatus {
            state: PollState::Starting,
            ..PollStatus::default()
        };

        let (cancel, cancelled) = mpsc::channel();
        let (ready, started) = mpsc::channel();
        let status = Arc::clone(&self.status);
        let spawned = thread::Builder::new()
            .name(format!("poll {}", context.name))
            .spawn(move || {
                lock(&status).state = PollState::Running;
                // `start` is blocked on this until the state is Running.
                let _ = ready.send(());
                PollLoop::new(config, context, status, cancelled).run();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                lock(&self.status).state = PollState::Stopped;
                return Err(Error::Thread(err.to_string()));
            }
        };
        if started.recv().is_err() {
            let _ = handle.join();
            lock(&self.status).state = PollState::Stopped;
            return Err(Error::Thread("poll thread exited during start".to_owned()));
        }
        *worker = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Cancel the loop and wait for it to exit. A no-op when stopped.
    ///
    /// Called from a handler, on the poll thread itself, this only cancels:
    /// the loop returns once the callback does and marks itself stopped.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        let Some(Worker { cancel, handle }) = worker.take() else {
            return;
        };
        lock(&self.status).state = PollState::Stopping;
        drop(cancel);
        if handle.thread().id() == thread::current().id() {
            log::debug!("Poll loop stopped from its own handler");
            return;
        }
        if handle.join().is_err() {
            log::error!("Poll thread panicked");
        }
        let mut status = lock(&self.status);
        status.state = PollState::Stopped;
        status.paused = false;
    }

    /// Keep the thread alive but skip cycles until [`Self::resume`].
    pub fn pause(&self) -> Result<()> {
        self.set_paused(true)
    }

    pub fn resume(&self) -> Result<()> {
        self.set_paused(false)
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        let mut status = lock(&self.status);
        if status.state != PollState::Running {
            return Err(Error::NotRunning);
        }
        status.paused = paused;
        Ok(())
    }

    pub fn status(&self) -> PollStatus {
        *lock(&self.status)
    }

    pub fn state(&self) -> PollState {
        lock(&self.status).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == PollState::Running
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a cycle ended early.
struct Cancelled;

enum CycleOutcome {
    /// At least one block was read.
    Updated,
    Failed(Error),
    /// Nothing left to read.
    Idle,
}

struct PollLoop<P: Protocol, T: Transport> {
    context: PollContext<P, T>,
    blocks: Vec<ReadBlock>,
    interval: Duration,
    timeout: Duration,
    gap: Duration,
    retries: u32,
    failure_threshold: u32,
    status: Arc<Mutex<PollStatus>>,
    cancelled: Receiver<()>,
}

impl<P: Protocol, T: Transport> PollLoop<P, T> {
    fn new(
        config: PollConfig,
        context: PollContext<P, T>,
        status: Arc<Mutex<PollStatus>>,
        cancelled: Receiver<()>,
    ) -> Self {
        Self {
            blocks: config.plan.blocks().to_vec(),
            interval: std_duration(config.interval),
            timeout: std_duration(config.response_timeout),
            gap: std_duration(config.request_gap),
            retries: config.retries,
            failure_threshold: config.failure_threshold.max(1),
            context,
            status,
            cancelled,
        }
    }

    fn run(mut self) {
        log::info!(
            "Polling {} ({} blocks every {:?})",
            self.context.name,
            self.blocks.len(),
            self.interval
        );
        let mut cycle = 0u64;
        while !self.is_cancelled() {
            if lock(&self.status).paused {
                if self.sleep(self.interval).is_err() {
                    break;
                }
                continue;
            }

            cycle += 1;
            let outcome = match self.cycle() {
                Ok(outcome) => outcome,
                Err(Cancelled) => break,
            };
            self.finish_cycle(cycle, outcome);
            log::trace!("Completed poll cycle #{cycle}");

            if self.sleep(self.interval).is_err() {
                break;
            }
        }
        log::info!("Polling of {} stopped after {cycle} cycles", self.context.name);
        let mut status = lock(&self.status);
        // A newer loop may already own the status after a self-stop.
        if status.state == PollState::Stopping {
            status.state = PollState::Stopped;
            status.paused = false;
        }
    }

    fn cycle(&mut self) -> core::result::Result<CycleOutcome, Cancelled> {
        let mut updated = false;
        let mut last_error = None;
        let mut index = 0;
        while index < self.blocks.len() {
            if index > 0 || updated || last_error.is_some() {
                self.sleep(self.gap)?;
            }
            let block = self.blocks[index];
            match self.read_block(&block)? {
                Ok(values) => {
                    self.context.store.update_block(block.start, &values);
                    updated = true;
                    if block.once {
                        log::debug!(
                            "Block 0x{:04X}+{} read, dropping it",
                            block.start,
                            block.count
                        );
                        self.blocks.remove(index);
                        continue;
                    }
                }
                Err(err) => {
                    log::debug!("Block 0x{:04X}+{} failed: {err}", block.start, block.count);
                    last_error = Some(err);
                }
            }
            index += 1;
        }

        Ok(match (updated, last_error) {
            (true, _) => CycleOutcome::Updated,
            (false, Some(err)) => CycleOutcome::Failed(err),
            (false, None) => CycleOutcome::Idle,
        })
    }

    /// Up to `retries + 1` attempts; errors that retrying cannot fix end early.
    fn read_block(
        &self,
        block: &ReadBlock,
    ) -> core::result::Result<Result<Values>, Cancelled> {
        let request = match block.request() {
            Ok(request) => request,
            Err(err) => return Ok(Err(err)),
        };
        let mut attempt = 0;
        loop {
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            let result =
                with_link(&self.context.link, |link| link.transact(&request, self.timeout));
            match result {
                Ok(Response::Registers { values, .. }) => return Ok(Ok(values)),
                Ok(Response::Written { .. }) => return Ok(Err(Error::InvalidResponse)),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    log::trace!(
                        "Retrying 0x{:04X} ({attempt}/{}): {err}",
                        block.start,
                        self.retries
                    );
                }
                Err(err) => return Ok(Err(err)),
            }
        }
    }

    fn finish_cycle(&self, cycle: u64, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Updated => {
                let snapshot = self.context.store.snapshot();
                let recovered = {
                    let mut status = lock(&self.status);
                    status.cycles += 1;
                    status.successful_cycles += 1;
                    status.consecutive_failures = 0;
                    core::mem::replace(&mut status.failing, false)
                };
                if recovered {
                    log::info!("{} responding again", self.context.name);
                }
                if let Some(handler) = lock(&self.context.handler).as_mut() {
                    if recovered {
                        handler.on_recovered();
                    }
                    handler.on_update(snapshot);
                }
            }
            CycleOutcome::Failed(last_error) => {
                let failure = {
                    let mut status = lock(&self.status);
                    status.cycles += 1;
                    status.consecutive_failures += 1;
                    if status.failing || status.consecutive_failures < self.failure_threshold {
                        None
                    } else {
                        status.failing = true;
                        Some(PollFailure {
                            consecutive_failures: status.consecutive_failures,
                            last_error,
                            cycle,
                        })
                    }
                };
                if let Some(failure) = failure {
                    log::warn!(
                        "{} not responding after {} cycles: {}",
                        self.context.name,
                        failure.consecutive_failures,
                        failure.last_error
                    );
                    if let Some(handler) = lock(&self.context.handler).as_mut() {
                        handler.on_failure(&failure);
                    }
                }
            }
            CycleOutcome::Idle => lock(&self.status).cycles += 1,
        }
    }

    fn is_cancelled(&self) -> bool {
        !matches!(self.cancelled.try_recv(), Err(TryRecvError::Empty))
    }

    /// Wait for `duration` unless cancelled first.
    fn sleep(&self, duration: Duration) -> core::result::Result<(), Cancelled> {
        match self.cancelled.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(Cancelled),
        }
    }
}
