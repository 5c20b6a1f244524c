//! Cooperative task scheduling.
//!
//! All signal evaluation runs on whichever thread drives the [`Scheduler`].
//! Stimulus sources and notifiers only *post* work; the driver executes it one
//! task at a time, so components never see concurrent mutation from the core.
//!
//! [`Interval`] is the only owner of a background thread. Its thread never
//! touches component state: on every tick it posts a task and goes back to
//! sleep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{ExecutionError, SignalResult};

/// A unit of scheduled work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle used to enqueue work from anywhere.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Task>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl SchedulerHandle {
    /// Enqueues `task`. Returns false if the scheduler is gone.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(task)).is_ok()
    }
}

/// Summary of one drive of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Tasks executed.
    pub turns: usize,
    /// True if the queue was empty when the run stopped.
    pub idle: bool,
}

/// Single-threaded task queue.
pub struct Scheduler {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    max_turns: usize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.rx.len())
            .field("max_turns", &self.max_turns)
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl Scheduler {
    /// An empty queue whose idle runs are capped at `cfg.max_turns`.
    #[must_use]
    pub fn new(cfg: &EngineConfig) -> Self {
        let (tx, rx) = unbounded::<Task>();
        Self {
            tx,
            rx,
            max_turns: cfg.max_turns.max(1),
        }
    }

    /// A handle for posting work from other components or threads.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Runs at most `limit` tasks, including tasks enqueued by those tasks.
    pub fn run_turns(&self, limit: usize) -> RunReport {
        let mut turns = 0;
        while turns < limit {
            let Ok(task) = self.rx.try_recv() else {
                return RunReport { turns, idle: true };
            };
            task();
            turns += 1;
        }
        let idle = self.rx.is_empty();
        if !idle {
            warn!(turns, pending = self.rx.len(), "scheduler turn budget exhausted");
        }
        RunReport { turns, idle }
    }

    /// Runs until the queue drains or the configured turn budget is spent.
    ///
    /// A run that ends with `idle == false` usually means a notifier feeds
    /// its own detector.
    pub fn run_until_idle(&self) -> RunReport {
        self.run_turns(self.max_turns)
    }

    /// Executes tasks as they arrive until `duration` elapses.
    pub fn run_for(&self, duration: Duration) -> RunReport {
        let deadline = Instant::now() + duration;
        let mut turns = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(task) => {
                    task();
                    turns += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        RunReport {
            turns,
            idle: self.rx.is_empty(),
        }
    }
}

/// A periodic timer that posts a task to the scheduler on every tick.
pub struct Interval {
    name: String,
    stop_tx: Mutex<Option<Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    finished: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
}

impl std::fmt::Debug for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interval")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("ticks", &self.ticks())
            .finish()
    }
}

impl Interval {
    /// Starts a timer thread.
    ///
    /// `on_tick` runs on the scheduler, never on the timer thread. With
    /// `max_runs` set the timer stops by itself after that many ticks; a
    /// limit of zero yields a finished timer and spawns no thread.
    pub fn start<F>(
        name: impl Into<String>,
        period: Duration,
        max_runs: Option<u64>,
        scheduler: SchedulerHandle,
        on_tick: F,
    ) -> SignalResult<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        if max_runs == Some(0) {
            debug!(interval = %name, "interval has no runs, not starting");
            return Ok(Self::finished(name));
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let finished = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));

        let thread_finished = Arc::clone(&finished);
        let thread_ticks = Arc::clone(&ticks);
        let on_tick = Arc::new(on_tick);
        let thread_name = name.clone();

        let join = thread::Builder::new()
            .name(format!("signalgraph-interval-{name}"))
            .spawn(move || {
                let ticker = tick(period);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let task = Arc::clone(&on_tick);
                            if !scheduler.post(move || task()) {
                                debug!(interval = %thread_name, "scheduler dropped, stopping interval");
                                break;
                            }
                            let n = thread_ticks.fetch_add(1, Ordering::AcqRel) + 1;
                            if max_runs.is_some_and(|max| n >= max) {
                                debug!(interval = %thread_name, ticks = n, "interval reached its run limit");
                                break;
                            }
                        }
                    }
                }
                thread_finished.store(true, Ordering::Release);
            })
            .map_err(|e| ExecutionError::SchedulerSpawn {
                reason: e.to_string(),
            })?;

        debug!(interval = %name, period_ms = period.as_millis() as u64, "interval started");
        Ok(Self {
            name,
            stop_tx: Mutex::new(Some(stop_tx)),
            join: Mutex::new(Some(join)),
            finished,
            ticks,
        })
    }

    fn finished(name: String) -> Self {
        Self {
            name,
            stop_tx: Mutex::new(None),
            join: Mutex::new(None),
            finished: Arc::new(AtomicBool::new(true)),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stops the timer and waits for its thread. Idempotent.
    pub fn cancel(&self) {
        let stop = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(stop) = stop else {
            return;
        };
        // Disconnecting the channel wakes the timer thread.
        drop(stop);

        let handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(interval = %self.name, "interval thread panicked");
            }
        }
        self.finished.store(true, Ordering::Release);
        debug!(interval = %self.name, "interval cancelled");
    }

    /// True while the timer thread is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }

    /// Ticks posted so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        self.cancel();
    }
}
