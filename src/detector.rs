//! Detectors turn raw stimuli into gated `Detected` / `Skipped` signals.
//!
//! Per signal a detector moves `Idle → Evaluating → {Accepted, Blocked}`.
//! Its recorded state changes only after every bound filter has let the
//! value through. Evaluation runs to completion inside the calling turn, so
//! one signal is fully decided before the detector looks at the next.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::environment::Environment;
use crate::error::SignalResult;
use crate::events::{Emitter, Event, EventKind, SubscriptionId};
use crate::filter::{Filter, Verdict};
use crate::scheduler::{Interval, SchedulerHandle};
use crate::value::Value;

/// Unique identifier for a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorId(Uuid);

impl DetectorId {
    /// Creates a new random detector id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DetectorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a detector as carried in events and filter calls.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectorInfo {
    pub id: DetectorId,
    pub name: String,
}

impl DetectorInfo {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: DetectorId::new(),
            name: name.into(),
        }
    }
}

/// Where a candidate signal came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum SignalSource {
    /// Handed to [`Detector::send`] by the caller.
    Direct,
    /// Pushed by the detector's own stimulus source.
    Stimulus,
    /// Forwarded from a watched environment.
    Environment(String),
}

impl SignalSource {
    /// The environment name, if the signal came from one.
    #[must_use]
    pub fn environment(&self) -> Option<&str> {
        match self {
            Self::Environment(name) => Some(name),
            Self::Direct | Self::Stimulus => None,
        }
    }
}

/// Result of evaluating one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Recorded as the detector's new state.
    Accepted(Value),
    /// Dropped; carries the value the blocking filter saw.
    Blocked(Value),
}

impl Outcome {
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// External stimulus back-end (file watcher, GPIO pin, queue subscriber...).
///
/// The source receives an [`Intake`] when monitoring starts and uses it to
/// hand raw values to its detector. Guarding against double starts is up to
/// the source.
pub trait StimulusSource: Send {
    /// Begins listening.
    fn start(&mut self, intake: Intake) -> SignalResult<()>;

    /// Stops listening and releases the subscription. Must be idempotent.
    fn stop(&mut self);
}

/// Handle a stimulus source uses to feed its detector.
#[derive(Clone)]
pub struct Intake {
    detector: Weak<Detector>,
    scheduler: SchedulerHandle,
}

impl fmt::Debug for Intake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.detector.upgrade().map(|d| d.name().to_string());
        f.debug_struct("Intake").field("detector", &name).finish()
    }
}

impl Intake {
    /// Queues `value` for evaluation on the scheduler. Safe from any thread.
    ///
    /// Returns false if the detector or the scheduler is gone.
    pub fn push(&self, value: impl Into<Value>) -> bool {
        let value = value.into();
        let detector = Weak::clone(&self.detector);
        if detector.strong_count() == 0 {
            return false;
        }
        self.scheduler.post(move || {
            if let Some(detector) = detector.upgrade() {
                detector.send_from(value, SignalSource::Stimulus);
            }
        })
    }

    /// Evaluates `value` immediately. Only call this from a scheduler task.
    pub fn deliver(&self, value: impl Into<Value>) -> Option<Outcome> {
        let detector = self.detector.upgrade()?;
        Some(detector.send_from(value.into(), SignalSource::Stimulus))
    }

    /// The scheduler the detector's signals are evaluated on.
    #[must_use]
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }
}

#[derive(Default)]
struct DetectorState {
    intensity: Option<Value>,
    filters: Vec<Arc<dyn Filter>>,
    monitoring: bool,
}

/// A signal source bound to an ordered filter chain.
pub struct Detector {
    info: DetectorInfo,
    self_ref: Weak<Detector>,
    state: Mutex<DetectorState>,
    source: Mutex<Option<Box<dyn StimulusSource>>>,
    watches: Mutex<Vec<(Emitter, SubscriptionId)>>,
    exited: AtomicBool,
    events: Emitter,
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Detector")
            .field("name", &self.info.name)
            .field("intensity", &state.intensity)
            .field("filters", &state.filters.len())
            .field("monitoring", &state.monitoring)
            .finish()
    }
}

impl Detector {
    /// A detector fed only through [`Detector::send`] or watched environments.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), None)
    }

    /// A detector driven by an external stimulus source.
    #[must_use]
    pub fn with_source(name: impl Into<String>, source: Box<dyn StimulusSource>) -> Arc<Self> {
        Self::build(name.into(), Some(source))
    }

    fn build(name: String, source: Option<Box<dyn StimulusSource>>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            info: DetectorInfo::new(name),
            self_ref: Weak::clone(self_ref),
            state: Mutex::new(DetectorState::default()),
            source: Mutex::new(source),
            watches: Mutex::new(Vec::new()),
            exited: AtomicBool::new(false),
            events: Emitter::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    #[must_use]
    pub const fn id(&self) -> DetectorId {
        self.info.id
    }

    #[must_use]
    pub const fn info(&self) -> &DetectorInfo {
        &self.info
    }

    /// The event capability of this detector.
    #[must_use]
    pub const fn events(&self) -> &Emitter {
        &self.events
    }

    /// Last accepted value; `None` until a signal has been accepted.
    #[must_use]
    pub fn current_state(&self) -> Option<Value> {
        self.lock_state().intensity.clone()
    }

    /// Bound filters in evaluation order.
    #[must_use]
    pub fn filters(&self) -> Vec<Arc<dyn Filter>> {
        self.lock_state().filters.clone()
    }

    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.lock_state().monitoring
    }

    /// Appends `filter` to the chain.
    pub fn apply_filter(&self, filter: Arc<dyn Filter>) {
        self.lock_state().filters.push(filter);
    }

    /// Starts listening to the stimulus source, if there is one.
    pub fn start_monitoring(&self, scheduler: &SchedulerHandle) -> SignalResult<()> {
        let intake = Intake {
            detector: Weak::clone(&self.self_ref),
            scheduler: scheduler.clone(),
        };
        {
            let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(source) = source.as_mut() {
                source.start(intake)?;
            }
        }
        self.lock_state().monitoring = true;
        self.exited.store(false, Ordering::Release);
        info!(detector = %self.info.name, "detector started monitoring");
        Ok(())
    }

    /// Evaluates a signal handed in directly.
    pub fn send(&self, candidate: impl Into<Value>) -> Outcome {
        self.send_from(candidate.into(), SignalSource::Direct)
    }

    /// Runs the filter chain over `candidate` and emits the outcome.
    pub fn send_from(&self, candidate: Value, source: SignalSource) -> Outcome {
        let (prior, filters) = {
            let state = self.lock_state();
            (state.intensity.clone(), state.filters.clone())
        };

        let mut current = candidate;
        for (position, filter) in filters.iter().enumerate() {
            match filter.filter(&current, &source, &self.info) {
                Verdict::Pass => {}
                Verdict::Replace(next) => current = next,
                Verdict::Block => {
                    debug!(
                        detector = %self.info.name,
                        filter = filter.kind(),
                        position,
                        value = %current,
                        "signal skipped"
                    );
                    self.events.emit(&Event::Skipped {
                        prior,
                        value: current.clone(),
                        detector: self.info.clone(),
                        source,
                    });
                    return Outcome::Blocked(current);
                }
            }
        }

        self.lock_state().intensity = Some(current.clone());
        debug!(detector = %self.info.name, value = %current, "signal detected");
        self.events.emit(&Event::Detected {
            prior,
            value: current.clone(),
            detector: self.info.clone(),
            source,
        });
        Outcome::Accepted(current)
    }

    /// Feeds every state change of `environment` into this detector.
    pub fn watch(&self, environment: &dyn Environment) -> SubscriptionId {
        let detector = Weak::clone(&self.self_ref);
        let environment_name = environment.name().to_string();
        let id = environment
            .events()
            .subscribe(EventKind::Changed, move |event| {
                let Event::Changed { new, .. } = event else {
                    return;
                };
                if let Some(detector) = detector.upgrade() {
                    detector.send_from(
                        new.to_value(),
                        SignalSource::Environment(environment_name.clone()),
                    );
                }
            });
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((environment.events().clone(), id));
        debug!(detector = %self.info.name, environment = %environment.name(), "watching environment");
        id
    }

    /// Stops monitoring and releases the stimulus subscription. Idempotent.
    pub fn exit(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(source) = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            source.stop();
        }
        let watches = std::mem::take(&mut *self.watches.lock().unwrap_or_else(PoisonError::into_inner));
        for (emitter, id) in watches {
            emitter.unsubscribe(id);
        }
        self.lock_state().monitoring = false;
        info!(detector = %self.info.name, "detector exited");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        if let Some(source) = self
            .source
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            source.stop();
        }
        let watches = std::mem::take(self.watches.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (emitter, id) in watches {
            emitter.unsubscribe(id);
        }
    }
}

/// Sampler used by [`PollingSource`].
pub type Sampler = Arc<dyn Fn() -> Value + Send + Sync>;

/// A stimulus source that samples a closure on an interval.
///
/// This is the only kind of detector input that owns a background timer.
pub struct PollingSource {
    name: String,
    period: Duration,
    max_runs: Option<u64>,
    sampler: Sampler,
    interval: Option<Interval>,
}

impl fmt::Debug for PollingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingSource")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("max_runs", &self.max_runs)
            .field("interval", &self.interval)
            .finish()
    }
}

impl PollingSource {
    /// `period` is raised to the configured polling floor.
    #[must_use]
    pub fn new<F>(cfg: &EngineConfig, name: impl Into<String>, period: Duration, sampler: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            period: cfg.clamp_poll_interval(period),
            max_runs: None,
            sampler: Arc::new(sampler),
            interval: None,
        }
    }

    /// Stop after `runs` samples.
    #[must_use]
    pub const fn with_max_runs(mut self, runs: u64) -> Self {
        self.max_runs = Some(runs);
        self
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.interval.as_ref().is_some_and(Interval::is_active)
    }
}

impl StimulusSource for PollingSource {
    fn start(&mut self, intake: Intake) -> SignalResult<()> {
        if self.is_active() {
            warn!(source = %self.name, "polling source already started");
            return Ok(());
        }
        let sampler = Arc::clone(&self.sampler);
        let scheduler = intake.scheduler().clone();
        let interval = Interval::start(self.name.clone(), self.period, self.max_runs, scheduler, move || {
            intake.deliver(sampler());
        })?;
        info!(source = %self.name, period_ms = self.period.as_millis() as u64, "polling source started");
        self.interval = Some(interval);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(interval) = self.interval.take() {
            interval.cancel();
        }
    }
}
