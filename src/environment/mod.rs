//! Environments: named state containers that broadcast their changes.
//!
//! A [`BasicEnvironment`] holds one opaque [`Value`]. A [`MultiEnvironment`]
//! holds named sub-environments and forwards foreign values to all of them.
//! Composites own their children; a child only keeps a weak reference back
//! to its parent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::SignalResult;
use crate::events::{Emitter, Event};
use crate::scheduler::{Interval, SchedulerHandle};
use crate::value::Value;

pub mod multi;

pub use multi::{InitialState, MultiEnvironment, MultiEnvironmentParams};

/// Child name → child, as held by a composite.
pub type SubEnvironments = BTreeMap<String, Arc<dyn Environment>>;

/// The state of an environment.
#[derive(Debug, Clone)]
pub enum EnvironmentState {
    /// Opaque value of a basic environment.
    Value(Value),
    /// Children of a composite.
    Composite(SubEnvironments),
}

impl EnvironmentState {
    /// Renders the state as a plain value; composites become a JSON object
    /// of child name → child state.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Composite(children) => {
                let map = children
                    .iter()
                    .map(|(name, child)| (name.clone(), child.state().to_value().to_json()))
                    .collect::<serde_json::Map<_, _>>();
                Value::Structured(serde_json::Value::Object(map))
            }
        }
    }

    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Composite(_) => None,
        }
    }

    #[must_use]
    pub const fn as_composite(&self) -> Option<&SubEnvironments> {
        match self {
            Self::Composite(children) => Some(children),
            Self::Value(_) => None,
        }
    }
}

/// Values compare structurally; composites compare by key set and child identity.
impl PartialEq for EnvironmentState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            (Self::Composite(a), Self::Composite(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && Arc::ptr_eq(va, vb))
            }
            _ => false,
        }
    }
}

/// A candidate change pushed into an environment.
#[derive(Debug, Clone)]
pub enum Change {
    /// Opaque state replacement (or a foreign signal, for composites).
    Value(Value),
    /// A sub-environment to compose.
    Environment(Arc<dyn Environment>),
}

impl Change {
    /// Label used in validation messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Value(v) => v.type_name(),
            Self::Environment(_) => "environment",
        }
    }
}

impl From<Value> for Change {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Arc<dyn Environment>> for Change {
    fn from(env: Arc<dyn Environment>) -> Self {
        Self::Environment(env)
    }
}

impl From<Arc<BasicEnvironment>> for Change {
    fn from(env: Arc<BasicEnvironment>) -> Self {
        Self::Environment(env)
    }
}

impl From<Arc<MultiEnvironment>> for Change {
    fn from(env: Arc<MultiEnvironment>) -> Self {
        Self::Environment(env)
    }
}

/// Contract shared by all environments.
pub trait Environment: Send + Sync + fmt::Debug {
    /// Name, unique within the parent composite.
    fn name(&self) -> &str;

    /// Snapshot of the current state.
    fn state(&self) -> EnvironmentState;

    /// Accepts a candidate change and notifies observers.
    fn add_change(&self, change: Change) -> SignalResult<()>;

    /// The event capability of this environment.
    fn events(&self) -> &Emitter;

    /// The composite this environment was added to, if it is still alive.
    fn parent(&self) -> Option<Arc<MultiEnvironment>>;

    /// Installs the weak back-reference to a composite.
    fn set_parent(&self, parent: Weak<MultiEnvironment>);

    /// Releases periodic work owned by the environment. Idempotent.
    fn exit(&self);
}

/// Pieces every environment carries.
#[derive(Debug)]
pub(crate) struct EnvironmentCore {
    pub(crate) name: String,
    pub(crate) parent: RwLock<Weak<MultiEnvironment>>,
    pub(crate) events: Emitter,
}

impl EnvironmentCore {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            parent: RwLock::new(Weak::new()),
            events: Emitter::new(),
        }
    }

    pub(crate) fn parent(&self) -> Option<Arc<MultiEnvironment>> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Weak<MultiEnvironment>) {
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = parent;
    }

    pub(crate) fn emit_changed(&self, old: EnvironmentState, new: EnvironmentState) {
        self.events.emit(&Event::Changed {
            environment: self.name.clone(),
            old,
            new,
        });
    }
}

/// An environment holding one opaque value.
pub struct BasicEnvironment {
    core: EnvironmentCore,
    self_ref: Weak<BasicEnvironment>,
    state: Mutex<Value>,
    poller: Mutex<Option<Interval>>,
    exited: AtomicBool,
}

impl fmt::Debug for BasicEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicEnvironment")
            .field("name", &self.core.name)
            .field("state", &*self.state.lock().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

impl BasicEnvironment {
    /// An environment whose state starts as `Null`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_state(name, Value::Null)
    }

    #[must_use]
    pub fn with_state(name: impl Into<String>, state: impl Into<Value>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: EnvironmentCore::new(name.into()),
            self_ref: Weak::clone(self_ref),
            state: Mutex::new(state.into()),
            poller: Mutex::new(None),
            exited: AtomicBool::new(false),
        })
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> Value {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Samples `sampler` every `period` and pushes the result in as a change.
    ///
    /// The period is raised to the configured floor. With `max_runs` the
    /// polling stops after that many samples. Replaces any earlier poller.
    pub fn poll<F>(
        &self,
        cfg: &EngineConfig,
        scheduler: SchedulerHandle,
        period: Duration,
        max_runs: Option<u64>,
        sampler: F,
    ) -> SignalResult<()>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let period = cfg.clamp_poll_interval(period);
        let environment = Weak::clone(&self.self_ref);
        let interval = Interval::start(self.core.name.clone(), period, max_runs, scheduler, move || {
            if let Some(environment) = environment.upgrade() {
                // Basic environments accept every value.
                let _ = environment.add_change(Change::Value(sampler()));
            }
        })?;
        info!(environment = %self.core.name, period_ms = period.as_millis() as u64, "environment polling started");

        let previous = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(interval);
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.exited.store(false, Ordering::Release);
        Ok(())
    }

    /// True while a poller is running.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Interval::is_active)
    }

    fn replace(&self, new: Value) {
        let old = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, new.clone())
        };
        debug!(environment = %self.core.name, %old, %new, "environment state replaced");
        self.core
            .emit_changed(EnvironmentState::Value(old), EnvironmentState::Value(new));
    }
}

impl Environment for BasicEnvironment {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn state(&self) -> EnvironmentState {
        EnvironmentState::Value(self.value())
    }

    fn add_change(&self, change: Change) -> SignalResult<()> {
        match change {
            Change::Value(v) => self.replace(v),
            Change::Environment(other) => {
                debug!(environment = %self.core.name, from = %other.name(), "adopting state of environment");
                self.replace(other.state().to_value());
            }
        }
        Ok(())
    }

    fn events(&self) -> &Emitter {
        &self.core.events
    }

    fn parent(&self) -> Option<Arc<MultiEnvironment>> {
        self.core.parent()
    }

    fn set_parent(&self, parent: Weak<MultiEnvironment>) {
        self.core.set_parent(parent);
    }

    fn exit(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            poller.cancel();
        }
        info!(environment = %self.core.name, "environment exited");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::EventKind;
    use crate::scheduler::Scheduler;

    #[test]
    fn add_change_replaces_state_and_notifies() {
        let env = BasicEnvironment::new("room");
        let stream = env.events().stream(EventKind::Changed, 4);

        env.add_change(Change::Value(Value::Int(3))).unwrap();

        assert_eq!(env.value(), Value::Int(3));
        let Some(Event::Changed { environment, old, new }) = stream.try_recv() else {
            panic!("expected changed event");
        };
        assert_eq!(environment, "room");
        assert_eq!(old, EnvironmentState::Value(Value::Null));
        assert_eq!(new, EnvironmentState::Value(Value::Int(3)));
    }

    #[test]
    fn adding_an_environment_adopts_its_state() {
        let env = BasicEnvironment::new("room");
        let other = BasicEnvironment::with_state("sensor", "on");
        env.add_change(other.into()).unwrap();
        assert_eq!(env.value(), Value::from("on"));
    }

    #[test]
    fn composite_state_renders_as_object() {
        let a = BasicEnvironment::with_state("a", 1);
        let b = BasicEnvironment::with_state("b", "x");
        let multi = MultiEnvironment::drain_from(
            "house",
            &mut vec![Change::from(a), Change::from(b)],
        )
        .unwrap();
        assert_eq!(
            multi.state().to_value(),
            Value::from(json!({"a": 1, "b": "x"}))
        );
    }

    #[test]
    fn polling_pushes_samples_and_exit_stops_it() {
        let cfg = EngineConfig {
            min_poll_interval_ms: 1,
            ..EngineConfig::default()
        };
        let scheduler = Scheduler::new(&cfg);
        let env = BasicEnvironment::new("system");
        env.poll(&cfg, scheduler.handle(), Duration::from_millis(2), Some(2), || {
            Value::from(json!({"freemem": 42}))
        })
        .unwrap();

        let started = std::time::Instant::now();
        while env.value().is_null() && started.elapsed() < Duration::from_secs(5) {
            scheduler.run_for(Duration::from_millis(10));
        }
        assert_eq!(env.value().lookup(&["freemem"]), Some(Value::Int(42)));

        env.exit();
        env.exit();
        assert!(!env.is_polling());
    }

    #[test]
    fn exit_without_polling_is_harmless() {
        let env = BasicEnvironment::new("idle");
        env.exit();
        env.exit();
        assert!(!env.is_polling());
    }
}
