//! Composite environments.
//!
//! A [`MultiEnvironment`] turns a sequence of environments into a mapping
//! keyed by child name and keeps that mapping free of cycles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, Weak};

use tracing::{debug, info, warn};

use crate::error::{SignalError, SignalResult, ValidationError};
use crate::events::{Emitter, Event};
use crate::value::Value;

use super::{Change, Environment, EnvironmentCore, EnvironmentState, SubEnvironments};

/// Initial state handed to a composite.
#[derive(Debug, Clone)]
pub enum InitialState {
    /// Sequence of sub-environments.
    Sequence(Vec<Change>),
    /// A lone element where a sequence was required; always rejected.
    Single(Change),
}

/// Construction parameters for [`MultiEnvironment`].
#[derive(Debug, Clone, Default)]
pub struct MultiEnvironmentParams {
    /// Initial children; `None` builds an empty composite.
    pub state: Option<InitialState>,
}

impl MultiEnvironmentParams {
    #[must_use]
    pub fn with_state(state: Vec<Change>) -> Self {
        Self {
            state: Some(InitialState::Sequence(state)),
        }
    }
}

/// An environment whose state is a name-keyed set of sub-environments.
///
/// Environment changes install a child (last write wins on a name clash).
/// Any other value is a foreign signal: it is reported through
/// `IgnoredChange` and forwarded to every child.
pub struct MultiEnvironment {
    core: EnvironmentCore,
    self_ref: Weak<MultiEnvironment>,
    children: RwLock<SubEnvironments>,
    exited: AtomicBool,
}

impl fmt::Debug for MultiEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiEnvironment")
            .field("name", &self.core.name)
            .field("children", &self.names())
            .finish()
    }
}

impl MultiEnvironment {
    /// Builds a composite, optionally from an initial sequence.
    ///
    /// Parameters without a state are accepted with a warning.
    pub fn new(name: impl Into<String>, params: Option<MultiEnvironmentParams>) -> SignalResult<Arc<Self>> {
        let name = name.into();
        let Some(params) = params else {
            return Ok(Self::empty(name));
        };
        match params.state {
            None => {
                warn!(
                    environment = %name,
                    "MultiEnvironment created with parameters but no initial state, proceeding"
                );
                Ok(Self::empty(name))
            }
            Some(InitialState::Single(change)) => Err(ValidationError::StateNotSequence {
                found: change.type_name().to_string(),
            }
            .into()),
            Some(InitialState::Sequence(mut state)) => Self::drain_from(name, &mut state),
        }
    }

    /// Validates `state`, then drains it into a new composite.
    ///
    /// On success `state` is left empty. On failure it is left untouched and
    /// no composite is built.
    pub fn drain_from(name: impl Into<String>, state: &mut Vec<Change>) -> SignalResult<Arc<Self>> {
        let name = name.into();
        info!(environment = %name, elements = state.len(), "validating environment initial state");
        validate_state(state)?;

        let composite = Self::empty(name);
        composite.convert_state(state)?;
        Ok(composite)
    }

    fn empty(name: String) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: EnvironmentCore::new(name),
            self_ref: Weak::clone(self_ref),
            children: RwLock::new(SubEnvironments::new()),
            exited: AtomicBool::new(false),
        })
    }

    fn convert_state(&self, state: &mut Vec<Change>) -> SignalResult<()> {
        debug!(environment = %self.core.name, "converting initial state to dictionary");
        for change in state.drain(..) {
            if let Change::Environment(env) = change {
                let child = env.name().to_string();
                self.add_sub_environment(env)?;
                if !self.read_children().contains_key(&child) {
                    return Err(ValidationError::Conciliation { name: child }.into());
                }
            }
        }
        Ok(())
    }

    /// Installs `sub` under its name and points its parent reference here.
    ///
    /// Fails with `CyclicComposition` if this composite is `sub` itself or
    /// lies anywhere inside `sub`.
    pub fn add_sub_environment(&self, sub: Arc<dyn Environment>) -> SignalResult<()> {
        if self.reachable_from(&sub) {
            warn!(environment = %self.core.name, child = %sub.name(), "refusing cyclic composition");
            return Err(ValidationError::CyclicComposition {
                name: sub.name().to_string(),
            }
            .into());
        }
        sub.set_parent(Weak::clone(&self.self_ref));
        let name = sub.name().to_string();
        let (old, new) = {
            let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
            let old = children.clone();
            if children.insert(name.clone(), sub).is_some() {
                debug!(environment = %self.core.name, child = %name, "sub-environment replaced");
            }
            (old, children.clone())
        };
        debug!(environment = %self.core.name, child = %name, "sub-environment added");
        self.core
            .emit_changed(EnvironmentState::Composite(old), EnvironmentState::Composite(new));
        Ok(())
    }

    /// True if `root` is this composite or has it somewhere below.
    fn reachable_from(&self, root: &Arc<dyn Environment>) -> bool {
        let me = std::ptr::from_ref(self).cast::<()>();
        let mut pending = vec![Arc::clone(root)];
        while let Some(node) = pending.pop() {
            if Arc::as_ptr(&node).cast::<()>() == me {
                return true;
            }
            if let EnvironmentState::Composite(children) = node.state() {
                pending.extend(children.into_values());
            }
        }
        false
    }

    /// Looks up a direct child. Absent names yield `None`.
    #[must_use]
    pub fn sub_environment(&self, name: &str) -> Option<Arc<dyn Environment>> {
        self.read_children().get(name).cloned()
    }

    /// Child names in iteration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.read_children().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read_children().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_children().is_empty()
    }

    /// Reports a foreign value and forwards it to every child once.
    ///
    /// Every child is visited even if one fails; the first failure is returned.
    fn propagate_to_sub_environments(&self, value: Value) -> SignalResult<()> {
        let children = self.read_children().clone();
        warn!(
            environment = %self.core.name,
            value = %value,
            "change is not an environment, propagating to sub-environments"
        );
        self.core.events.emit(&Event::IgnoredChange {
            environment: self.core.name.clone(),
            state: EnvironmentState::Composite(children.clone()),
            value: value.clone(),
        });

        let mut first_error: Option<SignalError> = None;
        for child in children.values() {
            if let Err(e) = child.add_change(Change::Value(value.clone())) {
                warn!(environment = %self.core.name, child = %child.name(), error = %e, "sub-environment rejected change");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn read_children(&self) -> RwLockReadGuard<'_, SubEnvironments> {
        self.children.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_state(state: &[Change]) -> Result<(), ValidationError> {
    for (index, change) in state.iter().enumerate() {
        if let Change::Value(v) = change {
            return Err(ValidationError::NotAnEnvironment {
                index,
                found: v.type_name().to_string(),
            });
        }
    }
    Ok(())
}

impl Environment for MultiEnvironment {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn state(&self) -> EnvironmentState {
        EnvironmentState::Composite(self.read_children().clone())
    }

    fn add_change(&self, change: Change) -> SignalResult<()> {
        match change {
            Change::Environment(sub) => self.add_sub_environment(sub),
            Change::Value(value) => self.propagate_to_sub_environments(value),
        }
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

    /// Exits every child, then the composite itself.
    fn exit(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = self.read_children().clone();
        for child in children.values() {
            child.exit();
        }
        info!(environment = %self.core.name, "composite environment exited");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::environment::BasicEnvironment;
    use crate::events::EventKind;

    /// Environment that counts the changes it receives.
    #[derive(Debug)]
    struct Counting {
        core: EnvironmentCore,
        received: Mutex<Vec<Change>>,
        fail: bool,
    }

    impl Counting {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                core: EnvironmentCore::new(name.to_string()),
                received: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    impl Environment for Counting {
        fn name(&self) -> &str {
            &self.core.name
        }

        fn state(&self) -> EnvironmentState {
            EnvironmentState::Value(Value::Int(self.count() as i64))
        }

        fn add_change(&self, change: Change) -> SignalResult<()> {
            self.received.lock().unwrap().push(change);
            if self.fail {
                return Err(SignalError::internal("refused"));
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

        fn exit(&self) {}
    }

    #[test]
    fn sequence_is_drained_into_mapping() {
        let a = BasicEnvironment::new("x");
        let b = BasicEnvironment::new("y");
        let mut state = vec![Change::from(Arc::clone(&a)), Change::from(b)];

        let multi = MultiEnvironment::drain_from("house", &mut state).unwrap();

        assert!(state.is_empty());
        assert_eq!(multi.names(), vec!["x".to_string(), "y".to_string()]);
        let found = multi.sub_environment("x").unwrap();
        assert_eq!(found.name(), "x");
        let parent = a.parent().unwrap();
        assert!(Arc::ptr_eq(&parent, &multi));
    }

    #[test]
    fn non_environment_element_is_rejected_and_sequence_kept() {
        let mut state = vec![
            Change::from(BasicEnvironment::new("x")),
            Change::Value(Value::Int(4)),
        ];
        let err = MultiEnvironment::drain_from("house", &mut state).unwrap_err();
        assert!(matches!(
            err,
            SignalError::Validation(ValidationError::NotAnEnvironment { index: 1, .. })
        ));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn single_state_is_rejected() {
        let params = MultiEnvironmentParams {
            state: Some(InitialState::Single(Change::from(BasicEnvironment::new("x")))),
        };
        let err = MultiEnvironment::new("house", Some(params)).unwrap_err();
        assert!(matches!(
            err,
            SignalError::Validation(ValidationError::StateNotSequence { .. })
        ));
    }

    #[test]
    fn params_without_state_build_empty_composite() {
        let multi = MultiEnvironment::new("house", Some(MultiEnvironmentParams::default())).unwrap();
        assert!(multi.is_empty());
        let multi = MultiEnvironment::new("house", None).unwrap();
        assert_eq!(multi.len(), 0);
    }

    #[test]
    fn same_name_last_write_wins() {
        let first = BasicEnvironment::with_state("x", 1);
        let second = BasicEnvironment::with_state("x", 2);
        let multi = MultiEnvironment::new("house", None).unwrap();
        multi.add_change(first.into()).unwrap();
        multi.add_change(second.into()).unwrap();
        assert_eq!(multi.len(), 1);
        let child = multi.sub_environment("x").unwrap();
        assert_eq!(child.state().to_value(), Value::Int(2));
    }

    #[test]
    fn adding_sub_environment_notifies_with_full_mapping() {
        let multi = MultiEnvironment::new("house", None).unwrap();
        let stream = multi.events().stream(EventKind::Changed, 4);
        multi.add_change(BasicEnvironment::new("x").into()).unwrap();
        multi.add_change(BasicEnvironment::new("y").into()).unwrap();

        let events = stream.drain();
        assert_eq!(events.len(), 2);
        let Event::Changed { old, new, .. } = &events[1] else {
            panic!("expected changed event");
        };
        assert_eq!(old.as_composite().map(|c| c.len()), Some(1));
        assert_eq!(new.as_composite().map(|c| c.len()), Some(2));
    }

    #[test]
    fn foreign_value_is_reported_once_and_broadcast() {
        let a = Counting::new("a", false);
        let b = Counting::new("b", false);
        let multi = MultiEnvironment::new("house", None).unwrap();
        multi.add_change(Change::Environment(a.clone())).unwrap();
        multi.add_change(Change::Environment(b.clone())).unwrap();
        let before = multi.names();
        let ignored = multi.events().stream(EventKind::IgnoredChange, 4);

        multi.add_change(Change::Value(Value::from("boom"))).unwrap();

        assert_eq!(multi.names(), before);
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
        let events = ignored.drain();
        assert_eq!(events.len(), 1);
        let Event::IgnoredChange { state, value, .. } = &events[0] else {
            panic!("expected ignored change");
        };
        assert_eq!(value, &Value::from("boom"));
        assert_eq!(state.as_composite().map(|c| c.len()), Some(2));
    }

    #[test]
    fn failing_child_does_not_stop_broadcast() {
        let bad = Counting::new("a", true);
        let good = Counting::new("b", false);
        let multi = MultiEnvironment::new("house", None).unwrap();
        multi.add_change(Change::Environment(bad.clone())).unwrap();
        multi.add_change(Change::Environment(good.clone())).unwrap();

        let err = multi.add_change(Change::Value(Value::Int(1))).unwrap_err();
        assert!(err.is_internal());
        assert_eq!(bad.count(), 1);
        assert_eq!(good.count(), 1);
    }

    #[test]
    fn missing_sub_environment_is_none() {
        let multi = MultiEnvironment::new("house", None).unwrap();
        assert!(multi.sub_environment("nope").is_none());
    }

    #[test]
    fn nested_composites_forward_foreign_values_to_leaves() {
        let leaf = BasicEnvironment::new("leaf");
        let inner = MultiEnvironment::drain_from("floor", &mut vec![Change::from(Arc::clone(&leaf))]).unwrap();
        let outer = MultiEnvironment::drain_from("house", &mut vec![Change::from(Arc::clone(&inner))]).unwrap();

        outer.add_change(Change::Value(Value::Int(9))).unwrap();

        assert_eq!(leaf.value(), Value::Int(9));
        assert!(Arc::ptr_eq(&inner.parent().unwrap(), &outer));
        assert!(Arc::ptr_eq(&leaf.parent().unwrap(), &inner));
    }

    #[test]
    fn exit_reaches_children_and_is_idempotent() {
        let cfg = crate::config::EngineConfig {
            min_poll_interval_ms: 1,
            ..crate::config::EngineConfig::default()
        };
        let scheduler = crate::scheduler::Scheduler::new(&cfg);
        let child = BasicEnvironment::with_state("x", 3);
        child
            .poll(&cfg, scheduler.handle(), std::time::Duration::from_millis(5), None, || Value::Int(1))
            .unwrap();
        let multi = MultiEnvironment::new("house", None).unwrap();
        multi.add_change(Change::from(Arc::clone(&child))).unwrap();
        assert!(child.is_polling());

        multi.exit();
        assert!(!child.is_polling());
        let names = multi.names();
        multi.exit();
        assert!(!child.is_polling());
        assert_eq!(multi.names(), names);
    }

    #[test]
    fn composite_cannot_contain_itself() {
        let multi = MultiEnvironment::new("house", None).unwrap();
        let err = multi.add_change(Change::from(Arc::clone(&multi))).unwrap_err();
        assert!(matches!(
            err,
            SignalError::Validation(ValidationError::CyclicComposition { ref name }) if name == "house"
        ));
        assert!(multi.is_empty());
        assert_eq!(Arc::strong_count(&multi), 1);
    }

    #[test]
    fn composite_cannot_adopt_an_ancestor() {
        let a = MultiEnvironment::new("a", None).unwrap();
        let b = MultiEnvironment::new("b", None).unwrap();
        let c = MultiEnvironment::new("c", None).unwrap();
        a.add_change(Change::from(Arc::clone(&b))).unwrap();
        b.add_change(Change::from(Arc::clone(&c))).unwrap();

        let direct = b.add_change(Change::from(Arc::clone(&a))).unwrap_err();
        let nested = c.add_change(Change::from(Arc::clone(&a))).unwrap_err();
        assert!(matches!(direct, SignalError::Validation(ValidationError::CyclicComposition { .. })));
        assert!(matches!(nested, SignalError::Validation(ValidationError::CyclicComposition { .. })));
        assert_eq!(Arc::strong_count(&a), 1);

        // Broadcast still terminates.
        a.add_change(Change::Value(Value::Int(1))).unwrap();
    }

    #[test]
    fn shared_child_under_two_composites_is_not_a_cycle() {
        let leaf = BasicEnvironment::new("leaf");
        let left = MultiEnvironment::new("left", None).unwrap();
        let right = MultiEnvironment::new("right", None).unwrap();
        left.add_change(Change::from(Arc::clone(&leaf))).unwrap();
        right.add_change(Change::from(Arc::clone(&leaf))).unwrap();
        left.add_change(Change::from(Arc::clone(&right))).unwrap();
        assert_eq!(left.len(), 2);
    }
}
