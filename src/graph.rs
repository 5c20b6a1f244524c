//! Wiring of one environment, its detectors, filters and notifiers.
//!
//! The graph only owns the bindings. Signals still flow through the
//! components' own event emitters and the scheduler.

use std::sync::Arc;

use tracing::{debug, info};

use crate::detector::Detector;
use crate::environment::Environment;
use crate::error::SignalResult;
use crate::filter::{bind_to_detectors, Filter, FilterTarget};
use crate::notifier::Notifier;
use crate::scheduler::SchedulerHandle;

/// A managed set of components around one root environment.
///
/// Order of registration does not matter: a detector added after a notifier
/// or filter still gets bound to it.
#[derive(Debug, Default)]
pub struct SignalGraph {
    environment: Option<Arc<dyn Environment>>,
    detectors: Vec<Arc<Detector>>,
    notifiers: Vec<Arc<Notifier>>,
    filters: Vec<Arc<dyn Filter>>,
    exited: bool,
}

impl SignalGraph {
    #[must_use]
    pub fn new(environment: Option<Arc<dyn Environment>>) -> Self {
        Self {
            environment,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn environment(&self) -> Option<&Arc<dyn Environment>> {
        self.environment.as_ref()
    }

    #[must_use]
    pub fn detectors(&self) -> &[Arc<Detector>] {
        &self.detectors
    }

    #[must_use]
    pub fn notifiers(&self) -> &[Arc<Notifier>] {
        &self.notifiers
    }

    /// First detector registered under `name`.
    #[must_use]
    pub fn detector(&self, name: &str) -> Option<Arc<Detector>> {
        self.detectors.iter().find(|d| d.name() == name).cloned()
    }

    /// Registers a detector and wires it to everything already present.
    ///
    /// The detector watches the root environment, every notifier binds to
    /// it, and every stored filter whose target selects it is applied in
    /// the order the filters were added.
    pub fn add_detector(&mut self, detector: Arc<Detector>) {
        if let Some(environment) = &self.environment {
            detector.watch(environment.as_ref());
        }
        for notifier in &self.notifiers {
            notifier.bind_to_detector(&detector);
        }
        let single = [Arc::clone(&detector)];
        for filter in &self.filters {
            // Instance targets were bound when the filter was added.
            if matches!(filter.target(), FilterTarget::Instance(_)) {
                continue;
            }
            bind_to_detectors(filter, &single);
        }
        info!(detector = %detector.name(), total = self.detectors.len() + 1, "detector added");
        self.detectors.push(detector);
    }

    /// Registers a notifier and binds it to every current detector.
    pub fn add_notifier(&mut self, notifier: Arc<Notifier>) {
        for detector in &self.detectors {
            notifier.bind_to_detector(detector);
        }
        info!(notifier = %notifier.name(), detectors = self.detectors.len(), "notifier added");
        self.notifiers.push(notifier);
    }

    /// Binds `filter` to the current detectors its target selects.
    ///
    /// Returns the number of detectors bound now. Detectors added later are
    /// bound as they arrive.
    pub fn add_filter(&mut self, filter: Arc<dyn Filter>) -> usize {
        let bound = bind_to_detectors(&filter, &self.detectors);
        self.filters.push(filter);
        bound
    }

    /// Starts every detector's stimulus source.
    pub fn start_monitoring(&self, scheduler: &SchedulerHandle) -> SignalResult<()> {
        for detector in &self.detectors {
            detector.start_monitoring(scheduler)?;
        }
        debug!(detectors = self.detectors.len(), "graph monitoring");
        Ok(())
    }

    /// Exits the environment and every detector, and unbinds notifiers.
    ///
    /// Calling it again does nothing.
    pub fn exit(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;
        for detector in &self.detectors {
            detector.exit();
        }
        for notifier in &self.notifiers {
            notifier.unbind_all();
        }
        if let Some(environment) = &self.environment {
            environment.exit();
        }
        info!("signal graph exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{BasicEnvironment, Change};
    use crate::events::EventKind;
    use crate::filter::{BlockAllFilter, ValueFilter};
    use crate::notifier::ChannelTransport;
    use crate::scheduler::Scheduler;
    use crate::value::Value;

    #[test]
    fn late_detector_gets_existing_notifier_and_filters() {
        let scheduler = Scheduler::default();
        let (transport, rx) = ChannelTransport::pair(8);
        let mut graph = SignalGraph::new(None);
        graph.add_notifier(Notifier::new("n", Arc::new(transport), scheduler.handle()));
        graph.add_filter(Arc::new(ValueFilter::new(13, FilterTarget::ByName("pir".into()))));

        let pir = Detector::new("pir");
        let other = Detector::new("other");
        graph.add_detector(Arc::clone(&pir));
        graph.add_detector(Arc::clone(&other));

        assert_eq!(pir.filters().len(), 1);
        assert_eq!(other.filters().len(), 0);
        assert!(!pir.send(13).is_accepted());
        assert!(pir.send(1).is_accepted());
        scheduler.run_until_idle();
        assert_eq!(rx.try_recv().unwrap().new_state, Value::Int(1));
    }

    #[test]
    fn instance_filter_is_not_reapplied_to_new_detectors() {
        let mut graph = SignalGraph::new(None);
        let first = Detector::new("a");
        graph.add_detector(Arc::clone(&first));
        graph.add_filter(Arc::new(BlockAllFilter::new(FilterTarget::instance(&first))));
        let second = Detector::new("b");
        graph.add_detector(Arc::clone(&second));

        assert_eq!(first.filters().len(), 1);
        assert!(second.filters().is_empty());
    }

    #[test]
    fn environment_changes_reach_detectors() {
        let env = BasicEnvironment::new("room");
        let mut graph = SignalGraph::new(Some(env.clone()));
        let d = Detector::new("temp");
        graph.add_detector(Arc::clone(&d));

        env.add_change(Change::Value(Value::Float(21.5))).unwrap();
        assert_eq!(d.current_state(), Some(Value::Float(21.5)));
        assert!(graph.detector("temp").is_some());
        assert!(graph.detector("missing").is_none());
    }

    #[test]
    fn exit_is_idempotent_and_releases_bindings() {
        let scheduler = Scheduler::default();
        let env = BasicEnvironment::new("room");
        let mut graph = SignalGraph::new(Some(env.clone()));
        let (transport, _rx) = ChannelTransport::pair(1);
        graph.add_notifier(Notifier::new("n", Arc::new(transport), scheduler.handle()));
        let d = Detector::new("d");
        graph.add_detector(Arc::clone(&d));
        graph.start_monitoring(&scheduler.handle()).unwrap();

        graph.exit();
        graph.exit();

        assert!(!d.is_monitoring());
        assert_eq!(d.events().listener_count(EventKind::Detected), 0);
        assert_eq!(env.events().listener_count(EventKind::Changed), 0);
    }
}
