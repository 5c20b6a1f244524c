//! Filters gate and transform signals on their way through a detector.
//!
//! A filter is stateless and can be shared by many detectors. Detectors run
//! their filters in registration order; the first [`Verdict::Block`] stops
//! the chain.

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use crate::detector::{Detector, DetectorInfo, SignalSource};
use crate::value::Value;

pub mod builtin;

pub use builtin::{
    BlockAllFilter, EnvironmentStateFilter, HighPassFilter, KeyValueFilter, LowPassFilter,
    NameFilter, PatternFilter, SourceFilter, ValueFilter,
};

/// Outcome of one filter on one candidate signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Let the candidate through unchanged.
    Pass,
    /// Let a substituted value through.
    Replace(Value),
    /// Stop propagation.
    Block,
}

/// Which detectors a filter attaches to.
#[derive(Clone)]
pub enum FilterTarget {
    /// Every detector offered.
    All,
    /// Every detector whose name is exactly this.
    ByName(String),
    /// Every detector whose name is in the list.
    ByNames(Vec<String>),
    /// One specific detector, regardless of the collection offered.
    Instance(Weak<Detector>),
}

impl fmt::Debug for FilterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::ByName(name) => f.debug_tuple("ByName").field(name).finish(),
            Self::ByNames(names) => f.debug_tuple("ByNames").field(names).finish(),
            Self::Instance(d) => match d.upgrade() {
                Some(d) => f.debug_tuple("Instance").field(&d.name()).finish(),
                None => write!(f, "Instance(<dropped>)"),
            },
        }
    }
}

impl Default for FilterTarget {
    fn default() -> Self {
        Self::All
    }
}

impl FilterTarget {
    /// Targets one detector directly.
    #[must_use]
    pub fn instance(detector: &Arc<Detector>) -> Self {
        Self::Instance(Arc::downgrade(detector))
    }

    /// Picks the detectors this target selects out of `detectors`.
    #[must_use]
    pub fn select(&self, detectors: &[Arc<Detector>]) -> Vec<Arc<Detector>> {
        match self {
            Self::All => detectors.to_vec(),
            Self::ByName(name) => detectors
                .iter()
                .filter(|d| d.name() == name)
                .cloned()
                .collect(),
            Self::ByNames(names) => detectors
                .iter()
                .filter(|d| names.iter().any(|n| n == d.name()))
                .cloned()
                .collect(),
            Self::Instance(d) => d.upgrade().into_iter().collect(),
        }
    }
}

/// Operand and target shared by every filter.
#[derive(Debug, Clone, Default)]
pub struct FilterParams {
    /// Comparison operand; meaning depends on the filter.
    pub value_to_filter: Value,
    /// Detectors the filter binds to.
    pub target: FilterTarget,
}

impl FilterParams {
    #[must_use]
    pub fn new(value_to_filter: impl Into<Value>, target: FilterTarget) -> Self {
        Self {
            value_to_filter: value_to_filter.into(),
            target,
        }
    }
}

/// A predicate/transform applied to candidate signals.
///
/// Implementors override [`Filter::filter`] only; the default passes
/// everything through.
pub trait Filter: Send + Sync + fmt::Debug {
    /// Short type label used in logs.
    fn kind(&self) -> &'static str;

    /// Operand and target.
    fn params(&self) -> &FilterParams;

    /// Decides what happens to `candidate`.
    ///
    /// `candidate` is the output of the previous filter in the chain.
    fn filter(&self, candidate: &Value, source: &SignalSource, detector: &DetectorInfo) -> Verdict {
        let _ = (candidate, source, detector);
        Verdict::Pass
    }

    fn target(&self) -> &FilterTarget {
        &self.params().target
    }

    fn value_to_filter(&self) -> &Value {
        &self.params().value_to_filter
    }
}

/// The base filter: never blocks, never substitutes.
#[derive(Debug, Clone, Default)]
pub struct PassAllFilter {
    params: FilterParams,
}

impl PassAllFilter {
    #[must_use]
    pub fn new(target: FilterTarget) -> Self {
        Self {
            params: FilterParams::new(Value::Null, target),
        }
    }
}

impl Filter for PassAllFilter {
    fn kind(&self) -> &'static str {
        "pass_all"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }
}

/// Registers `filter` on the detectors its target selects.
///
/// Returns how many detectors it was registered on; zero is not an error.
pub fn bind_to_detectors(filter: &Arc<dyn Filter>, detectors: &[Arc<Detector>]) -> usize {
    let selected = filter.target().select(detectors);
    match filter.target() {
        FilterTarget::All => info!(filter = filter.kind(), "applying filter to all detectors"),
        target => info!(filter = filter.kind(), ?target, "applying filter to matching detectors"),
    }
    for detector in &selected {
        debug!(filter = filter.kind(), detector = %detector.name(), "filter bound");
        detector.apply_filter(Arc::clone(filter));
    }
    selected.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detectors(names: &[&str]) -> Vec<Arc<Detector>> {
        names.iter().map(|n| Detector::new(*n)).collect()
    }

    #[test]
    fn pass_all_never_blocks() {
        let f = PassAllFilter::default();
        let verdict = f.filter(&Value::Int(1), &SignalSource::Direct, &DetectorInfo::new("d"));
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn all_target_binds_everywhere() {
        let ds = detectors(&["a", "b", "c"]);
        let f: Arc<dyn Filter> = Arc::new(PassAllFilter::new(FilterTarget::All));
        assert_eq!(bind_to_detectors(&f, &ds), 3);
        assert!(ds.iter().all(|d| d.filters().len() == 1));
    }

    #[test]
    fn by_name_binds_exact_matches_only() {
        let ds = detectors(&["pir", "pir", "file", "pir2"]);
        let f: Arc<dyn Filter> = Arc::new(PassAllFilter::new(FilterTarget::ByName("pir".into())));
        assert_eq!(bind_to_detectors(&f, &ds), 2);
        assert_eq!(ds[3].filters().len(), 0);
    }

    #[test]
    fn by_names_uses_membership() {
        let ds = detectors(&["a", "b", "c"]);
        let target = FilterTarget::ByNames(vec!["a".into(), "c".into(), "zzz".into()]);
        let f: Arc<dyn Filter> = Arc::new(PassAllFilter::new(target));
        assert_eq!(bind_to_detectors(&f, &ds), 2);
        assert_eq!(ds[1].filters().len(), 0);
    }

    #[test]
    fn instance_target_ignores_collection() {
        let outside = Detector::new("outside");
        let ds = detectors(&["a"]);
        let f: Arc<dyn Filter> = Arc::new(PassAllFilter::new(FilterTarget::instance(&outside)));
        assert_eq!(bind_to_detectors(&f, &ds), 1);
        assert_eq!(outside.filters().len(), 1);
        assert_eq!(ds[0].filters().len(), 0);
    }

    #[test]
    fn unmatched_target_is_a_no_op() {
        let ds = detectors(&["a"]);
        let f: Arc<dyn Filter> = Arc::new(PassAllFilter::new(FilterTarget::ByName("nope".into())));
        assert_eq!(bind_to_detectors(&f, &ds), 0);

        let gone = {
            let d = Detector::new("gone");
            FilterTarget::instance(&d)
        };
        let f: Arc<dyn Filter> = Arc::new(PassAllFilter::new(gone));
        assert_eq!(bind_to_detectors(&f, &ds), 0);
    }
}
