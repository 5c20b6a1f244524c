//! Built-in filter library.
//!
//! Every filter here is stateless apart from its operand and target, so one
//! instance can be bound to any number of detectors.

use std::cmp::Ordering;

use regex::Regex;
use tracing::debug;

use crate::detector::{DetectorInfo, SignalSource};
use crate::error::{SignalResult, ValidationError};
use crate::value::Value;

use super::{Filter, FilterParams, FilterTarget, Verdict};

/// Blocks everything.
#[derive(Debug, Clone, Default)]
pub struct BlockAllFilter {
    params: FilterParams,
}

impl BlockAllFilter {
    #[must_use]
    pub fn new(target: FilterTarget) -> Self {
        Self {
            params: FilterParams::new(Value::Null, target),
        }
    }
}

impl Filter for BlockAllFilter {
    fn kind(&self) -> &'static str {
        "block_all"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, _candidate: &Value, _source: &SignalSource, _detector: &DetectorInfo) -> Verdict {
        Verdict::Block
    }
}

/// Blocks signals from a detector with the given name.
#[derive(Debug, Clone)]
pub struct NameFilter {
    params: FilterParams,
}

impl NameFilter {
    #[must_use]
    pub fn new(detector_name: impl Into<String>, target: FilterTarget) -> Self {
        Self {
            params: FilterParams::new(Value::String(detector_name.into()), target),
        }
    }
}

impl Filter for NameFilter {
    fn kind(&self) -> &'static str {
        "name"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, _candidate: &Value, _source: &SignalSource, detector: &DetectorInfo) -> Verdict {
        if self.params.value_to_filter.as_string() == Some(detector.name.as_str()) {
            Verdict::Block
        } else {
            Verdict::Pass
        }
    }
}

/// Blocks signals equal to the operand. Numbers compare by magnitude.
#[derive(Debug, Clone)]
pub struct ValueFilter {
    params: FilterParams,
}

impl ValueFilter {
    #[must_use]
    pub fn new(value: impl Into<Value>, target: FilterTarget) -> Self {
        Self {
            params: FilterParams::new(value, target),
        }
    }
}

impl Filter for ValueFilter {
    fn kind(&self) -> &'static str {
        "value"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, candidate: &Value, _source: &SignalSource, _detector: &DetectorInfo) -> Verdict {
        if candidate.loosely_eq(&self.params.value_to_filter) {
            Verdict::Block
        } else {
            Verdict::Pass
        }
    }
}

/// Blocks numeric signals below the operand. Non-numeric signals pass.
#[derive(Debug, Clone)]
pub struct HighPassFilter {
    params: FilterParams,
}

impl HighPassFilter {
    #[must_use]
    pub fn new(threshold: impl Into<Value>, target: FilterTarget) -> Self {
        Self {
            params: FilterParams::new(threshold, target),
        }
    }
}

impl Filter for HighPassFilter {
    fn kind(&self) -> &'static str {
        "high_pass"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, candidate: &Value, _source: &SignalSource, _detector: &DetectorInfo) -> Verdict {
        match candidate.numeric_cmp(&self.params.value_to_filter) {
            Some(Ordering::Less) => Verdict::Block,
            _ => Verdict::Pass,
        }
    }
}

/// Blocks numeric signals above the operand. Non-numeric signals pass.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    params: FilterParams,
}

impl LowPassFilter {
    #[must_use]
    pub fn new(threshold: impl Into<Value>, target: FilterTarget) -> Self {
        Self {
            params: FilterParams::new(threshold, target),
        }
    }
}

impl Filter for LowPassFilter {
    fn kind(&self) -> &'static str {
        "low_pass"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, candidate: &Value, _source: &SignalSource, _detector: &DetectorInfo) -> Verdict {
        match candidate.numeric_cmp(&self.params.value_to_filter) {
            Some(Ordering::Greater) => Verdict::Block,
            _ => Verdict::Pass,
        }
    }
}

/// Blocks structured signals whose value at `key` equals the operand.
///
/// Signals without the key pass. Matching a message header such as
/// `["headers", "destination"]` against a notifier's own output channel is
/// how a detector ignores the echo of a notifier bound to it.
#[derive(Debug, Clone)]
pub struct KeyValueFilter {
    params: FilterParams,
    key: Vec<String>,
}

impl KeyValueFilter {
    pub fn new<S: Into<String>>(
        key: impl IntoIterator<Item = S>,
        value: impl Into<Value>,
        target: FilterTarget,
    ) -> SignalResult<Self> {
        let key: Vec<String> = key.into_iter().map(Into::into).collect();
        if key.is_empty() {
            return Err(ValidationError::MissingArgument {
                field: "key".to_string(),
            }
            .into());
        }
        Ok(Self {
            params: FilterParams::new(value, target),
            key,
        })
    }

    #[must_use]
    pub fn key(&self) -> &[String] {
        &self.key
    }
}

impl Filter for KeyValueFilter {
    fn kind(&self) -> &'static str {
        "key_value"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, candidate: &Value, _source: &SignalSource, _detector: &DetectorInfo) -> Verdict {
        match candidate.lookup(self.key.as_slice()) {
            Some(found) if found.loosely_eq(&self.params.value_to_filter) => Verdict::Block,
            _ => Verdict::Pass,
        }
    }
}

/// Passes only signals whose text matches a regular expression.
///
/// The text is the candidate itself, or the string found at a key path when
/// one is set. Anything without matching text is blocked.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    params: FilterParams,
    key: Vec<String>,
    regex: Regex,
    environments_only: bool,
}

impl PatternFilter {
    pub fn new(pattern: &str, target: FilterTarget) -> SignalResult<Self> {
        let regex = Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            params: FilterParams::new(pattern, target),
            key: Vec::new(),
            regex,
            environments_only: false,
        })
    }

    /// Match the string at `key` instead of the whole candidate.
    #[must_use]
    pub fn at_key<S: Into<String>>(mut self, key: impl IntoIterator<Item = S>) -> Self {
        self.key = key.into_iter().map(Into::into).collect();
        self
    }

    /// Let signals that do not come from an environment through unchecked.
    #[must_use]
    pub const fn environments_only(mut self) -> Self {
        self.environments_only = true;
        self
    }

    fn text(&self, candidate: &Value) -> Option<String> {
        if self.key.is_empty() {
            return candidate.as_string().map(str::to_string);
        }
        candidate
            .lookup(self.key.as_slice())
            .and_then(|v| v.as_string().map(str::to_string))
    }
}

impl Filter for PatternFilter {
    fn kind(&self) -> &'static str {
        "pattern"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, candidate: &Value, source: &SignalSource, _detector: &DetectorInfo) -> Verdict {
        if self.environments_only && source.environment().is_none() {
            return Verdict::Pass;
        }
        match self.text(candidate) {
            Some(text) if self.regex.is_match(&text) => Verdict::Pass,
            _ => Verdict::Block,
        }
    }
}

/// Blocks signals that come from environments.
///
/// With a name operand only that environment is blocked; with `Null` every
/// environment is. Signals pushed by stimulus sources or sent directly pass.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    params: FilterParams,
}

impl SourceFilter {
    /// Blocks every environment-originated signal.
    #[must_use]
    pub fn any_environment(target: FilterTarget) -> Self {
        Self {
            params: FilterParams::new(Value::Null, target),
        }
    }

    /// Blocks signals from the named environment.
    #[must_use]
    pub fn environment(name: impl Into<String>, target: FilterTarget) -> Self {
        Self {
            params: FilterParams::new(Value::String(name.into()), target),
        }
    }
}

impl Filter for SourceFilter {
    fn kind(&self) -> &'static str {
        "source"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, _candidate: &Value, source: &SignalSource, _detector: &DetectorInfo) -> Verdict {
        let SignalSource::Environment(name) = source else {
            return Verdict::Pass;
        };
        match &self.params.value_to_filter {
            Value::Null => Verdict::Block,
            Value::String(blocked) if blocked == name => Verdict::Block,
            _ => Verdict::Pass,
        }
    }
}

/// Lets environment samples through only when they are interesting.
///
/// A structured sample passes if the number at `threshold_key` is below the
/// operand, or if the string at `pattern_key` matches the pattern. Any other
/// sample is blocked. Signals that do not come from an environment are not
/// this filter's concern and pass untouched.
#[derive(Debug, Clone)]
pub struct EnvironmentStateFilter {
    params: FilterParams,
    threshold_key: Vec<String>,
    pattern: Option<(Vec<String>, Regex)>,
}

impl EnvironmentStateFilter {
    /// `threshold_key` is compared against `below`.
    #[must_use]
    pub fn new<S: Into<String>>(
        threshold_key: impl IntoIterator<Item = S>,
        below: impl Into<Value>,
        target: FilterTarget,
    ) -> Self {
        Self {
            params: FilterParams::new(below, target),
            threshold_key: threshold_key.into_iter().map(Into::into).collect(),
            pattern: None,
        }
    }

    /// Also pass samples whose string at `key` matches `pattern`.
    pub fn with_pattern<S: Into<String>>(
        mut self,
        key: impl IntoIterator<Item = S>,
        pattern: &str,
    ) -> SignalResult<Self> {
        let regex = Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.pattern = Some((key.into_iter().map(Into::into).collect(), regex));
        Ok(self)
    }

    fn below_threshold(&self, sample: &Value) -> bool {
        sample
            .lookup(self.threshold_key.as_slice())
            .and_then(|v| v.numeric_cmp(&self.params.value_to_filter))
            == Some(Ordering::Less)
    }

    fn matches_pattern(&self, sample: &Value) -> bool {
        let Some((key, regex)) = &self.pattern else {
            return false;
        };
        sample
            .lookup(key.as_slice())
            .as_ref()
            .and_then(Value::as_string)
            .is_some_and(|text| regex.is_match(text))
    }
}

impl Filter for EnvironmentStateFilter {
    fn kind(&self) -> &'static str {
        "environment_state"
    }

    fn params(&self) -> &FilterParams {
        &self.params
    }

    fn filter(&self, candidate: &Value, source: &SignalSource, detector: &DetectorInfo) -> Verdict {
        let SignalSource::Environment(environment) = source else {
            debug!(detector = %detector.name, "signal not from an environment, ignoring filter");
            return Verdict::Pass;
        };
        if self.below_threshold(candidate) || self.matches_pattern(candidate) {
            Verdict::Pass
        } else {
            debug!(detector = %detector.name, environment = %environment, "environment sample filtered out");
            Verdict::Block
        }
    }
}
