//! # signalgraph - signal propagation and filtering for ambient automation
//!
//! Environments hold state, detectors turn stimuli into discrete signals,
//! filters gate and rewrite those signals, and notifiers deliver accepted
//! signals to external sinks.
//!
//! ## Core Concepts
//!
//! - **Environment**: a named piece of observed state; [`MultiEnvironment`]
//!   composes sub-environments and re-broadcasts foreign values to them
//! - **Detector**: runs an ordered filter chain per signal and emits
//!   `Detected` or `Skipped`
//! - **Filter**: a shared predicate/transform bound to detectors by target
//! - **Notifier**: forwards every accepted signal through a [`Transport`]
//!   and reports the outcome as `Delivered`
//! - **Scheduler**: the cooperative queue every deferred step runs on
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use signalgraph::{ChannelTransport, Detector, Notifier, Scheduler, SignalGraph};
//!
//! let scheduler = Scheduler::default();
//! let (transport, deliveries) = ChannelTransport::pair(16);
//!
//! let mut graph = SignalGraph::new(None);
//! graph.add_detector(Detector::new("pir"));
//! graph.add_notifier(Notifier::new("log", Arc::new(transport), scheduler.handle()));
//!
//! graph.detector("pir").unwrap().send("motion");
//! scheduler.run_until_idle();
//! assert_eq!(deliveries.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Values, errors and configuration
pub mod config;
pub mod error;
pub mod value;

// Runtime plumbing
pub mod events;
pub mod scheduler;

// Components
pub mod detector;
pub mod environment;
pub mod filter;
pub mod graph;
pub mod notifier;

pub use config::EngineConfig;
pub use detector::{Detector, DetectorId, DetectorInfo, Intake, Outcome, PollingSource, SignalSource, StimulusSource};
pub use environment::{
    BasicEnvironment, Change, Environment, EnvironmentState, InitialState, MultiEnvironment,
    MultiEnvironmentParams, SubEnvironments,
};
pub use error::{DeliveryError, ExecutionError, SignalError, SignalResult, ValidationError};
pub use events::{Emitter, Event, EventKind, EventStream, SubscriptionId};
pub use filter::{
    bind_to_detectors, BlockAllFilter, EnvironmentStateFilter, Filter, FilterParams, FilterTarget,
    HighPassFilter, KeyValueFilter, LowPassFilter, NameFilter, PassAllFilter, PatternFilter, SourceFilter,
    ValueFilter, Verdict,
};
pub use graph::SignalGraph;
pub use notifier::{
    ChannelTransport, DeliveryReport, DeliveryRequest, FnTransport, Notifier, NotifierBuilder, NotifierId,
    NotifierInfo, Transform, Transport,
};
pub use scheduler::{Interval, RunReport, Scheduler, SchedulerHandle};
pub use value::Value;
