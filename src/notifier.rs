//! Notifiers forward accepted signals to external sinks.
//!
//! A notifier subscribes to the `Detected` events of any number of detectors.
//! Each accepted signal posts one delivery to the scheduler, so the detector
//! never waits on, or hears back from, the sink. Every delivery ends in
//! exactly one `Delivered` event; sink failures and panics are recorded in
//! the [`DeliveryReport`] and never propagate further.
//!
//! # Feedback loops
//!
//! There is no cycle detection. If a notifier's sink feeds back into the
//! stimulus of a detector the notifier is bound to, every delivery triggers
//! another detection and the scheduler queue never drains. Break the loop by
//! not binding the notifier back, or by giving the detector a filter that
//! blocks the echoed signal, typically a [`crate::filter::KeyValueFilter`]
//! on the destination the notifier stamps on its payload.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::detector::{Detector, DetectorInfo};
use crate::error::{DeliveryError, SignalResult, ValidationError};
use crate::events::{Emitter, Event, EventKind, SubscriptionId};
use crate::scheduler::SchedulerHandle;
use crate::value::Value;

/// Unique identifier for a notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotifierId(Uuid);

impl NotifierId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotifierId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a notifier as carried in delivery reports.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotifierInfo {
    pub id: NotifierId,
    pub name: String,
}

/// What a transport is asked to deliver.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub message: String,
    pub old_state: Option<Value>,
    pub new_state: Value,
    pub detector: Option<DetectorInfo>,
    pub environment: Option<String>,
    pub notifier: NotifierInfo,
}

/// Snapshot of one finished delivery, successful or not.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub message: String,
    pub old_state: Option<Value>,
    /// The value that was to be delivered; kept even when delivery failed.
    pub new_state: Value,
    pub detector: Option<DetectorInfo>,
    pub environment: Option<String>,
    pub notifier: NotifierInfo,
    /// Whatever the sink answered, if anything.
    pub response: Option<Value>,
    pub error: Option<DeliveryError>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReport {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// The external delivery mechanism behind a notifier.
pub trait Transport: Send + Sync {
    /// Performs the side effect. `Ok(Some(_))` carries the sink's reply.
    fn deliver(&self, request: &DeliveryRequest) -> Result<Option<Value>, DeliveryError>;
}

/// Rewrites the payload before it reaches the transport.
pub trait Transform: Send + Sync {
    /// Returns the payload handed to the transport in place of `new_state`.
    fn transform(&self, request: &DeliveryRequest) -> Result<Value, DeliveryError>;
}

impl<F> Transform for F
where
    F: Fn(&DeliveryRequest) -> Result<Value, DeliveryError> + Send + Sync,
{
    fn transform(&self, request: &DeliveryRequest) -> Result<Value, DeliveryError> {
        self(request)
    }
}

/// Transport backed by a closure.
pub struct FnTransport<F> {
    deliver: F,
}

impl<F> fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").finish_non_exhaustive()
    }
}

impl<F> FnTransport<F>
where
    F: Fn(&DeliveryRequest) -> Result<Option<Value>, DeliveryError> + Send + Sync,
{
    #[must_use]
    pub const fn new(deliver: F) -> Self {
        Self { deliver }
    }
}

impl<F> Transport for FnTransport<F>
where
    F: Fn(&DeliveryRequest) -> Result<Option<Value>, DeliveryError> + Send + Sync,
{
    fn deliver(&self, request: &DeliveryRequest) -> Result<Option<Value>, DeliveryError> {
        (self.deliver)(request)
    }
}

/// Publishes requests into a bounded in-process queue.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: Sender<DeliveryRequest>,
}

impl ChannelTransport {
    /// A transport and the receiving end of its queue.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Receiver<DeliveryRequest>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn deliver(&self, request: &DeliveryRequest) -> Result<Option<Value>, DeliveryError> {
        match self.tx.try_send(request.clone()) {
            Ok(()) => Ok(None),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Rejected {
                message: "queue full".to_string(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(DeliveryError::Unreachable {
                message: "queue receiver dropped".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct NotifierState {
    last_message: Option<String>,
    last_delivery: Option<DeliveryReport>,
}

/// A sink bound to one or more detectors.
pub struct Notifier {
    info: NotifierInfo,
    self_ref: Weak<Notifier>,
    transport: Arc<dyn Transport>,
    transform: Option<Arc<dyn Transform>>,
    scheduler: SchedulerHandle,
    prefix: String,
    state: Mutex<NotifierState>,
    bindings: Mutex<Vec<(Emitter, SubscriptionId)>>,
    events: Emitter,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("name", &self.info.name)
            .field("transform", &self.transform.is_some())
            .field("bindings", &self.lock_bindings().len())
            .finish()
    }
}

/// Builder for [`Notifier`].
#[derive(Default)]
pub struct NotifierBuilder {
    name: String,
    transport: Option<Arc<dyn Transport>>,
    transform: Option<Arc<dyn Transform>>,
    scheduler: Option<SchedulerHandle>,
    prefix: String,
}

impl fmt::Debug for NotifierBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierBuilder")
            .field("name", &self.name)
            .field("transport", &self.transport.is_some())
            .field("scheduler", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

impl NotifierBuilder {
    /// Sink the notifier delivers to. Required.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Payload rewrite run before the transport.
    #[must_use]
    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Scheduler deliveries are posted to. Required.
    #[must_use]
    pub fn scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Takes the message prefix from `cfg`.
    #[must_use]
    pub fn config(mut self, cfg: &EngineConfig) -> Self {
        self.prefix.clone_from(&cfg.notification_prefix);
        self
    }

    /// Text placed before the detector name in messages.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Fails with `MissingArgument` if the transport or scheduler is unset.
    pub fn build(self) -> SignalResult<Arc<Notifier>> {
        let transport = self.transport.ok_or_else(|| ValidationError::MissingArgument {
            field: "transport".to_string(),
        })?;
        let scheduler = self.scheduler.ok_or_else(|| ValidationError::MissingArgument {
            field: "scheduler".to_string(),
        })?;
        Ok(Notifier::assemble(self.name, transport, self.transform, scheduler, self.prefix))
    }
}

impl Notifier {
    #[must_use]
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, scheduler: SchedulerHandle) -> Arc<Self> {
        Self::assemble(name.into(), transport, None, scheduler, String::new())
    }

    #[must_use]
    pub fn builder(name: impl Into<String>) -> NotifierBuilder {
        NotifierBuilder {
            name: name.into(),
            ..NotifierBuilder::default()
        }
    }

    fn assemble(
        name: String,
        transport: Arc<dyn Transport>,
        transform: Option<Arc<dyn Transform>>,
        scheduler: SchedulerHandle,
        prefix: String,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            info: NotifierInfo {
                id: NotifierId::new(),
                name,
            },
            self_ref: Weak::clone(self_ref),
            transport,
            transform,
            scheduler,
            prefix,
            state: Mutex::new(NotifierState::default()),
            bindings: Mutex::new(Vec::new()),
            events: Emitter::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    #[must_use]
    pub const fn id(&self) -> NotifierId {
        self.info.id
    }

    #[must_use]
    pub const fn info(&self) -> &NotifierInfo {
        &self.info
    }

    #[must_use]
    pub const fn events(&self) -> &Emitter {
        &self.events
    }

    #[must_use]
    pub fn last_message(&self) -> Option<String> {
        self.lock_state().last_message.clone()
    }

    #[must_use]
    pub fn last_delivery(&self) -> Option<DeliveryReport> {
        self.lock_state().last_delivery.clone()
    }

    /// Number of detectors currently bound.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.lock_bindings().len()
    }

    /// Delivers every signal `detector` accepts from now on.
    ///
    /// Binding the same detector twice delivers each signal twice.
    pub fn bind_to_detector(&self, detector: &Detector) -> SubscriptionId {
        let notifier = Weak::clone(&self.self_ref);
        let scheduler = self.scheduler.clone();
        let id = detector.events().subscribe(EventKind::Detected, move |event| {
            let Event::Detected {
                prior,
                value,
                detector,
                source,
            } = event
            else {
                return;
            };
            let Some(target) = notifier.upgrade() else {
                return;
            };
            let message = target.message_for(&detector.name);
            let (prior, value, detector) = (prior.clone(), value.clone(), detector.clone());
            let environment = source.environment().map(str::to_string);
            let posted = scheduler.post(move || {
                target.notify(message, prior, value, environment, Some(detector));
            });
            if !posted {
                warn!("scheduler gone, delivery dropped");
            }
        });
        self.lock_bindings().push((detector.events().clone(), id));
        info!(notifier = %self.info.name, detector = %detector.name(), "notifier bound to detector");
        id
    }

    /// Drops every detector binding. Returns how many were removed.
    pub fn unbind_all(&self) -> usize {
        let bindings = std::mem::take(&mut *self.lock_bindings());
        let count = bindings.len();
        for (emitter, id) in bindings {
            emitter.unsubscribe(id);
        }
        debug!(notifier = %self.info.name, count, "notifier unbound");
        count
    }

    /// Runs one delivery and reports it through `Delivered`.
    ///
    /// Never fails: transform and transport errors, panics included, end up
    /// in the report's `error`. When the transform fails the transport still
    /// runs, with `{"error": "<message>"}` as its payload, so a reply sink
    /// hears about the failure.
    pub fn notify(
        &self,
        message: impl Into<String>,
        old_state: Option<Value>,
        new_state: Value,
        environment: Option<String>,
        detector: Option<DetectorInfo>,
    ) -> DeliveryReport {
        let mut request = DeliveryRequest {
            message: message.into(),
            old_state,
            new_state,
            detector,
            environment,
            notifier: self.info.clone(),
        };
        let new_state = request.new_state.clone();
        self.lock_state().last_message = Some(request.message.clone());

        let (response, error) = match self.run_transform(&request) {
            Ok(payload) => {
                if let Some(payload) = payload {
                    request.new_state = payload;
                }
                match guarded(|| self.transport.deliver(&request)) {
                    Ok(response) => (response, None),
                    Err(e) => {
                        warn!(notifier = %self.info.name, error = %e, "delivery failed");
                        (None, Some(e))
                    }
                }
            }
            Err(e) => {
                warn!(notifier = %self.info.name, error = %e, "transform failed, forwarding the error");
                request.new_state = Value::from(serde_json::json!({ "error": e.to_string() }));
                let response = guarded(|| self.transport.deliver(&request)).unwrap_or_else(|sink| {
                    warn!(notifier = %self.info.name, error = %sink, "error payload not delivered");
                    None
                });
                (response, Some(e))
            }
        };
        let report = DeliveryReport {
            message: request.message,
            old_state: request.old_state,
            new_state,
            detector: request.detector,
            environment: request.environment,
            notifier: request.notifier,
            response,
            error,
            delivered_at: Utc::now(),
        };
        debug!(notifier = %self.info.name, success = report.is_success(), "delivery finished");

        self.lock_state().last_delivery = Some(report.clone());
        self.events.emit(&Event::Delivered(report.clone()));
        report
    }

    fn run_transform(&self, request: &DeliveryRequest) -> Result<Option<Value>, DeliveryError> {
        let Some(transform) = &self.transform else {
            return Ok(None);
        };
        guarded(|| transform.transform(request))
            .map(Some)
            .map_err(|e| match e {
                DeliveryError::Panicked { .. } | DeliveryError::Transform { .. } => e,
                other => DeliveryError::Transform {
                    message: other.to_string(),
                },
            })
    }

    fn message_for(&self, detector: &str) -> String {
        format!("{}'{detector}' detected something.", self.prefix)
    }

    fn lock_state(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_bindings(&self) -> MutexGuard<'_, Vec<(Emitter, SubscriptionId)>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let bindings = std::mem::take(self.bindings.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (emitter, id) in bindings {
            emitter.unsubscribe(id);
        }
    }
}

fn guarded<T>(f: impl FnOnce() -> Result<T, DeliveryError>) -> Result<T, DeliveryError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(DeliveryError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
