use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use signalgraph::{
    BasicEnvironment, Change, Detector, EngineConfig, Environment, EnvironmentStateFilter, Event, EventKind,
    FilterTarget, InitialState, MultiEnvironment, MultiEnvironmentParams, Scheduler, SignalGraph, SignalSource,
    SourceFilter, ValidationError, Value,
};

fn house() -> (Arc<MultiEnvironment>, Arc<BasicEnvironment>, Arc<BasicEnvironment>) {
    let kitchen = BasicEnvironment::with_state("kitchen", 19);
    let garage = BasicEnvironment::with_state("garage", 12);
    let params = MultiEnvironmentParams::with_state(vec![
        Change::from(Arc::clone(&kitchen)),
        Change::from(Arc::clone(&garage)),
    ]);
    let house = MultiEnvironment::new("house", Some(params)).unwrap();
    (house, kitchen, garage)
}

#[test]
fn composite_is_keyed_by_child_name() {
    let (house, kitchen, _garage) = house();

    assert_eq!(house.names(), vec!["garage".to_string(), "kitchen".to_string()]);
    let found = house.sub_environment("kitchen").unwrap();
    assert_eq!(found.state().to_value(), Value::Int(19));
    assert!(Arc::ptr_eq(&kitchen.parent().unwrap(), &house));
    assert_eq!(house.state().to_value(), Value::from(json!({ "garage": 12, "kitchen": 19 })));
}

#[test]
fn mixed_sequence_is_rejected_with_index() {
    let params = MultiEnvironmentParams {
        state: Some(InitialState::Sequence(vec![
            Change::from(BasicEnvironment::new("a")),
            Change::from(BasicEnvironment::new("b")),
            Change::Value(Value::from("oops")),
        ])),
    };
    let err = MultiEnvironment::new("house", Some(params)).unwrap_err();

    match err {
        signalgraph::SignalError::Validation(ValidationError::NotAnEnvironment { index, found }) => {
            assert_eq!(index, 2);
            assert_eq!(found, "string");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn broadcast_reaches_detectors_watching_children() {
    let (house, kitchen, garage) = house();
    let kitchen_detector = Detector::new("kitchen-temp");
    let garage_detector = Detector::new("garage-temp");
    kitchen_detector.watch(kitchen.as_ref());
    garage_detector.watch(garage.as_ref());
    let ignored = house.events().stream(EventKind::IgnoredChange, 4);
    let before = house.names();

    house.add_change(Change::Value(Value::Int(5))).unwrap();

    assert_eq!(house.names(), before);
    assert_eq!(ignored.drain().len(), 1);
    assert_eq!(kitchen_detector.current_state(), Some(Value::Int(5)));
    assert_eq!(garage_detector.current_state(), Some(Value::Int(5)));
}

#[test]
fn detector_on_composite_sees_new_children() {
    let (house, _kitchen, _garage) = house();
    let mut graph = SignalGraph::new(Some(house.clone()));
    let d = Detector::new("layout");
    graph.add_detector(Arc::clone(&d));
    let detected = d.events().stream(EventKind::Detected, 4);

    house.add_change(BasicEnvironment::with_state("attic", 30).into()).unwrap();

    let Some(Event::Detected { value, source, .. }) = detected.try_recv() else {
        panic!("expected detected event");
    };
    assert_eq!(source, SignalSource::Environment("house".to_string()));
    assert_eq!(value.lookup(&["attic"]), Some(Value::Int(30)));
    assert_eq!(value.lookup(&["kitchen"]), Some(Value::Int(19)));
}

#[test]
fn environment_state_filter_lets_only_interesting_samples_through() {
    let env = BasicEnvironment::new("host");
    let d = Detector::new("memory");
    d.watch(env.as_ref());
    d.apply_filter(Arc::new(
        EnvironmentStateFilter::new(["freemem"], 100, FilterTarget::All)
            .with_pattern(["status"], "^(degraded|down)$")
            .unwrap(),
    ));

    env.add_change(Change::Value(Value::from(json!({ "freemem": 500, "status": "ok" }))))
        .unwrap();
    assert_eq!(d.current_state(), None);

    env.add_change(Change::Value(Value::from(json!({ "freemem": 50, "status": "ok" }))))
        .unwrap();
    assert_eq!(d.current_state().and_then(|v| v.lookup(&["freemem"])), Some(Value::Int(50)));

    env.add_change(Change::Value(Value::from(json!({ "freemem": 900, "status": "down" }))))
        .unwrap();
    assert_eq!(d.current_state().and_then(|v| v.lookup(&["status"])), Some(Value::from("down")));

    assert!(d.send(json!({ "freemem": 900 })).is_accepted());
}

#[test]
fn source_filter_separates_environment_signals() {
    let env = BasicEnvironment::new("porch");
    let d = Detector::new("porch-light");
    d.watch(env.as_ref());
    d.apply_filter(Arc::new(SourceFilter::environment("porch", FilterTarget::All)));

    env.add_change(Change::Value(Value::Bool(true))).unwrap();
    assert_eq!(d.current_state(), None);
    assert!(d.send(false).is_accepted());
}

#[test]
fn polling_environment_feeds_watching_detector() {
    let cfg = EngineConfig {
        min_poll_interval_ms: 1,
        ..EngineConfig::default()
    };
    let scheduler = Scheduler::new(&cfg);
    let env = BasicEnvironment::new("sensor");
    let d = Detector::new("reader");
    d.watch(env.as_ref());
    let counter = Arc::new(AtomicI64::new(0));
    let sampled = Arc::clone(&counter);
    env.poll(&cfg, scheduler.handle(), Duration::from_millis(2), Some(3), move || {
        Value::Int(sampled.fetch_add(1, Ordering::SeqCst))
    })
    .unwrap();

    let started = Instant::now();
    while d.current_state() != Some(Value::Int(2)) && started.elapsed() < Duration::from_secs(5) {
        scheduler.run_for(Duration::from_millis(10));
    }
    assert_eq!(d.current_state(), Some(Value::Int(2)));
    assert_eq!(env.value(), Value::Int(2));

    env.exit();
    env.exit();
    assert!(!env.is_polling());
}

#[test]
fn polling_with_no_runs_leaves_state_alone() {
    let cfg = EngineConfig {
        min_poll_interval_ms: 1,
        ..EngineConfig::default()
    };
    let scheduler = Scheduler::new(&cfg);
    let env = BasicEnvironment::with_state("sensor", 5);
    let d = Detector::new("reader");
    d.watch(env.as_ref());
    env.poll(&cfg, scheduler.handle(), Duration::from_millis(1), Some(0), || Value::Int(99))
        .unwrap();

    scheduler.run_for(Duration::from_millis(50));

    assert!(!env.is_polling());
    assert_eq!(env.value(), Value::Int(5));
    assert_eq!(d.current_state(), None);
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn composite_exit_stops_child_pollers() {
    let cfg = EngineConfig {
        min_poll_interval_ms: 1,
        ..EngineConfig::default()
    };
    let scheduler = Scheduler::new(&cfg);
    let (house, kitchen, _garage) = house();
    kitchen
        .poll(&cfg, scheduler.handle(), Duration::from_millis(5), None, || Value::Int(1))
        .unwrap();
    assert!(kitchen.is_polling());

    house.exit();
    house.exit();

    assert!(!kitchen.is_polling());
}
