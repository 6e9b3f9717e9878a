//! Event bus fan-out into recorders, the tracing logger and Prometheus counters

use crate::helpers::*;
use pretty_assertions::assert_eq;
use resilience_core::{handler_fn, EventBus, EventFilter, EventKind, PatternType};
use resilience_patterns::{
    BasicLoadShedder, BasicLoadShedderConfig, Bulkhead, CircuitBreaker, CircuitBreakerConfig,
    LoadShedder, Priority,
};
use resilience_telemetry::{attach_logger, EventMetrics};
use std::sync::Arc;

fn breaker_on(bus: &Arc<EventBus>, threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "payments",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            ..Default::default()
        },
    )
    .expect("valid breaker config")
    .with_event_bus(bus.clone())
}

#[tokio::test]
async fn test_breaker_events_reach_every_subscriber() {
    let bus = EventBus::shared();
    let metrics = EventMetrics::new().expect("registers");
    metrics.attach(&bus);
    attach_logger(&bus);
    let recorded = record_events(&bus);

    let breaker = breaker_on(&bus, 2);
    let service = FlakyService::failing(u32::MAX);
    for _ in 0..3 {
        let _ = breaker.call(|| service.call()).await;
    }

    assert_eq!(service.calls(), 2);
    assert_eq!(
        metrics.event_count("circuit_breaker", "payments", EventKind::CallFailure),
        2
    );
    assert_eq!(
        metrics.event_count("circuit_breaker", "payments", EventKind::StateChange),
        1
    );

    let transitions: Vec<_> = recorded
        .lock()
        .iter()
        .filter(|e| e.kind == EventKind::StateChange)
        .filter_map(|e| e.get("new_state").and_then(|v| v.as_str()).map(String::from))
        .collect();
    assert_eq!(transitions, vec!["open".to_string()]);
}

#[tokio::test]
async fn test_failing_handler_never_reaches_caller() {
    let bus = EventBus::shared();
    bus.on(
        EventFilter::Any,
        handler_fn(|_| Err("subscriber crashed".into())),
    );
    let recorded = record_events(&bus);

    let bulkhead = Bulkhead::with_defaults("db").with_event_bus(bus.clone());
    let value = bulkhead
        .execute(|| async { Ok::<_, ServiceError>(7) })
        .await
        .expect("handler errors are isolated");

    assert_eq!(value, 7);
    assert!(recorded
        .lock()
        .iter()
        .any(|e| e.kind == EventKind::SlotAcquired && e.pattern_type == PatternType::Bulkhead));
}

#[tokio::test]
async fn test_shutdown_bus_stops_counting() {
    let bus = EventBus::shared();
    let metrics = EventMetrics::new().expect("registers");
    metrics.attach(&bus);

    let shedder = BasicLoadShedder::new(
        "api",
        BasicLoadShedderConfig {
            max_requests: 1,
            ..Default::default()
        },
    )
    .expect("valid shedder config")
    .with_event_bus(bus.clone());

    shedder.acquire(Priority::Normal).await.expect("admitted");
    assert!(shedder.acquire(Priority::High).await.is_err());
    assert_eq!(metrics.rejection_count("load_shedder", "api"), 1);

    let text = metrics.gather_text().expect("encodes");
    assert!(text.contains("resilience_rejections_total"));
    assert!(text.contains("pattern_name=\"api\""));

    bus.shutdown();
    assert!(shedder.acquire(Priority::High).await.is_err());
    assert_eq!(metrics.rejection_count("load_shedder", "api"), 1);
}
