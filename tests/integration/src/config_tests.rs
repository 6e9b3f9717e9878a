//! Settings files driving a full primitive stack

use crate::helpers::*;
use pretty_assertions::assert_eq;
use resilience_config::{ResilienceSettings, SettingsError};
use resilience_core::{EventBus, EventKind};
use resilience_patterns::compose::{with_breaker, with_bulkhead};
use resilience_patterns::CircuitState;
use resilience_telemetry::EventMetrics;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const SETTINGS_YAML: &str = r#"
circuit_breakers:
  inventory:
    failure_threshold: 1
    recovery_timeout: 10s
bulkheads:
  inventory:
    max_concurrent: 2
    max_waiting: 0
backpressure:
  ingest:
    max_pending: 4
    high_water_mark: 3
    low_water_mark: 1
rates:
  public: "5/second"
telemetry:
  enabled: false
"#;

fn settings_file(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp file");
    file.write_all(content.as_bytes()).expect("write settings");
    file
}

#[tokio::test]
async fn test_stack_built_from_settings_file() {
    let file = settings_file(SETTINGS_YAML, ".yaml");
    let settings = ResilienceSettings::from_file(file.path()).expect("settings load");
    assert!(!settings.init_telemetry().expect("disabled telemetry"));

    let bus = EventBus::shared();
    let metrics = EventMetrics::new().expect("registers");
    metrics.attach(&bus);

    let registry = settings.build_registry(Some(bus.clone())).expect("registry");
    let breaker = registry.get("inventory").expect("configured breaker");
    assert_eq!(breaker.config().recovery_timeout, Duration::from_secs(10));

    let bulkhead = Arc::new(
        settings
            .build_bulkhead("inventory")
            .expect("configured bulkhead")
            .with_event_bus(bus.clone()),
    );

    let service = FlakyService::failing(1);
    let svc = service.clone();
    let call = with_breaker(
        breaker.clone(),
        with_bulkhead(bulkhead, move || {
            let svc = svc.clone();
            async move { svc.call().await }
        }),
    );

    assert!(call().await.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(call().await.is_err());
    assert_eq!(service.calls(), 1);
    assert_eq!(
        metrics.event_count("circuit_breaker", "inventory", EventKind::StateChange),
        1
    );
    assert_eq!(
        metrics.event_count("bulkhead", "inventory", EventKind::SlotAcquired),
        1
    );
}

#[tokio::test]
async fn test_backpressure_from_settings_raises_signal() {
    let settings = ResilienceSettings::from_yaml_str(SETTINGS_YAML).expect("valid settings");
    let manager = settings.build_backpressure("ingest").expect("configured manager");
    let mut signal = manager.subscribe();

    for _ in 0..3 {
        manager.acquire().await.expect("below ceiling");
    }
    assert!(manager.is_active());
    assert!(*signal.borrow_and_update());

    manager.release().await;
    assert!(manager.is_active());
    manager.release().await;
    assert!(!manager.is_active());
}

#[test]
fn test_toml_and_yaml_agree() {
    let toml = r#"
[circuit_breakers.inventory]
failure_threshold = 1
recovery_timeout = "10s"

[bulkheads.inventory]
max_concurrent = 2
max_waiting = 0

[backpressure.ingest]
max_pending = 4
high_water_mark = 3
low_water_mark = 1

[rates]
public = "5/second"

[telemetry]
enabled = false
"#;
    let from_toml = ResilienceSettings::from_toml_str(toml).expect("valid toml");
    let from_yaml = ResilienceSettings::from_yaml_str(SETTINGS_YAML).expect("valid yaml");
    assert_eq!(from_toml, from_yaml);
}

#[test]
fn test_invalid_file_reports_entry() {
    let file = settings_file(
        "[adaptive_concurrency.api]\nmin_limit = 50\nmax_limit = 10\ninitial_limit = 20\n",
        ".toml",
    );
    let err = ResilienceSettings::from_file(file.path()).expect_err("min above max");
    assert!(matches!(
        err,
        SettingsError::Invalid {
            section: "adaptive_concurrency",
            ..
        }
    ));
    assert_eq!(err.entry(), Some(("adaptive_concurrency", "api")));
}
