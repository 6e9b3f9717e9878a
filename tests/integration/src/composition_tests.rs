//! Stacks of primitives built with the composition helpers

use crate::helpers::*;
use pretty_assertions::assert_eq;
use resilience_core::{BulkheadReason, ResilienceError, TimeoutReason};
use resilience_patterns::compose::{with_breaker, with_bulkhead, with_retry, with_timeout};
use resilience_patterns::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, FallbackChain,
    RetryPolicyBuilder, TimeoutConfig, TimeoutManager,
};
use std::sync::Arc;
use std::time::Duration;

fn quick_retry(attempts: u32) -> Arc<resilience_patterns::RetryPolicy> {
    Arc::new(
        RetryPolicyBuilder::new("downstream")
            .max_attempts(attempts)
            .initial_delay(Duration::from_millis(10))
            .jitter(0.0)
            .build()
            .expect("valid retry config"),
    )
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_through_closed_breaker() {
    let service = FlakyService::failing(2);
    let breaker = Arc::new(
        CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig {
                failure_threshold: 5,
                ..Default::default()
            },
        )
        .expect("valid breaker config"),
    );

    let svc = service.clone();
    let guarded = with_breaker(breaker.clone(), move || {
        let svc = svc.clone();
        async move { svc.call().await }
    });
    let call = with_retry(quick_retry(3), guarded);

    assert_eq!(call().await.expect("third attempt succeeds"), 3);
    assert_eq!(service.calls(), 3);

    let metrics = breaker.metrics();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.failed_requests, 2);
    assert_eq!(metrics.successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_stops_hammering_once_breaker_opens() {
    let service = FlakyService::failing(u32::MAX);
    let breaker = Arc::new(
        CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        )
        .expect("valid breaker config"),
    );

    let svc = service.clone();
    let guarded = with_breaker(breaker.clone(), move || {
        let svc = svc.clone();
        async move { svc.call().await }
    });
    let call = with_retry(quick_retry(4), guarded);

    let err = call().await.expect_err("never recovers");
    match err {
        ResilienceError::RetryExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 4);
            assert!(matches!(last, ResilienceError::CircuitOpen { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(service.calls(), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_bulkhead_slot_freed_after_inner_timeout() {
    let bulkhead = Arc::new(
        Bulkhead::new(
            "db",
            BulkheadConfig {
                max_concurrent: 1,
                max_waiting: 0,
                timeout: None,
            },
        )
        .expect("valid bulkhead config"),
    );
    let timeout = Arc::new(
        TimeoutManager::new(
            "db",
            TimeoutConfig {
                timeout: Duration::from_secs(1),
            },
        )
        .expect("valid timeout config"),
    );

    let slow = with_timeout(timeout, || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, ServiceError>(())
    });
    let call = with_bulkhead(bulkhead.clone(), slow);

    let first = tokio::spawn(call());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let rejected = call().await.expect_err("single slot is taken");
    assert!(matches!(
        rejected,
        ResilienceError::BulkheadRejected {
            reason: BulkheadReason::QueueFull | BulkheadReason::CapacityFull,
            ..
        }
    ));

    let timed_out = first.await.expect("task joins").expect_err("inner timeout");
    assert!(matches!(
        timed_out,
        ResilienceError::Operation(ResilienceError::Timeout {
            reason: TimeoutReason::TimeoutExceeded,
            ..
        })
    ));
    assert_eq!(bulkhead.available_slots(), 1);
    assert_eq!(bulkhead.metrics().failed_requests, 1);
}

#[tokio::test]
async fn test_fallback_serves_stale_value_when_breaker_is_open() {
    let breaker = CircuitBreaker::with_defaults("catalog");
    breaker.force_open().await;

    let chain = FallbackChain::<(), String>::new("catalog").with_value("cached".to_string());
    let value = chain
        .execute((), |()| {
            breaker.call(|| async { Ok::<_, ServiceError>("fresh".to_string()) })
        })
        .await
        .expect("fallback value");

    assert_eq!(value, "cached");
    assert_eq!(breaker.metrics().rejected_requests, 1);
    assert_eq!(chain.metrics().fallback_executions, 1);
}
