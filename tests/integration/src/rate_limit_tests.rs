//! Rate limiting across limiter instances and through settings

use crate::helpers::*;
use pretty_assertions::assert_eq;
use resilience_core::{EventBus, EventKind, RateLimitReason, ResilienceError};
use resilience_ratelimit::{
    InMemorySortedSetStore, LocalRateLimiter, LocalRateLimiterConfig, Rate, RemoteRateLimiter,
    RemoteRateLimiterConfig, SortedSetStore,
};
use std::sync::Arc;

#[tokio::test]
async fn test_remote_window_is_shared_between_instances() {
    let store: Arc<dyn SortedSetStore> = Arc::new(InMemorySortedSetStore::new());
    let first = RemoteRateLimiter::new("api", RemoteRateLimiterConfig::default(), store.clone())
        .expect("valid config");
    let second = RemoteRateLimiter::new("api", RemoteRateLimiterConfig::default(), store)
        .expect("valid config");
    let rate: Rate = "3/minute".parse().expect("valid rate");

    let mut admitted = 0;
    for limiter in [&first, &second, &first, &second, &first] {
        if limiter.check("tenant-1", &rate).await {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 3);
    assert_eq!(first.remaining("tenant-1", &rate).await.expect("store up"), 0);
    assert!(second.check("tenant-2", &rate).await);
}

#[tokio::test]
async fn test_local_limiter_call_skips_operation_when_limited() {
    let bus = EventBus::shared();
    let recorded = record_events(&bus);
    let limiter = LocalRateLimiter::new("search", LocalRateLimiterConfig::default())
        .expect("valid config")
        .with_event_bus(bus.clone());
    let rate: Rate = "2/second".parse().expect("valid rate");
    let service = FlakyService::failing(0);

    for _ in 0..2 {
        limiter
            .call("user-1", &rate, || service.call())
            .await
            .expect("within the limit");
    }
    let err = limiter
        .call("user-1", &rate, || service.call())
        .await
        .expect_err("third call limited");

    assert!(matches!(
        err,
        ResilienceError::RateLimitExceeded {
            reason: RateLimitReason::RateLimitExceeded,
            ..
        }
    ));
    assert_eq!(service.calls(), 2);
    assert_eq!(limiter.metrics().total_rejected, 1);
    assert!(recorded
        .lock()
        .iter()
        .any(|e| e.kind == EventKind::RequestRejected));
}
