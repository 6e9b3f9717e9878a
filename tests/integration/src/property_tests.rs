//! Releases never drive counters below zero or past their ceilings, whether
//! steps run in sequence or race across tasks

use proptest::prelude::*;
use resilience_patterns::{
    AdaptiveConcurrencyConfig, AdaptiveConcurrencyLimiter, BackpressureConfig,
    BackpressureManager, BasicLoadShedder, BasicLoadShedderConfig, Bulkhead, BulkheadConfig,
    LoadProbe, LoadShedder, Priority, SystemLoadShedder, SystemLoadShedderConfig, SystemSample,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum Step {
    Acquire,
    Release,
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop_oneof![Just(Step::Acquire), Just(Step::Release)],
        0..64,
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
}

/// Step lists for several tasks racing on one primitive
fn interleavings() -> impl Strategy<Value = Vec<Vec<Step>>> {
    prop::collection::vec(steps(), 2..6)
}

fn threaded_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_time()
        .build()
        .expect("runtime")
}

/// Run one task per step list, each calling `step` and yielding in between
async fn race<P, F, Fut>(primitive: Arc<P>, plans: Vec<Vec<Step>>, step: F)
where
    P: Send + Sync + 'static,
    F: Fn(Arc<P>, Step) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let tasks = plans.into_iter().map(|plan| {
        let primitive = primitive.clone();
        let step = step.clone();
        tokio::spawn(async move {
            for s in plan {
                step(primitive.clone(), s).await;
                tokio::task::yield_now().await;
            }
        })
    });
    for outcome in futures::future::join_all(tasks).await {
        outcome.expect("task completes");
    }
}

struct IdleHost;

impl LoadProbe for IdleHost {
    fn sample(&self) -> SystemSample {
        SystemSample {
            cpu_percent: 5.0,
            memory_percent: 20.0,
        }
    }
}

/// Drive `shedder` through `steps`, checking it against a saturating counter
async fn check_shedder(shedder: &dyn LoadShedder, steps: &[Step], max: usize) {
    let mut model = 0usize;
    for step in steps {
        match step {
            Step::Acquire => {
                let admitted = shedder.acquire(Priority::Normal).await.is_ok();
                assert_eq!(admitted, model < max);
                if admitted {
                    model += 1;
                }
            }
            Step::Release => {
                shedder.release();
                model = model.saturating_sub(1);
            }
        }
        assert_eq!(shedder.metrics().active_requests, model);
    }
}

proptest! {
    #[test]
    fn prop_backpressure_release_is_idempotent(steps in steps()) {
        runtime().block_on(async {
            let manager = BackpressureManager::new(
                "prop",
                BackpressureConfig { max_pending: 6, high_water_mark: 4, low_water_mark: 1 },
            )
            .expect("valid config");

            let mut model = 0usize;
            for step in &steps {
                match step {
                    Step::Acquire => {
                        let admitted = manager.acquire().await.is_ok();
                        assert_eq!(admitted, model < 6);
                        if admitted {
                            model += 1;
                        }
                    }
                    Step::Release => {
                        manager.release().await;
                        model = model.saturating_sub(1);
                    }
                }
                assert_eq!(manager.pending(), model);
                if model >= 4 {
                    assert!(manager.is_active());
                }
                if model <= 1 {
                    assert!(!manager.is_active());
                }
            }
        });
    }

    #[test]
    fn prop_adaptive_release_is_idempotent(steps in steps()) {
        runtime().block_on(async {
            let limiter = AdaptiveConcurrencyLimiter::new(
                "prop",
                AdaptiveConcurrencyConfig {
                    initial_limit: 5,
                    min_limit: 1,
                    max_limit: 10,
                    measurement_window: 1000,
                    ..Default::default()
                },
            )
            .expect("valid config");

            let mut model = 0usize;
            let mut ignored = 0u64;
            for step in &steps {
                match step {
                    Step::Acquire => {
                        let admitted = limiter.acquire().await;
                        assert_eq!(admitted, model < 5);
                        if admitted {
                            model += 1;
                        }
                    }
                    Step::Release => {
                        limiter.release(true).await;
                        if model == 0 {
                            ignored += 1;
                        } else {
                            model -= 1;
                        }
                    }
                }
                assert_eq!(limiter.active(), model);
                assert!(limiter.active() <= limiter.current_limit());
            }
            assert_eq!(limiter.metrics().ignored_releases, ignored);
        });
    }

    #[test]
    fn prop_load_shedder_release_is_idempotent(steps in steps()) {
        runtime().block_on(async {
            let basic = BasicLoadShedder::new(
                "prop",
                BasicLoadShedderConfig { max_requests: 5, ..Default::default() },
            )
            .expect("valid config");
            check_shedder(&basic, &steps, 5).await;

            let system = SystemLoadShedder::with_probe(
                "prop",
                SystemLoadShedderConfig { max_requests: 5, ..Default::default() },
                Arc::new(IdleHost),
            )
            .expect("valid config");
            check_shedder(&system, &steps, 5).await;
        });
    }

    #[test]
    fn prop_bulkhead_slots_return_on_release_or_drop(
        steps in steps(),
        drop_instead in any::<bool>(),
    ) {
        runtime().block_on(async {
            let bulkhead = Bulkhead::new(
                "prop",
                BulkheadConfig { max_concurrent: 3, max_waiting: 0, timeout: None },
            )
            .expect("valid config");

            let mut held = Vec::new();
            for step in &steps {
                match step {
                    Step::Acquire => {
                        let result = bulkhead.acquire().await;
                        assert_eq!(result.is_ok(), held.len() < 3);
                        if let Ok(permit) = result {
                            held.push(permit);
                        }
                    }
                    Step::Release => {
                        if let Some(permit) = held.pop() {
                            if drop_instead {
                                drop(permit);
                            } else {
                                bulkhead.release(permit).await;
                            }
                        }
                    }
                }
                assert_eq!(bulkhead.available_slots(), 3 - held.len());
                assert_eq!(bulkhead.metrics().active, held.len());
            }
        });
    }

    #[test]
    fn prop_backpressure_concurrent_interleavings(plans in interleavings()) {
        threaded_runtime().block_on(async {
            let manager = Arc::new(
                BackpressureManager::new(
                    "race",
                    BackpressureConfig { max_pending: 6, high_water_mark: 4, low_water_mark: 1 },
                )
                .expect("valid config"),
            );
            let issued: usize = plans.iter().map(Vec::len).sum();

            race(manager.clone(), plans, |manager: Arc<BackpressureManager>, step| async move {
                match step {
                    Step::Acquire => {
                        let _ = manager.acquire().await;
                    }
                    Step::Release => manager.release().await,
                }
                assert!(manager.pending() <= 6);
            })
            .await;

            let metrics = manager.metrics();
            assert!(metrics.pending <= 6);
            assert!(metrics.peak_pending <= 6);
            assert_eq!(metrics.total_admitted - metrics.total_released, metrics.pending as u64);

            for _ in 0..=issued {
                manager.release().await;
            }
            assert_eq!(manager.pending(), 0);
            assert!(!manager.is_active());
        });
    }

    #[test]
    fn prop_adaptive_concurrent_interleavings(plans in interleavings()) {
        threaded_runtime().block_on(async {
            let limiter = Arc::new(
                AdaptiveConcurrencyLimiter::new(
                    "race",
                    AdaptiveConcurrencyConfig {
                        initial_limit: 5,
                        min_limit: 1,
                        max_limit: 10,
                        measurement_window: 1000,
                        ..Default::default()
                    },
                )
                .expect("valid config"),
            );
            let issued: usize = plans.iter().map(Vec::len).sum();

            race(limiter.clone(), plans, |limiter: Arc<AdaptiveConcurrencyLimiter>, step| async move {
                match step {
                    Step::Acquire => {
                        let _ = limiter.acquire().await;
                    }
                    Step::Release => limiter.release(true).await,
                }
                assert!(limiter.active() <= limiter.current_limit());
            })
            .await;

            assert!(limiter.active() <= 5);
            for _ in 0..=issued {
                limiter.release(true).await;
            }
            assert_eq!(limiter.active(), 0);
            assert!(limiter.metrics().ignored_releases >= 1);
        });
    }

    #[test]
    fn prop_load_shedder_concurrent_interleavings(plans in interleavings()) {
        threaded_runtime().block_on(async {
            let shedder = Arc::new(
                BasicLoadShedder::new(
                    "race",
                    BasicLoadShedderConfig { max_requests: 5, ..Default::default() },
                )
                .expect("valid config"),
            );
            let issued: usize = plans.iter().map(Vec::len).sum();

            race(shedder.clone(), plans, |shedder: Arc<BasicLoadShedder>, step| async move {
                match step {
                    Step::Acquire => {
                        let _ = shedder.acquire(Priority::Normal).await;
                    }
                    Step::Release => shedder.release(),
                }
                assert!(shedder.metrics().active_requests <= 5);
            })
            .await;

            for _ in 0..=issued {
                shedder.release();
            }
            assert_eq!(shedder.metrics().active_requests, 0);
            shedder.acquire(Priority::Normal).await.expect("capacity fully restored");
        });
    }

    #[test]
    fn prop_bulkhead_concurrent_interleavings(
        plans in interleavings(),
        drop_instead in any::<bool>(),
    ) {
        threaded_runtime().block_on(async {
            let bulkhead = Arc::new(
                Bulkhead::new(
                    "race",
                    BulkheadConfig { max_concurrent: 3, max_waiting: 0, timeout: None },
                )
                .expect("valid config"),
            );

            let tasks = plans.into_iter().map(|plan| {
                let bulkhead = bulkhead.clone();
                tokio::spawn(async move {
                    let mut held = Vec::new();
                    for step in plan {
                        match step {
                            Step::Acquire => {
                                if let Ok(permit) = bulkhead.acquire().await {
                                    held.push(permit);
                                }
                            }
                            Step::Release => {
                                if let Some(permit) = held.pop() {
                                    if drop_instead {
                                        drop(permit);
                                    } else {
                                        bulkhead.release(permit).await;
                                    }
                                }
                            }
                        }
                        assert!(bulkhead.available_slots() <= 3);
                        assert!(bulkhead.metrics().active <= 3);
                        tokio::task::yield_now().await;
                    }
                })
            });
            for outcome in futures::future::join_all(tasks).await {
                outcome.expect("task completes");
            }

            assert_eq!(bulkhead.available_slots(), 3);
            assert_eq!(bulkhead.metrics().active, 0);
        });
    }
}
