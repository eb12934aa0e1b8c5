use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::metrics;
use crate::store::{MemoryStore, MemoryStoreConfig, StoreError, ValueStore};
use crate::test;

#[derive(Debug, thiserror::Error)]
#[error("upstream failed")]
struct TestError;

/// Counts the invocations of an executor, per argument.
#[derive(Clone, Default)]
struct Invocations(Arc<Mutex<Vec<u32>>>);

impl Invocations {
    fn record(&self, args: u32) {
        self.0.lock().unwrap().push(args);
    }

    fn total(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn of(&self, args: u32) -> usize {
        self.0.lock().unwrap().iter().filter(|a| **a == args).count()
    }
}

/// An executor that doubles its argument after `delay`.
fn doubling(
    invocations: Invocations,
    delay: Duration,
) -> impl Fn(u32) -> BoxFuture<'static, Result<u32, TestError>> + Send + Sync + 'static {
    move |args| {
        invocations.record(args);
        async move {
            tokio::time::sleep(delay).await;
            Ok(args * 2)
        }
        .boxed()
    }
}

fn coordinator(
    invocations: &Invocations,
    store: Arc<MemoryStore<u32>>,
) -> RequestCoordinator<u32, u32, TestError> {
    RequestCoordinator::new(doubling(invocations.clone(), Duration::from_millis(100)), store)
}

/// A store wrapping a [`MemoryStore`], which can be told to fail reads or writes.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore<u32>,
    fail_get: bool,
    fail_set: bool,
    sets: AtomicUsize,
}

#[async_trait]
impl ValueStore<u32> for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<u32>, StoreError> {
        if self.fail_get {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: u32) -> Result<bool, StoreError> {
        self.sets.fetch_add(1, Ordering::Relaxed);
        if self.fail_set {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.set(key, value).await
    }
}

/// Records every lifecycle hook invocation.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn record(&self, hook: &str, event: &RequestEvent<'_, u32>) {
        self.0
            .lock()
            .unwrap()
            .push(format!("{hook}({})", event.args));
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl RequestObserver<u32> for Recorder {
    fn on_cache_hit(&self, event: &RequestEvent<'_, u32>) {
        self.record("cache_hit", event);
    }

    fn on_live_hit(&self, event: &RequestEvent<'_, u32>) {
        self.record("live_hit", event);
    }

    fn on_miss(&self, event: &RequestEvent<'_, u32>) {
        self.record("miss", event);
    }
}

#[tokio::test(start_paused = true)]
async fn test_coalesces_concurrent_calls() {
    test::setup();
    let invocations = Invocations::default();
    let coordinator = coordinator(&invocations, Default::default());

    let (first, second) = futures::join!(coordinator.call(21), coordinator.call(21));

    assert_eq!(first.unwrap(), 42);
    assert_eq!(second.unwrap(), 42);
    assert_eq!(invocations.total(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coalesces_calls_across_threads() {
    test::setup();
    let invocations = Invocations::default();
    let coordinator = Arc::new(coordinator(&invocations, Default::default()));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.call(11).await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 22);
    }
    assert_eq!(invocations.total(), 1);
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_calls_use_store() {
    test::setup();
    let invocations = Invocations::default();
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&invocations, store.clone());

    assert_eq!(coordinator.call(5).await.unwrap(), 10);
    assert_eq!(coordinator.call(5).await.unwrap(), 10);
    assert_eq!(coordinator.call(6).await.unwrap(), 12);
    assert_eq!(coordinator.call(5).await.unwrap(), 10);

    assert_eq!(invocations.of(5), 1);
    assert_eq!(invocations.of(6), 1);

    let fingerprint = coordinator.fingerprint(&5).unwrap();
    assert_eq!(store.get(fingerprint.as_str()).await, Ok(Some(10)));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_calls() {
    test::setup();
    let invocations = Invocations::default();
    let coordinator = Arc::new(coordinator(&invocations, Default::default()));

    let spawn_call = |args| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.call(args).await })
    };

    let first = spawn_call(3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = spawn_call(40);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let third = spawn_call(3);

    let mut results = vec![];
    for handle in [first, second, third] {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(results, [6, 80, 6]);
    assert_eq!(invocations.of(3), 1);
    assert_eq!(invocations.of(40), 1);
}

#[tokio::test(start_paused = true)]
async fn test_removes_completed_execution() {
    test::setup();
    let invocations = Invocations::default();
    let coordinator = coordinator(&invocations, Default::default());

    let fingerprint = coordinator.fingerprint(&7).unwrap();
    assert!(!coordinator.is_in_flight(&fingerprint));

    let (value, _) = futures::join!(coordinator.call(7), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.is_in_flight(&fingerprint));
        assert_eq!(coordinator.in_flight_count(), 1);
    });

    assert_eq!(value.unwrap(), 14);
    assert!(!coordinator.is_in_flight(&fingerprint));
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_gauge() {
    test::setup();
    metrics::testing::capture();
    let invocations = Invocations::default();
    let coordinator =
        coordinator(&invocations, Default::default()).with_request_name("in-flight-gauge");

    assert_eq!(coordinator.call(1).await.unwrap(), 2);

    let gauge = |count| format!("test.coalescer.in_flight:{count}|g|#request:in-flight-gauge");
    metrics::testing::wait_for(|m| m == gauge(1));
    metrics::testing::wait_for(|m| m == gauge(0));
}

#[tokio::test]
async fn test_expired_values_are_recomputed() {
    test::setup();
    let invocations = Invocations::default();
    let store = MemoryStore::from_config(&MemoryStoreConfig {
        ttl: Some(Duration::from_millis(100)),
        capacity: None,
    });
    let executor = doubling(invocations.clone(), Duration::ZERO);
    let coordinator = RequestCoordinator::new(executor, store);

    assert_eq!(coordinator.call(40).await.unwrap(), 80);
    assert_eq!(coordinator.call(40).await.unwrap(), 80);
    assert_eq!(invocations.of(40), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(coordinator.call(40).await.unwrap(), 80);
    assert_eq!(invocations.of(40), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_not_shared() {
    test::setup();
    let attempts = Arc::new(AtomicUsize::new(0));
    let recorder = Recorder::default();

    let executor = {
        let attempts = attempts.clone();
        move |args: u32| {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                match attempt {
                    0 => Err(TestError),
                    _ => Ok(args * 2),
                }
            }
        }
    };
    let coordinator =
        RequestCoordinator::new(executor, MemoryStore::new()).with_observer(recorder.clone());

    let (first, second) = futures::join!(coordinator.call(5), coordinator.call(5));

    // The originating caller sees the failure.
    assert!(matches!(first, Err(CallError::Execution(_))));
    // The joined caller starts over with an execution of its own.
    assert_eq!(second.unwrap(), 10);
    assert_eq!(attempts.load(Ordering::Relaxed), 2);
    assert_eq!(recorder.take(), ["miss(5)", "live_hit(5)", "miss(5)"]);

    // The second execution replaced the failed one, and removed itself.
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_execution_stays_registered() {
    test::setup();
    let attempts = Arc::new(AtomicUsize::new(0));
    let recorder = Recorder::default();

    let executor = {
        let attempts = attempts.clone();
        move |_args: u32| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { Err::<u32, _>(TestError) }
        }
    };
    let coordinator =
        RequestCoordinator::new(executor, MemoryStore::new()).with_observer(recorder.clone());
    let fingerprint = coordinator.fingerprint(&1).unwrap();

    let result = coordinator.call(1).await;
    assert!(matches!(result, Err(CallError::Execution(_))));
    assert!(coordinator.is_in_flight(&fingerprint));
    assert_eq!(recorder.take(), ["miss(1)"]);

    // The stale execution is joined, its failure swallowed, and a new execution started.
    let result = coordinator.call(1).await;
    assert_eq!(
        result.unwrap_err().execution_error().map(ToString::to_string),
        Some("upstream failed".to_owned())
    );
    assert!(coordinator.is_in_flight(&fingerprint));
    assert_eq!(recorder.take(), ["live_hit(1)", "miss(1)"]);
    assert_eq!(attempts.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_store_read_failure_falls_through() {
    test::setup();
    let invocations = Invocations::default();
    let recorder = Recorder::default();
    let store = Arc::new(FlakyStore {
        fail_get: true,
        ..Default::default()
    });
    let executor = doubling(invocations.clone(), Duration::from_millis(10));
    let coordinator =
        RequestCoordinator::new(executor, store.clone()).with_observer(recorder.clone());

    // Without a readable store, concurrent calls are not coalesced either.
    let (first, second) = futures::join!(coordinator.call(4), coordinator.call(4));
    assert_eq!(first.unwrap(), 8);
    assert_eq!(second.unwrap(), 8);
    assert_eq!(invocations.of(4), 2);
    assert_eq!(recorder.take(), ["miss(4)", "miss(4)"]);

    assert_eq!(coordinator.call(4).await.unwrap(), 8);

    // Values are written, but can never be read back.
    assert_eq!(invocations.of(4), 3);
    assert_eq!(store.sets.load(Ordering::Relaxed), 3);
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_store_write_failure() {
    test::setup();
    let invocations = Invocations::default();
    let recorder = Recorder::default();
    let store = Arc::new(FlakyStore {
        fail_set: true,
        ..Default::default()
    });
    let executor = doubling(invocations.clone(), Duration::from_millis(10));
    let coordinator =
        RequestCoordinator::new(executor, store.clone()).with_observer(recorder.clone());
    let fingerprint = coordinator.fingerprint(&4).unwrap();

    let (first, second) = futures::join!(coordinator.call(4), coordinator.call(4));

    // Only the originating caller learns about the failed write.
    assert!(matches!(
        first,
        Err(CallError::Store(StoreError::Unavailable(_)))
    ));
    assert_eq!(second.unwrap(), 8);
    assert_eq!(invocations.total(), 1);
    assert_eq!(store.sets.load(Ordering::Relaxed), 1);

    // The execution stays registered, and keeps serving its value.
    assert!(coordinator.is_in_flight(&fingerprint));
    assert_eq!(coordinator.call(4).await.unwrap(), 8);
    assert_eq!(invocations.total(), 1);
    assert_eq!(recorder.take(), ["miss(4)", "live_hit(4)", "live_hit(4)"]);
}

#[tokio::test(start_paused = true)]
async fn test_replaced_execution_leaves_replacement_registered() {
    test::setup();
    let attempts = Arc::new(AtomicUsize::new(0));
    let executor = {
        let attempts = attempts.clone();
        move |args: u32| {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                let delay = if attempt == 0 { 100 } else { 200 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, TestError>(args * 2)
            }
        }
    };
    // Failing reads make every call replace the registered execution.
    let store = FlakyStore {
        fail_get: true,
        ..Default::default()
    };
    let coordinator = Arc::new(RequestCoordinator::new(executor, store));
    let fingerprint = coordinator.fingerprint(&3).unwrap();

    let spawn_call = |args| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.call(args).await })
    };

    let first = spawn_call(3);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = spawn_call(3);

    assert_eq!(first.await.unwrap().unwrap(), 6);
    assert!(coordinator.is_in_flight(&fingerprint));

    assert_eq!(second.await.unwrap().unwrap(), 6);
    assert!(!coordinator.is_in_flight(&fingerprint));
    assert_eq!(attempts.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_executor() {
    test::setup();
    let coordinator = RequestCoordinator::new(
        |args: u32| async move {
            assert!(args > 100, "executor exploded");
            Ok::<_, TestError>(args)
        },
        MemoryStore::new(),
    );

    let (first, second) = futures::join!(coordinator.call(1), coordinator.call(1));

    assert!(matches!(first, Err(CallError::Panicked)));
    // The joined caller retried, and ran into the same panic.
    assert!(matches!(second, Err(CallError::Panicked)));

    assert_eq!(coordinator.call(101).await.unwrap(), 101);
}

struct PanickingObserver;

impl RequestObserver<u32> for PanickingObserver {
    fn on_miss(&self, _event: &RequestEvent<'_, u32>) {
        panic!("observer exploded");
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_observer_is_isolated() {
    test::setup();
    let invocations = Invocations::default();
    let recorder = Recorder::default();
    let coordinator = coordinator(&invocations, Default::default())
        .with_observer(PanickingObserver)
        .with_observer(recorder.clone());

    assert_eq!(coordinator.call(2).await.unwrap(), 4);
    assert_eq!(coordinator.call(2).await.unwrap(), 4);

    assert_eq!(recorder.take(), ["miss(2)", "cache_hit(2)"]);
    assert_eq!(invocations.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fingerprint_failure() {
    test::setup();
    let invocations = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(FlakyStore::default());

    let executor = {
        let invocations = invocations.clone();
        move |_args: BTreeMap<Vec<u8>, u32>| {
            invocations.fetch_add(1, Ordering::Relaxed);
            async { Ok::<_, TestError>(0) }
        }
    };
    let coordinator = RequestCoordinator::new(executor, store.clone());

    let args = BTreeMap::from([(vec![1, 2], 3)]);
    let result = coordinator.call(args).await;

    assert!(matches!(result, Err(CallError::Fingerprint(_))));
    assert_eq!(invocations.load(Ordering::Relaxed), 0);
    assert_eq!(store.sets.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_name_scopes_store() {
    test::setup();
    let store = Arc::new(MemoryStore::new());

    let first_invocations = Invocations::default();
    let first = coordinator(&first_invocations, store.clone()).with_request_name("double");
    let second_invocations = Invocations::default();
    let second = coordinator(&second_invocations, store.clone()).with_request_name("double");
    let anonymous_invocations = Invocations::default();
    let anonymous = coordinator(&anonymous_invocations, store.clone());

    assert_eq!(first.call(8).await.unwrap(), 16);
    assert_eq!(second.call(8).await.unwrap(), 16);
    assert_eq!(anonymous.call(8).await.unwrap(), 16);

    assert_eq!(first_invocations.total(), 1);
    assert_eq!(second_invocations.total(), 0);
    assert_eq!(anonymous_invocations.total(), 1);

    assert_eq!(first.fingerprint(&8).unwrap().as_str(), r#"["double",8]"#);
    assert_ne!(anonymous.request_name(), "double");
}

#[test]
fn test_generated_request_names_differ() {
    let invocations = Invocations::default();
    let first = coordinator(&invocations, Default::default());
    let second = coordinator(&invocations, Default::default());

    assert_ne!(first.request_name(), second.request_name());
    assert_ne!(
        first.fingerprint(&1).unwrap(),
        second.fingerprint(&1).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_cancel_execution() {
    test::setup();
    let invocations = Invocations::default();
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(coordinator(&invocations, store.clone()));
    let fingerprint = coordinator.fingerprint(&9).unwrap();

    let handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.call(9).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.abort();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.get(fingerprint.as_str()).await, Ok(Some(18)));
    assert!(!coordinator.is_in_flight(&fingerprint));

    assert_eq!(coordinator.call(9).await.unwrap(), 18);
    assert_eq!(invocations.total(), 1);
}
