//! Coalescing and caching of calls to an expensive asynchronous operation.
//!
//! A [`RequestCoordinator`] wraps an executor function together with a [`ValueStore`]. Each
//! [`call`](RequestCoordinator::call) resolves in one of three ways:
//!
//! 1. The store already holds a value for the call's [`Fingerprint`], which is returned as-is.
//! 2. An identical call is currently executing. The call joins that execution and shares its
//!    result.
//! 3. Otherwise the executor is invoked. Its result is written to the store, and returned.
//!
//! Failures are deliberately asymmetric. The caller that started an execution gets to see its
//! error, whereas callers that merely joined it start over with an execution of their own.
//! A failed execution also stays registered as in flight. A later call for the same fingerprint
//! that misses the store joins it, observes the failure, and starts over as well.
//!
//! Joined callers share the executor's result, not the outcome of writing it to the store. Only
//! the caller that started an execution learns about a failed store write. The execution then
//! stays registered and keeps serving its value to calls that miss the store.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;

use crate::store::{StoreRef, ValueStore};

mod error;
mod fingerprint;
mod observer;

pub use error::CallError;
pub use fingerprint::Fingerprint;
pub use observer::{RequestEvent, RequestObserver};

use observer::{Lifecycle, notify};

#[cfg(test)]
mod tests;

type Outcome<V, E> = Result<V, CallError<E>>;
type Execution<V, E> = Shared<BoxFuture<'static, Outcome<V, E>>>;
type ExecutionMap<V, E> = Arc<Mutex<HashMap<Fingerprint, Execution<V, E>>>>;
type ExecutorFn<A, V, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<V, E>> + Send + Sync>;

/// An execution that has been registered in the in-flight table, but not yet spawned.
struct Pending<V, E> {
    execution: Execution<V, E>,
    sender: oneshot::Sender<Outcome<V, E>>,
}

impl<V, E> Pending<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let execution = receiver
            .map(|outcome| outcome.unwrap_or(Err(CallError::Panicked)))
            .boxed()
            .shared();
        Self { execution, sender }
    }
}

enum Registration<V, E> {
    /// An identical execution is already registered.
    Running(Execution<V, E>),
    /// A new execution has been registered and must be spawned by the caller.
    Registered(Pending<V, E>),
}

fn report_in_flight(request_name: &str, count: usize) {
    metric!(
        gauge("coalescer.in_flight") = count as u64,
        "request" => request_name
    );
}

/// Deduplicates concurrent calls to an executor and caches their results in a [`ValueStore`].
///
/// - `A` are the arguments of a call. They are serialized into the call's [`Fingerprint`].
/// - `V` is the value produced by the executor and persisted in the store.
/// - `E` is the error produced by the executor.
///
/// Executions are spawned on the current tokio runtime, so [`call`](Self::call) must be awaited
/// within one. An execution runs to completion even if all of its callers go away.
pub struct RequestCoordinator<A, V, E> {
    request_name: String,
    executor: ExecutorFn<A, V, E>,
    store: StoreRef<V>,
    observers: Vec<Arc<dyn RequestObserver<A>>>,

    /// Executions that have been started and not yet stored successfully.
    in_flight: ExecutionMap<V, E>,
}

impl<A, V, E> std::fmt::Debug for RequestCoordinator<A, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("request_name", &self.request_name)
            .field("observers", &self.observers.len())
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl<A, V, E> RequestCoordinator<A, V, E>
where
    A: Serialize + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a coordinator calling `executor` and caching its results in `store`.
    ///
    /// The coordinator gets a random request name, so its values can never be observed by other
    /// coordinators sharing the same store. Use [`with_request_name`](Self::with_request_name)
    /// to share them.
    pub fn new<F, Fut, S>(executor: F, store: S) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        S: ValueStore<V>,
    {
        Self {
            request_name: uuid::Uuid::new_v4().to_string(),
            executor: Arc::new(move |args| executor(args).boxed()),
            store: Arc::new(store),
            observers: Vec::new(),
            in_flight: Default::default(),
        }
    }

    /// Sets a stable request name.
    ///
    /// Coordinators sharing a request name and a store share their cached values. The executors
    /// of such coordinators are expected to produce equivalent values.
    pub fn with_request_name(mut self, request_name: impl Into<String>) -> Self {
        self.request_name = request_name.into();
        self
    }

    /// Registers an observer notified about the lifecycle of every call.
    pub fn with_observer<O>(mut self, observer: O) -> Self
    where
        O: RequestObserver<A>,
    {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn request_name(&self) -> &str {
        &self.request_name
    }

    /// Computes the fingerprint under which a call with `args` is deduplicated and stored.
    pub fn fingerprint(&self, args: &A) -> Result<Fingerprint, CallError<E>> {
        Fingerprint::compute(&self.request_name, args)
            .map_err(|err| CallError::Fingerprint(err.to_string()))
    }

    /// The number of registered executions, including failed ones.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Whether an execution is registered for `fingerprint`.
    pub fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        self.in_flight.lock().contains_key(fingerprint)
    }

    /// Returns the value for `args` from the store, from an identical running execution, or
    /// from a new execution.
    ///
    /// If the store cannot be read, the call neither joins nor waits for other executions and
    /// starts its own.
    pub async fn call(&self, args: A) -> Result<V, CallError<E>> {
        let fingerprint = self.fingerprint(&args)?;
        let request = self.request_name.as_str();
        metric!(counter("coalescer.access") += 1, "request" => request);

        let pending = match self.store.get(fingerprint.as_str()).await {
            Ok(Some(value)) => {
                tracing::trace!(%fingerprint, "Serving value from store");
                metric!(counter("coalescer.store.hit") += 1, "request" => request);
                self.notify(Lifecycle::CacheHit, &fingerprint, &args);
                return Ok(value);
            }
            Ok(None) => match self.join_or_register(&fingerprint) {
                Registration::Running(execution) => {
                    tracing::trace!(%fingerprint, "Joining running execution");
                    metric!(counter("coalescer.live.hit") += 1, "request" => request);
                    self.notify(Lifecycle::LiveHit, &fingerprint, &args);

                    match execution.await {
                        Ok(value) => return Ok(value),
                        Err(err) => {
                            tracing::debug!(
                                kind = err.kind(),
                                %fingerprint,
                                "Joined execution failed, starting a new one"
                            );
                            self.register(&fingerprint)
                        }
                    }
                }
                Registration::Registered(pending) => pending,
            },
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    %fingerprint,
                    "Failed to read from store, starting a new execution"
                );
                metric!(counter("coalescer.store.error") += 1, "request" => request);
                self.register(&fingerprint)
            }
        };

        tracing::trace!(%fingerprint, "Starting new execution");
        metric!(counter("coalescer.miss") += 1, "request" => request);
        self.notify(Lifecycle::Miss, &fingerprint, &args);

        self.make_new_request(fingerprint, args, pending).await
    }

    /// Returns the execution registered for `fingerprint`, or registers a new one.
    ///
    /// Lookup and registration happen under the same lock, so concurrent calls for a vacant
    /// fingerprint register exactly one execution.
    fn join_or_register(&self, fingerprint: &Fingerprint) -> Registration<V, E> {
        let mut executions = self.in_flight.lock();
        let pending = match executions.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => return Registration::Running(entry.get().clone()),
            Entry::Vacant(entry) => {
                let pending = Pending::new();
                entry.insert(pending.execution.clone());
                pending
            }
        };
        report_in_flight(&self.request_name, executions.len());
        Registration::Registered(pending)
    }

    /// Registers a new execution for `fingerprint`, replacing any registered execution.
    fn register(&self, fingerprint: &Fingerprint) -> Pending<V, E> {
        let pending = Pending::new();
        let mut executions = self.in_flight.lock();
        executions.insert(fingerprint.clone(), pending.execution.clone());
        report_in_flight(&self.request_name, executions.len());
        pending
    }

    /// Spawns the registered execution for `fingerprint` and waits for its outcome.
    ///
    /// Callers joining the execution resolve as soon as the executor finishes. The value is then
    /// written to the store, and this caller resolves with the outcome of that write. Once the
    /// write succeeded, the execution removes itself from the table, unless it has been replaced
    /// in the meantime. Failed executions and executions whose value could not be stored stay
    /// registered.
    async fn make_new_request(
        &self,
        fingerprint: Fingerprint,
        args: A,
        pending: Pending<V, E>,
    ) -> Outcome<V, E> {
        let Pending { execution, sender } = pending;
        let (write_sender, write_receiver) = oneshot::channel();

        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        let executions = Arc::clone(&self.in_flight);
        let request_name = self.request_name.clone();
        let registered = execution.clone();

        let task = async move {
            let start = Instant::now();
            let outcome = executor(args)
                .await
                .map_err(|err| CallError::Execution(Arc::new(err)));
            metric!(
                timer("coalescer.execution.duration") = start.elapsed(),
                "request" => &request_name
            );

            let status = match &outcome {
                Ok(_) => "ok",
                Err(err) => err.kind(),
            };
            metric!(
                counter("coalescer.execution") += 1,
                "request" => &request_name,
                "status" => status,
            );

            let value = outcome.as_ref().ok().cloned();
            sender.send(outcome).ok();
            let Some(value) = value else {
                return;
            };

            let written = store.set(fingerprint.as_str(), value).await;
            match &written {
                Ok(_) => {
                    metric!(
                        counter("coalescer.store.write") += 1,
                        "request" => &request_name,
                        "status" => "ok",
                    );
                    let mut executions = executions.lock();
                    let is_registered = executions
                        .get(&fingerprint)
                        .is_some_and(|current| current.ptr_eq(&registered));
                    if is_registered {
                        executions.remove(&fingerprint);
                    }
                    report_in_flight(&request_name, executions.len());
                }
                Err(err) => {
                    tracing::error!(
                        error = err as &dyn std::error::Error,
                        %fingerprint,
                        "Failed to write result to store"
                    );
                    metric!(
                        counter("coalescer.store.write") += 1,
                        "request" => &request_name,
                        "status" => "error",
                    );
                }
            }

            write_sender.send(written).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(task);

        let value = execution.await?;
        match write_receiver.await {
            Ok(Ok(_)) => Ok(value),
            Ok(Err(err)) => Err(CallError::Store(err)),
            Err(oneshot::Canceled) => Err(CallError::Panicked),
        }
    }

    fn notify(&self, lifecycle: Lifecycle, fingerprint: &Fingerprint, args: &A) {
        if self.observers.is_empty() {
            return;
        }
        let event = RequestEvent { fingerprint, args };
        notify(&self.observers, lifecycle, &event);
    }
}
