use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::Fingerprint;

/// A request as seen by a [`RequestObserver`].
#[derive(Debug)]
pub struct RequestEvent<'a, A> {
    pub fingerprint: &'a Fingerprint,
    pub args: &'a A,
}

/// Hooks into the lifecycle of coordinated calls.
///
/// Each call invokes one of the methods before it resolves. A call whose joined execution
/// fails additionally invokes [`on_miss`](Self::on_miss) when it starts over. Observers run
/// synchronously on the calling task and cannot influence the outcome of a call. A panicking
/// observer is logged and otherwise ignored.
pub trait RequestObserver<A>: Send + Sync + 'static {
    /// The value was found in the store.
    fn on_cache_hit(&self, _event: &RequestEvent<'_, A>) {}

    /// An identical request was already executing, and the call joined it.
    fn on_live_hit(&self, _event: &RequestEvent<'_, A>) {}

    /// Neither the store nor a running execution could serve the call, so a new execution is
    /// started.
    fn on_miss(&self, _event: &RequestEvent<'_, A>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Lifecycle {
    CacheHit,
    LiveHit,
    Miss,
}

impl Lifecycle {
    fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::LiveHit => "live_hit",
            Self::Miss => "miss",
        }
    }
}

/// Invokes the hook for `lifecycle` on every observer, isolating them from each other.
pub(super) fn notify<A: 'static>(
    observers: &[Arc<dyn RequestObserver<A>>],
    lifecycle: Lifecycle,
    event: &RequestEvent<'_, A>,
) {
    for observer in observers {
        let result = catch_unwind(AssertUnwindSafe(|| match lifecycle {
            Lifecycle::CacheHit => observer.on_cache_hit(event),
            Lifecycle::LiveHit => observer.on_live_hit(event),
            Lifecycle::Miss => observer.on_miss(event),
        }));

        if result.is_err() {
            tracing::error!(
                fingerprint = %event.fingerprint,
                hook = lifecycle.as_str(),
                "Request observer panicked"
            );
        }
    }
}
