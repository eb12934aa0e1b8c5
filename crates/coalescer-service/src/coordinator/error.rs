use std::sync::Arc;

use thiserror::Error;

use crate::store::StoreError;

/// An error returned by [`RequestCoordinator::call`](super::RequestCoordinator::call).
///
/// `E` is the error type of the executor. It is shared between every caller that awaited the
/// same execution, which is why it is kept behind an [`Arc`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The arguments could not be turned into a fingerprint.
    ///
    /// No store or executor interaction happens in this case.
    #[error("failed to fingerprint request arguments: {0}")]
    Fingerprint(String),
    /// The executor returned an error.
    #[error("execution failed: {0}")]
    Execution(Arc<E>),
    /// The executor panicked before producing a result.
    #[error("execution panicked")]
    Panicked,
    /// The executor succeeded, but its result could not be written to the value store.
    #[error("failed to store result: {0}")]
    Store(#[source] StoreError),
}

// Deriving would require `E: Clone`.
impl<E> Clone for CallError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Fingerprint(details) => Self::Fingerprint(details.clone()),
            Self::Execution(error) => Self::Execution(Arc::clone(error)),
            Self::Panicked => Self::Panicked,
            Self::Store(error) => Self::Store(error.clone()),
        }
    }
}

impl<E> CallError<E> {
    /// Returns the executor's error, if this is an [`Execution`](Self::Execution) error.
    pub fn execution_error(&self) -> Option<&E> {
        match self {
            Self::Execution(error) => Some(&**error),
            _ => None,
        }
    }

    /// A short name of the error kind, used to tag metrics.
    pub(super) fn kind(&self) -> &'static str {
        match self {
            Self::Fingerprint(_) => "fingerprint",
            Self::Execution(_) => "error",
            Self::Panicked => "panicked",
            Self::Store(_) => "store",
        }
    }
}
