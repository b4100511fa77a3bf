use std::sync::Arc;

use thiserror::Error;

/// The failure stored in a settled job outcome.
///
/// Every observer of a failed fingerprint receives a clone of the same
/// error, so `same_as` holds across all concurrent and later waiters until
/// the fingerprint is invalidated and recomputed.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct JobError(#[from] pub(crate) Arc<anyhow::Error>);

impl JobError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Whether both errors are the very same failure object.
    pub fn same_as(&self, other: &JobError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        // A handler that forwards a nested failure with `?` hands it back
        // unchanged rather than wrapping it a second time.
        match err.downcast::<JobError>() {
            Ok(job) => job,
            Err(err) => JobError(Arc::new(err)),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No job is executing in this context")]
    Detached,
}
