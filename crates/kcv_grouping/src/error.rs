use std::sync::Arc;

/// Failure observed through a pending slice future.
///
/// Every future registered against one physical call receives a clone of the
/// same error, so `Fetch` holds the cause behind an `Arc`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SliceError {
    /// The physical call (or its permit acquisition) failed.
    #[error("physical fetch failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),
    /// The task owning the physical call ended without completing the future.
    #[error("physical fetch was abandoned before completing")]
    Abandoned,
}

impl SliceError {
    pub(crate) fn fetch(err: anyhow::Error) -> Self {
        Self::Fetch(Arc::new(err))
    }

    /// Shared cause of a failed physical call.
    pub fn cause(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            Self::Fetch(cause) => Some(cause),
            Self::Abandoned => None,
        }
    }

    /// True when both errors carry the very same physical-call cause.
    pub fn same_cause(&self, other: &SliceError) -> bool {
        match (self.cause(), other.cause()) {
            (Some(left), Some(right)) => Arc::ptr_eq(left, right),
            _ => false,
        }
    }
}
