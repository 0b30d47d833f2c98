//! Cooperative cancellation.
//!
//! Every blocking operation takes a [`Ctx`] as its first parameter and checks
//! it at each back-end round trip. Cancellation never leaves partial state:
//! an open transaction is rolled back when its handle drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};

/// Cancellation context handed to every operation.
///
/// Cheap to clone; clones share the same cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct Ctx {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Ctx {
    /// A context that is never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that cancels itself once `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Flags the context as cancelled. All clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once [`cancel`](Self::cancel) was called or the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Returns [`Error::Cancelled`] once the context is cancelled.
    ///
    /// Called at every round-trip boundary.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
