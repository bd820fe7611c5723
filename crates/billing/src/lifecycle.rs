//! Open/closed state shared by the billing sub-services

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BillingError, BillingResult};

#[derive(Clone, Debug)]
pub(crate) struct Lifecycle {
    open: Arc<AtomicBool>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn close(&self) -> bool {
        self.open.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Reject new work once the service has been shut down
    pub(crate) fn ensure_open(&self) -> BillingResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BillingError::Config("billing service is shut down".to_string()))
        }
    }
}
