use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared by everything working on one
/// investigation. Long-running operations check it at suspension points and
/// unwind cleanly, releasing pool slots and breaker probe tokens.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Helper for suspension points: errors out once the token fires.
    pub fn check(&self) -> Result<(), crate::errors::ErrorKind> {
        if self.is_cancelled() {
            Err(crate::errors::ErrorKind::Cancelled)
        } else {
            Ok(())
        }
    }
}
