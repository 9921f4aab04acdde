//! Cancellation signal shared between the control thread and a running task

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set-and-forget cancellation flag
///
/// Cloning shares the flag. Setting it is idempotent and never blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_canceled());

        token.cancel();
        token.cancel();
        assert!(other.is_canceled());
    }
}
