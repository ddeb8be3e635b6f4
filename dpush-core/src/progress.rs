//! Progress reporting and cooperative cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Receives progress updates from the pipeline stages
pub trait Progress {
    /// `total` is `None` when the stage size is not known up front
    fn update(&self, stage: &str, current: usize, total: Option<usize>);

    /// Checked between revisions; returning true aborts the call
    fn is_interrupted(&self) -> bool {
        false
    }
}

/// Ignores all updates
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl Progress for Discard {
    fn update(&self, _stage: &str, _current: usize, _total: Option<usize>) {}
}

/// Forwards progress to `tracing` and carries an interrupt flag
#[derive(Debug, Default, Clone)]
pub struct LogProgress {
    interrupted: Arc<AtomicBool>,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that can be set from another thread (e.g. a signal handler)
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

impl Progress for LogProgress {
    fn update(&self, stage: &str, current: usize, total: Option<usize>) {
        match total {
            Some(total) => tracing::debug!(stage, current, total, "progress"),
            None => tracing::debug!(stage, current, "progress"),
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_handle_is_shared() {
        let progress = LogProgress::new();
        assert!(!progress.is_interrupted());
        progress.interrupt_handle().store(true, Ordering::SeqCst);
        assert!(progress.is_interrupted());
        assert!(!Discard.is_interrupted());
    }
}
