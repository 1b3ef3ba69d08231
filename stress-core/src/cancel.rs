// stress-core/src/cancel.rs
// Interrupt token shared between the signal handler thread and the supervisor

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

struct Inner {
    interrupted: AtomicBool,
    tx: Sender<()>,
    rx: Receiver<()>,
}

/// Cloneable handle used to interrupt a run from another thread
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<Inner>,
}

impl StopToken {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                interrupted: AtomicBool::new(false),
                tx,
                rx,
            }),
        }
    }

    /// Request that the current run stop as interrupted.
    ///
    /// Safe to call repeatedly; only the first call wakes the supervisor.
    pub fn interrupt(&self) {
        if !self.inner.interrupted.swap(true, Ordering::AcqRel) {
            info!("Interrupt received, stopping workers");
            let _ = self.inner.tx.send(());
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Channel that becomes ready when `interrupt` is first called
    pub(crate) fn events(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopToken")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_interrupt_is_sticky_and_signals_once() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!token.is_interrupted());

        clone.interrupt();
        clone.interrupt();

        assert!(token.is_interrupted());
        assert!(token.events().recv_timeout(Duration::from_millis(10)).is_ok());
        assert!(token.events().try_recv().is_err());
    }
}
