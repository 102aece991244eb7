//! Job-wide cancellation shared by the producer, every worker and every
//! in-flight probe.
use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable abort switch. Once [`cancel`](Self::cancel) is called every
/// clone observes it and every pending [`cancelled`](Self::cancelled)
/// future resolves.
#[derive(Debug, Clone)]
pub struct Cancellation {
    flag: Arc<watch::Sender<bool>>,
    observer: watch::Receiver<bool>,
}

impl Cancellation {
    /// A signal that has not fired.
    pub fn new() -> Self {
        let (flag, observer) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
            observer,
        }
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.observer.borrow()
    }

    /// Resolves once the signal fires; immediately if it already has.
    pub async fn cancelled(&self) {
        let mut observer = self.observer.clone();
        // The sender lives as long as `self`, so this only errors if it was
        // dropped mid-wait, which cannot happen while we hold a clone.
        let _ = observer.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
