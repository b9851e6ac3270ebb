//! Wait group for deferring run completion.

use tokio::sync::watch;

/// Counts outstanding work; `wait` resolves once the count drops to zero.
///
/// A fresh group has nothing outstanding, so waiting on it returns at once.
#[derive(Debug)]
pub struct WaitGroup {
    count: watch::Sender<usize>,
}

impl WaitGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Registers `n` units of outstanding work.
    pub fn add(&self, n: usize) {
        self.count.send_modify(|count| *count += n);
    }

    /// Marks one unit of work as finished.
    pub fn done(&self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Returns the outstanding count.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits until nothing is outstanding.
    pub async fn wait(&self) {
        let mut count = self.count.subscribe();
        let _ = count.wait_for(|count| *count == 0).await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}
