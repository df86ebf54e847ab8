use std::time::Duration;
use tokio::sync::watch;

/// Single-assignment result cell with any number of waiters.
///
/// The first [`OutcomeCell::complete`] wins; later calls are ignored. Waiters
/// that subscribe after completion observe the stored value immediately. If
/// every handle to the cell is dropped without completing it, waiters see
/// [`WaitError::Abandoned`].
#[derive(Debug)]
pub struct OutcomeCell<T> {
    tx: watch::Sender<Option<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    TimedOut,
    Abandoned,
}

impl<T: Clone + Send + Sync> OutcomeCell<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Stores `value` unless the cell was already completed. Returns whether
    /// this call won.
    pub fn complete(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn waiter(&self) -> OutcomeWaiter<T> {
        OutcomeWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + Sync> Default for OutcomeCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of an [`OutcomeCell`]; holds no strong reference to it.
#[derive(Debug)]
pub struct OutcomeWaiter<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync> OutcomeWaiter<T> {
    pub async fn wait(mut self) -> Result<T, WaitError> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone().ok_or(WaitError::Abandoned),
            Err(_) => Err(WaitError::Abandoned),
        }
    }

    pub async fn wait_timeout(self, limit: Duration) -> Result<T, WaitError> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(WaitError::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_completion_wins_and_late_waiters_see_it() {
        let cell = OutcomeCell::new();
        let early = cell.waiter();
        assert!(cell.complete(1));
        assert!(!cell.complete(2));
        assert_eq!(early.wait().await, Ok(1));
        assert_eq!(cell.waiter().wait().await, Ok(1));
        assert_eq!(cell.get(), Some(1));
    }

    #[tokio::test]
    async fn many_waiters_share_one_value() {
        let cell = Arc::new(OutcomeCell::<String>::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let waiter = cell.waiter();
            handles.push(tokio::spawn(async move { waiter.wait().await }));
        }
        cell.complete("done".to_string());
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Ok("done".to_string()));
        }
    }

    #[tokio::test]
    async fn dropped_cell_abandons_waiters() {
        let cell = OutcomeCell::<u8>::new();
        let waiter = cell.waiter();
        drop(cell);
        assert_eq!(waiter.wait().await, Err(WaitError::Abandoned));
    }

    #[tokio::test]
    async fn wait_timeout_elapses() {
        let cell = OutcomeCell::<u8>::new();
        let waiter = cell.waiter();
        let outcome = waiter.wait_timeout(Duration::from_millis(20)).await;
        assert_eq!(outcome, Err(WaitError::TimedOut));
        drop(cell);
    }
}
