// causal read synchronizer: the apply watermark, published through a watch
// channel so any number of readers can wait on their own targets
use std::time::Duration;

use tokio::{sync::watch, time::timeout};

use crate::clock::LogicalTime;

#[derive(Debug)]
pub struct Synchronizer(watch::Sender<LogicalTime>);

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Synchronizer {
    pub fn new(watermark: LogicalTime) -> Self {
        Self(watch::Sender::new(watermark))
    }

    /// Raises the watermark to `lamport` and wakes waiters. Stale or duplicated
    /// notifications are ignored.
    pub fn on_applied(&self, lamport: LogicalTime) {
        self.0.send_if_modified(|watermark| {
            if lamport > *watermark {
                *watermark = lamport;
                true
            } else {
                false
            }
        });
    }

    /// Waits until the watermark reaches `target`, returns false if `wait`
    /// elapsed first.
    pub async fn await_at_least(&self, target: LogicalTime, wait: Duration) -> bool {
        let mut receiver = self.0.subscribe();
        // `wait_for` checks the current value before the first wait. the borrow
        // it returns must be gone before `receiver` is
        let reached = matches!(
            timeout(wait, receiver.wait_for(|watermark| *watermark >= target)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn last_applied(&self) -> LogicalTime {
        *self.0.borrow()
    }
}
