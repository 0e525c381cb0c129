use std::fmt::Debug;

use log::debug;
use tokio::sync::watch;

/// Holds one state out of a closed set and lets tasks wait for a given state.
///
/// Waiters subscribe before they look at the current value, so a state set
/// between the check and the wait is never lost.
pub struct StateMachine<S> {
    tx: watch::Sender<S>,
}

impl<S> StateMachine<S>
where
    S: Copy + PartialEq + Debug + Send + Sync,
{
    pub fn new(initial: S) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> S {
        *self.tx.borrow()
    }

    pub fn set_state(&self, state: S) {
        let previous = self.tx.send_replace(state);
        debug!("state {:?} -> {:?}", previous, state);
    }

    pub async fn wait_for_state(&self, target: S) {
        let mut rx = self.tx.subscribe();

        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == target).await;
    }

    pub fn waiter_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
