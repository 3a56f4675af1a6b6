//! Lifecycle controller (C9): the global admission/dispatch state machine.
//!
//! Grounded on `gw/bearerbox.h`'s `BB_RUNNING`/`BB_ISOLATED`/`BB_SUSPENDED`/
//! `BB_SHUTDOWN`/`BB_DEAD`/`BB_FULL` enum. Isolate/suspend are modeled as a
//! shared `tokio::sync::watch` cell that every fiber checkpoints against at
//! the top of its loop (§4.9, §9's "shared blocking primitive" note) instead
//! of the original's explicit add-producer/remove-producer list.

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Running,
    /// Stop accepting MO from SMSCs/UDP; keep MT flowing.
    Isolated,
    /// Stop all ingress and egress.
    Suspended,
    /// Begin avalanche-drain.
    Shutdown,
    Dead,
    /// Queue-pressure signalled.
    Full,
}

pub struct Lifecycle {
    tx: watch::Sender<State>,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        let (tx, _rx) = watch::channel(State::Running);
        Lifecycle { tx }
    }

    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle { rx: self.tx.subscribe() }
    }

    pub fn state(&self) -> State {
        *self.tx.borrow()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(State::Shutdown);
    }

    pub fn isolate(&self) {
        let _ = self.tx.send(State::Isolated);
    }

    pub fn suspend(&self) {
        let _ = self.tx.send(State::Suspended);
    }

    /// Leaves isolated or suspended state.
    pub fn resume(&self) {
        let _ = self.tx.send(State::Running);
    }

    pub fn mark_full(&self) {
        let _ = self.tx.send(State::Full);
    }

    pub fn mark_dead(&self) {
        let _ = self.tx.send(State::Dead);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}

/// A fiber's view onto the controller. Cheap to clone via
/// [`Lifecycle::handle`]; every long-running fiber keeps one.
#[derive(Clone)]
pub struct LifecycleHandle {
    rx: watch::Receiver<State>,
}

impl LifecycleHandle {
    pub fn state(&self) -> State {
        *self.rx.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self.state(), State::Shutdown | State::Dead)
    }

    /// Checkpoint for ingress fibers (SMSC receivers, BOX receivers taking
    /// new MO): blocks while Isolated or Suspended.
    pub async fn checkpoint_ingress(&mut self) {
        loop {
            match self.state() {
                State::Suspended | State::Isolated => {
                    if self.rx.changed().await.is_err() {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Checkpoint for egress fibers (MT router, BOX senders): blocks only
    /// while Suspended — Isolated still lets MT flow.
    pub async fn checkpoint_egress(&mut self) {
        while self.state() == State::Suspended {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ingress_checkpoint_blocks_while_suspended_then_releases_on_resume() {
        let lifecycle = Lifecycle::new();
        let mut handle = lifecycle.handle();
        lifecycle.suspend();

        let released = tokio::spawn(async move {
            handle.checkpoint_ingress().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!released.is_finished());
        lifecycle.resume();
        tokio::time::timeout(Duration::from_millis(200), released).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn egress_checkpoint_ignores_isolated() {
        let lifecycle = Lifecycle::new();
        let mut handle = lifecycle.handle();
        lifecycle.isolate();
        tokio::time::timeout(Duration::from_millis(50), handle.checkpoint_egress()).await.unwrap();
    }

    #[test]
    fn is_shutting_down_covers_shutdown_and_dead() {
        let lifecycle = Lifecycle::new();
        let handle = lifecycle.handle();
        assert!(!handle.is_shutting_down());
        lifecycle.shutdown();
        assert!(handle.is_shutting_down());
    }
}
