//! Engine lifecycle states.

use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Lifecycle of a [`StreamEngine`](super::StreamEngine).
///
/// `Stopped -> Starting -> Running -> Draining -> Stopped`. A failed start
/// goes straight from `Starting` back to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not running. Terminal once the engine has run.
    Stopped,
    /// Loading checkpoints and positioning readers
    Starting,
    /// Partition workers processing batches
    Running,
    /// Workers finishing their in-flight batch
    Draining,
}

impl EngineState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes state transitions to any number of watchers.
pub(crate) struct StateMachine {
    tx: watch::Sender<EngineState>,
    started: AtomicBool,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(EngineState::Stopped);
        Self {
            tx,
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn current(&self) -> EngineState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.tx.subscribe()
    }

    /// Enter `Starting`. Allowed once per engine.
    pub(crate) fn begin(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "engine has already run; build a new engine to restart".into(),
            ));
        }
        self.transition(EngineState::Starting)
    }

    pub(crate) fn transition(&self, next: EngineState) -> Result<()> {
        let mut rejected = None;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        match rejected {
            None => Ok(()),
            Some(current) => Err(Error::InvalidState(format!(
                "illegal engine transition {} -> {}",
                current, next
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_lifecycle() {
        let machine = StateMachine::new();
        assert_eq!(machine.current(), EngineState::Stopped);

        machine.begin().unwrap();
        machine.transition(EngineState::Running).unwrap();
        machine.transition(EngineState::Draining).unwrap();
        machine.transition(EngineState::Stopped).unwrap();
        assert_eq!(machine.current(), EngineState::Stopped);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let machine = StateMachine::new();
        assert!(machine.transition(EngineState::Running).is_err());

        machine.begin().unwrap();
        assert!(machine.transition(EngineState::Draining).is_err());
        assert_eq!(machine.current(), EngineState::Starting);
    }

    #[test]
    fn test_stopped_is_terminal_after_run() {
        let machine = StateMachine::new();
        machine.begin().unwrap();
        machine.transition(EngineState::Stopped).unwrap();

        let err = machine.begin().unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();

        machine.begin().unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), EngineState::Starting);
    }

    #[test]
    fn test_display() {
        assert_eq!(EngineState::Draining.to_string(), "draining");
    }
}
