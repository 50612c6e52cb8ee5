//! The per-transaction state machine.
//!
//! A write transaction must walk the integration steps in order - a root can
//! only be stored after the subtrees backing it were updated, and sequenced
//! leaves can only follow a dequeue. The legal moves are kept as a data
//! table rather than branching code.

use std::fmt;

use crate::error::StorageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Begin,
    QueueLeaves,
    DequeueLeaves,
    UpdateSequencedLeaves,
    SetMerkleNodes,
    StoreSignedLogRoot,
    Commit,
    Rollback,
    Close,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Begin => "Begin",
            State::QueueLeaves => "QueueLeaves",
            State::DequeueLeaves => "DequeueLeaves",
            State::UpdateSequencedLeaves => "UpdateSequencedLeaves",
            State::SetMerkleNodes => "SetMerkleNodes",
            State::StoreSignedLogRoot => "StoreSignedLogRoot",
            State::Commit => "Commit",
            State::Rollback => "Rollback",
            State::Close => "Close",
        };
        f.write_str(name)
    }
}

/// Legal transitions. `Rollback` and `Close` are additionally reachable
/// from every live state; `Close` is terminal.
const TRANSITIONS: &[(State, &[State])] = &[
    (
        State::Begin,
        &[
            State::QueueLeaves,
            State::DequeueLeaves,
            State::StoreSignedLogRoot,
        ],
    ),
    (State::QueueLeaves, &[State::Commit]),
    (
        State::DequeueLeaves,
        &[State::UpdateSequencedLeaves, State::Commit],
    ),
    (State::UpdateSequencedLeaves, &[State::SetMerkleNodes]),
    (State::SetMerkleNodes, &[State::StoreSignedLogRoot]),
    (State::StoreSignedLogRoot, &[State::Commit]),
    (State::Commit, &[State::Close]),
    (State::Rollback, &[State::Close]),
];

#[derive(Debug)]
pub struct Fsm {
    state: State,
}

impl Fsm {
    pub fn new() -> Self {
        Fsm {
            state: State::Begin,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Moves to `next`, or reports the blocked transition.
    pub fn emit(&mut self, next: State) -> Result<(), StorageError> {
        if self.state == State::Close {
            return Err(StorageError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        if next == State::Rollback || next == State::Close {
            self.state = next;
            return Ok(());
        }

        let allowed = TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self.state)
            .map(|(_, to)| *to)
            .unwrap_or(&[]);
        if allowed.contains(&next) {
            self.state = next;
            Ok(())
        } else {
            Err(StorageError::IllegalTransition {
                from: self.state,
                to: next,
            })
        }
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}
