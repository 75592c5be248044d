use std::sync::atomic::{AtomicU8, Ordering};

use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Created,
            1 => LifecycleState::Running,
            2 => LifecycleState::ShuttingDown,
            _ => LifecycleState::Stopped,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Process-wide run state shared by the engine and every background loop.
///
/// Transitions are compare-and-swap so two callers racing to shut down see
/// exactly one winner. Shutdown is broadcast through a cancellation token
/// rather than a polled flag.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    token: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Created as u8),
            token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| LifecycleError::InvalidTransition {
                from: LifecycleState::from_u8(actual),
                to,
            })
    }

    /// Created -> Running.
    pub fn start(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Created, LifecycleState::Running)?;
        info!("lifecycle running");
        Ok(())
    }

    /// Moves to ShuttingDown and cancels every waiter. Returns false if a
    /// shutdown was already underway or finished.
    pub fn request_shutdown(&self) -> bool {
        let won = self
            .transition(LifecycleState::Running, LifecycleState::ShuttingDown)
            .or_else(|_| self.transition(LifecycleState::Created, LifecycleState::ShuttingDown))
            .is_ok();
        if won {
            info!("lifecycle shutting down");
            self.token.cancel();
        }
        won
    }

    /// ShuttingDown -> Stopped.
    pub fn finish(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::ShuttingDown, LifecycleState::Stopped)?;
        info!("lifecycle stopped");
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// A child token for loops that outlive a borrow of the lifecycle.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
