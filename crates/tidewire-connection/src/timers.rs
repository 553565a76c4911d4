//! Abortable, generation-stamped connection timers.
//!
//! Every timer is a `tokio::time::sleep` task. When it expires it sends a
//! [`TimerFired`] back to the connection actor, stamped with the generation
//! it was started with. The actor asks [`Timers::take_if_current`] before
//! acting on it, so a timer that was cancelled or restarted after it had
//! already fired is ignored.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::TimerError;

/// The timers a connection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Bounds how long a connection attempt may take.
    Connect,
    /// Delay before retrying from `Disconnected`.
    DisconnectedRetry,
    /// Delay before retrying from `Suspended`.
    SuspendedRetry,
    /// Bounds how long the server has to confirm a close.
    Close,
    /// Fires when the server has gone quiet for too long.
    Idle,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::DisconnectedRetry => "disconnected-retry",
            Self::SuspendedRetry => "suspended-retry",
            Self::Close => "close",
            Self::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// A timer expiry, as delivered to the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Which timer fired.
    pub kind: TimerKind,
    /// The generation it was started with.
    pub generation: u64,
}

struct ActiveTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// The set of running timers, at most one per [`TimerKind`].
pub struct Timers {
    active: HashMap<TimerKind, ActiveTimer>,
    next_generation: u64,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl Timers {
    /// Creates an empty set whose expiries are delivered to `fired_tx`.
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            active: HashMap::new(),
            next_generation: 0,
            fired_tx,
        }
    }

    /// Starts a timer of `kind` that fires after `after`.
    ///
    /// # Errors
    /// Returns [`TimerError::AlreadyActive`] if a timer of this kind is
    /// already running; cancel it first to restart it.
    pub fn start(&mut self, kind: TimerKind, after: Duration) -> Result<(), TimerError> {
        if self.active.contains_key(&kind) {
            return Err(TimerError::AlreadyActive(kind));
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.fired_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The actor may be gone during shutdown.
            let _ = tx.send(TimerFired { kind, generation });
        });
        debug!(timer = %kind, ?after, generation, "timer started");
        self.active.insert(kind, ActiveTimer { generation, handle });
        Ok(())
    }

    /// Cancels the timer of `kind`, if one is running.
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.active.remove(&kind) {
            timer.handle.abort();
            trace!(timer = %kind, "timer cancelled");
        }
    }

    /// Cancels every running timer.
    pub fn cancel_all(&mut self) {
        for (_, timer) in self.active.drain() {
            timer.handle.abort();
        }
    }

    /// Whether a timer of `kind` is running.
    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Accepts a fired timer if it is still the current one for its kind,
    /// removing it from the active set.
    pub fn take_if_current(&mut self, fired: TimerFired) -> bool {
        match self.active.get(&fired.kind) {
            Some(timer) if timer.generation == fired.generation => {
                self.active.remove(&fired.kind);
                true
            }
            _ => {
                trace!(timer = %fired.kind, generation = fired.generation, "stale timer ignored");
                false
            }
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
