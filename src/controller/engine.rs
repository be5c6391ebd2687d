//! State machine engine shared by every controller.
//!
//! A tick walks a fixed chain of states. Each step returns a [`Flow`]: go to
//! the next state, stop, or hand a requeue request back to the caller. Status
//! is written between steps only when it differs from the last persisted
//! copy, and cancellation is checked before every step.

use std::fmt::{Debug, Display};
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::controller::status::StatusSnapshot;

/// Default requeue for "waiting for the platform" steps.
pub const REQUEUE_SLOW: Duration = Duration::from_secs(60);

/// What the caller should do once a tick finishes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RequeueSignal {
    /// No explicit requeue; rely on watches and the resync interval.
    #[default]
    None,
    Immediately,
    After(Duration),
}

impl RequeueSignal {
    /// Convert to a controller action, using `resync` when nothing was requested.
    pub fn into_action(self, resync: Duration) -> Action {
        match self {
            RequeueSignal::None => Action::requeue(resync),
            RequeueSignal::Immediately => Action::requeue(Duration::ZERO),
            RequeueSignal::After(after) => Action::requeue(after),
        }
    }
}

impl Display for RequeueSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequeueSignal::None => write!(f, "none"),
            RequeueSignal::Immediately => write!(f, "immediately"),
            RequeueSignal::After(after) => write!(f, "after {}s", after.as_secs_f64()),
        }
    }
}

/// Outcome of a single step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow<S> {
    Next(S),
    Stop,
    Requeue(RequeueSignal),
}

impl<S> Flow<S> {
    pub fn requeue_after(after: Duration) -> Self {
        Flow::Requeue(RequeueSignal::After(after))
    }

    pub fn requeue_now() -> Self {
        Flow::Requeue(RequeueSignal::Immediately)
    }
}

/// A resumable chain of states over one declared resource.
#[async_trait]
pub trait StateMachine: Send {
    /// Step identifier. `Display` names the step in logs.
    type State: Copy + Debug + Display + Send;
    /// Status subresource value.
    type Status: Clone + PartialEq + Send + Sync;

    /// Current in-memory status.
    fn status(&self) -> &Self::Status;

    /// Run one state.
    async fn step(&mut self, state: Self::State) -> Result<Flow<Self::State>>;

    /// Write the in-memory status to the status subresource.
    async fn persist_status(&mut self) -> Result<()>;
}

/// Drive `machine` from `start` until a step stops, requeues or fails.
///
/// A failing step still gets its status changes persisted; an error from the
/// status write replaces the step's own outcome.
pub async fn run<M: StateMachine>(
    machine: &mut M,
    start: M::State,
    cancel: &CancellationToken,
) -> Result<RequeueSignal> {
    let mut snapshot = StatusSnapshot::new(machine.status());
    let mut state = start;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        debug!(state = %state, "switching state");

        let outcome = machine.step(state).await;

        if snapshot.is_dirty(machine.status()) {
            machine.persist_status().await?;
            snapshot.mark_persisted(machine.status());
        }

        match outcome? {
            Flow::Next(next) => state = next,
            Flow::Stop => return Ok(RequeueSignal::None),
            Flow::Requeue(signal) => return Ok(signal),
        }
    }
}
