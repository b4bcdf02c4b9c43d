//! Visual transitions covering module loads and unloads

pub mod timed;

use serde::Serialize;
use std::fmt;

use crate::time::TickContext;

pub use timed::TimedTransition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransitionState {
    Inactive,
    Entering,
    Running,
    Exiting,
}

impl fmt::Display for TransitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransitionState::Inactive => "inactive",
            TransitionState::Entering => "entering",
            TransitionState::Running => "running",
            TransitionState::Exiting => "exiting",
        };
        write!(f, "{}", label)
    }
}

/// A transition is ticked by its orchestrator while it covers a change of module.
pub trait Transition {
    fn name(&self) -> &str;

    fn state(&self) -> TransitionState;

    /// Begin the entering animation.
    fn enter(&mut self);

    fn update(&mut self, tick: &TickContext);

    /// Begin the exiting animation.
    fn exit(&mut self);

    /// Fully entered; the covered work may start.
    fn is_ready(&self) -> bool {
        self.state() == TransitionState::Running
    }

    /// Done with its own work; the orchestrator may exit it once loading is done too.
    fn is_complete(&self) -> bool;

    /// Loading progress last reported to this transition, in `[0, 1]`.
    fn progress(&self) -> f32;

    fn current_action(&self) -> &str;

    fn report_progress(&mut self, progress: f32, action: &str);

    /// Called once the transition is discarded.
    fn cleanup(&mut self) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionStatus {
    pub name: String,
    pub state: TransitionState,
    pub progress: f32,
    pub action: String,
}

impl TransitionStatus {
    pub fn of(transition: &dyn Transition) -> Self {
        Self {
            name: transition.name().to_string(),
            state: transition.state(),
            progress: transition.progress(),
            action: transition.current_action().to_string(),
        }
    }
}
