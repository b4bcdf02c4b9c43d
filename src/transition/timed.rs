use statig::prelude::*;
use std::fmt;

use super::{Transition as TransitionHooks, TransitionState};
use crate::time::TickContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurtainEvent {
    Enter,
    Tick,
    Exit,
}

/// Tick counts for each animated section of a [`TimedTransition`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurtainTiming {
    pub enter_ticks: u32,
    /// Ticks to stay fully shown before reporting completion.
    pub hold_ticks: u32,
    pub exit_ticks: u32,
}

#[derive(Debug, Default)]
pub struct Curtain {
    timing: CurtainTiming,
}

impl Curtain {
    fn after_exit(&self) -> State {
        if self.timing.exit_ticks == 0 {
            State::inactive()
        } else {
            State::exiting(0)
        }
    }

    fn after_enter(&self) -> State {
        if self.timing.enter_ticks == 0 {
            State::running(0)
        } else {
            State::entering(0)
        }
    }
}

#[state_machine(initial = "State::inactive()", state(derive(Debug, Clone, PartialEq, Eq)))]
impl Curtain {
    #[state]
    fn inactive(&mut self, event: &CurtainEvent) -> Outcome<State> {
        match event {
            CurtainEvent::Enter => Outcome::Transition(self.after_enter()),
            _ => Outcome::Handled,
        }
    }

    #[state]
    fn entering(&mut self, elapsed: &mut u32, event: &CurtainEvent) -> Outcome<State> {
        match event {
            CurtainEvent::Tick => {
                *elapsed += 1;
                if *elapsed >= self.timing.enter_ticks {
                    tracing::debug!(ticks = *elapsed, "Curtain fully shown");
                    Outcome::Transition(State::running(0))
                } else {
                    Outcome::Handled
                }
            }
            CurtainEvent::Exit => Outcome::Transition(self.after_exit()),
            CurtainEvent::Enter => Outcome::Handled,
        }
    }

    #[state]
    fn running(&mut self, elapsed: &mut u32, event: &CurtainEvent) -> Outcome<State> {
        match event {
            CurtainEvent::Tick => {
                *elapsed = elapsed.saturating_add(1);
                Outcome::Handled
            }
            CurtainEvent::Exit => Outcome::Transition(self.after_exit()),
            CurtainEvent::Enter => Outcome::Handled,
        }
    }

    #[state]
    fn exiting(&mut self, elapsed: &mut u32, event: &CurtainEvent) -> Outcome<State> {
        match event {
            CurtainEvent::Tick => {
                *elapsed += 1;
                if *elapsed >= self.timing.exit_ticks {
                    Outcome::Transition(State::inactive())
                } else {
                    Outcome::Handled
                }
            }
            CurtainEvent::Enter => Outcome::Transition(self.after_enter()),
            CurtainEvent::Exit => Outcome::Handled,
        }
    }
}

/// Transition that enters, holds and exits over fixed tick counts.
pub struct TimedTransition {
    name: String,
    timing: CurtainTiming,
    machine: StateMachine<Curtain>,
    started: bool,
    progress: f32,
    action: String,
}

impl TimedTransition {
    pub fn new(name: impl Into<String>, timing: CurtainTiming) -> Self {
        Self {
            name: name.into(),
            timing,
            machine: Curtain { timing }.state_machine(),
            started: false,
            progress: 0.0,
            action: String::new(),
        }
    }

    /// Enter and exit over `ticks` ticks each, complete as soon as shown.
    pub fn fade(name: impl Into<String>, ticks: u32) -> Self {
        Self::new(
            name,
            CurtainTiming {
                enter_ticks: ticks,
                hold_ticks: 0,
                exit_ticks: ticks,
            },
        )
    }

    pub fn timing(&self) -> CurtainTiming {
        self.timing
    }
}

impl TransitionHooks for TimedTransition {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> TransitionState {
        if !self.started {
            return TransitionState::Inactive;
        }
        match self.machine.state() {
            State::Inactive { .. } => TransitionState::Inactive,
            State::Entering { .. } => TransitionState::Entering,
            State::Running { .. } => TransitionState::Running,
            State::Exiting { .. } => TransitionState::Exiting,
        }
    }

    fn enter(&mut self) {
        self.started = true;
        self.machine.handle(&CurtainEvent::Enter);
    }

    fn update(&mut self, _tick: &TickContext) {
        if self.started {
            self.machine.handle(&CurtainEvent::Tick);
        }
    }

    fn exit(&mut self) {
        if self.started {
            self.machine.handle(&CurtainEvent::Exit);
        }
    }

    fn is_complete(&self) -> bool {
        self.started
            && matches!(
                self.machine.state(),
                State::Running { elapsed } if *elapsed >= self.timing.hold_ticks
            )
    }

    fn progress(&self) -> f32 {
        self.progress
    }

    fn current_action(&self) -> &str {
        &self.action
    }

    fn report_progress(&mut self, progress: f32, action: &str) {
        self.progress = progress.clamp(0.0, 1.0);
        if self.action != action {
            self.action = action.to_string();
        }
    }
}

impl fmt::Debug for TimedTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedTransition")
            .field("name", &self.name)
            .field("timing", &self.timing)
            .field("state", &self.state())
            .field("progress", &self.progress)
            .finish()
    }
}
