//! Generic finite state machine
//!
//! The machine owns its states (keyed by an opaque id, in insertion order), a
//! context value shared by every state, and a single pending-transition slot.
//! Transition requests compete for that slot by priority; the winner is applied
//! either on the next [`Fsm::update`] or, for immediate requests, synchronously.
//!
//! States never hold a reference to their machine. Hooks receive the context and
//! a [`StateControl`] through which they can request transitions.

pub mod drivers;

use indexmap::IndexMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ValidationError;

pub use drivers::{CycleDriver, QueueDriver, StackDriver};

/// Identifier of a state. Any small comparable value works, usually a fieldless enum.
pub trait StateId: Clone + Eq + Hash + Debug + 'static {}

impl<T: Clone + Eq + Hash + Debug + 'static> StateId for T {}

pub type Priority = i32;

/// Upper bound on transitions chained from `enter` hooks within one drain.
const MAX_TRANSITION_CHAIN: usize = 64;

/// A request to change the active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRequest<Id> {
    pub target: Id,
    pub immediate: bool,
    pub ignore_if_current: bool,
    pub priority: Priority,
}

impl<Id> StateRequest<Id> {
    pub fn to(target: Id) -> Self {
        Self {
            target,
            immediate: false,
            ignore_if_current: false,
            priority: 0,
        }
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn ignore_if_current(mut self) -> Self {
        self.ignore_if_current = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// The transition waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransition<Id> {
    pub target: Id,
    pub priority: Priority,
    pub immediate: bool,
}

/// Lifecycle hooks of a single state. Every hook has an empty default.
pub trait FsmState<Id, Ctx> {
    fn id(&self) -> Id;

    /// Called once for every state when the machine starts.
    fn initialize(&mut self, _ctx: &mut Ctx) {}

    fn enter(&mut self, _ctx: &mut Ctx, _control: &mut StateControl<Id>) {}

    fn update(&mut self, _ctx: &mut Ctx, _control: &mut StateControl<Id>) {}

    fn exit(&mut self, _ctx: &mut Ctx) {}

    /// Called once for every state when the machine stops.
    fn unload(&mut self, _ctx: &mut Ctx) {}
}

/// Anything that accepts transition requests: the machine itself, or the
/// control handle given to a running hook. Drivers are written against this.
pub trait StateRequester<Id> {
    fn request_state(&mut self, request: StateRequest<Id>) -> Result<(), ValidationError>;

    fn current_state(&self) -> Option<&Id>;
}

/// Transition bookkeeping shared between the machine and its hooks.
#[derive(Debug)]
pub struct StateControl<Id> {
    machine: String,
    registered: Vec<Id>,
    current: Option<Id>,
    pending: Option<PendingTransition<Id>>,
}

impl<Id: StateId> StateControl<Id> {
    fn new(machine: String) -> Self {
        Self {
            machine,
            registered: Vec::new(),
            current: None,
            pending: None,
        }
    }

    pub fn current(&self) -> Option<&Id> {
        self.current.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingTransition<Id>> {
        self.pending.as_ref()
    }

    pub fn is_registered(&self, id: &Id) -> bool {
        self.registered.contains(id)
    }

    /// Arbitrate a request against the pending slot. Returns whether it took the slot.
    fn offer(&mut self, request: StateRequest<Id>) -> Result<bool, ValidationError> {
        if !self.is_registered(&request.target) {
            return Err(ValidationError::UnknownState {
                state: format!("{:?}", request.target),
            });
        }

        if request.ignore_if_current && self.current.as_ref() == Some(&request.target) {
            return Ok(false);
        }

        if let Some(pending) = &self.pending {
            if request.priority < pending.priority {
                debug!(
                    machine = %self.machine,
                    requested = ?request.target,
                    pending = ?pending.target,
                    "Transition request lost to higher priority pending transition"
                );
                return Ok(false);
            }
            if request.priority == pending.priority {
                warn!(
                    machine = %self.machine,
                    requested = ?request.target,
                    replaced = ?pending.target,
                    priority = pending.priority,
                    "Conflicting transitions with equal priority, keeping the newest"
                );
            }
        }

        self.pending = Some(PendingTransition {
            target: request.target,
            priority: request.priority,
            immediate: request.immediate,
        });
        Ok(true)
    }

    fn pending_is_immediate(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| p.immediate)
    }
}

impl<Id: StateId> StateRequester<Id> for StateControl<Id> {
    /// Immediate requests made from a hook are applied as soon as the hook returns.
    fn request_state(&mut self, request: StateRequest<Id>) -> Result<(), ValidationError> {
        self.offer(request).map(|_| ())
    }

    fn current_state(&self) -> Option<&Id> {
        self.current.as_ref()
    }
}

/// Priority-arbitrated state machine over `Id`, owning a context of type `Ctx`.
pub struct Fsm<Id: StateId, Ctx> {
    states: IndexMap<Id, Box<dyn FsmState<Id, Ctx>>>,
    control: StateControl<Id>,
    initial: Id,
    context: Ctx,
    started: bool,
    entered_at: Option<Instant>,
    last_state_duration: Duration,
}

impl<Id: StateId, Ctx> Fsm<Id, Ctx> {
    pub fn new(name: impl Into<String>, initial: Id, context: Ctx) -> Self {
        Self {
            states: IndexMap::new(),
            control: StateControl::new(name.into()),
            initial,
            context,
            started: false,
            entered_at: None,
            last_state_duration: Duration::ZERO,
        }
    }

    pub fn name(&self) -> &str {
        &self.control.machine
    }

    pub fn context(&self) -> &Ctx {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Ctx {
        &mut self.context
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn current_state(&self) -> Option<&Id> {
        self.control.current.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingTransition<Id>> {
        self.control.pending.as_ref()
    }

    pub fn contains_state(&self, id: &Id) -> bool {
        self.states.contains_key(id)
    }

    pub fn state_ids(&self) -> impl Iterator<Item = &Id> {
        self.states.keys()
    }

    /// Time spent in the current state so far.
    pub fn time_in_state(&self) -> Duration {
        self.entered_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Time spent in the previous state before the last switch.
    pub fn last_state_duration(&self) -> Duration {
        self.last_state_duration
    }

    pub fn add_state(&mut self, state: Box<dyn FsmState<Id, Ctx>>) -> Result<(), ValidationError> {
        let id = state.id();
        if self.states.contains_key(&id) {
            return Err(ValidationError::DuplicateState {
                state: format!("{:?}", id),
            });
        }

        self.control.registered.push(id.clone());
        self.states.insert(id.clone(), state);

        if self.started {
            if let Some(state) = self.states.get_mut(&id) {
                state.initialize(&mut self.context);
            }
        }
        Ok(())
    }

    pub fn with_state(mut self, state: Box<dyn FsmState<Id, Ctx>>) -> Result<Self, ValidationError> {
        self.add_state(state)?;
        Ok(self)
    }

    pub fn remove_state(&mut self, id: &Id) -> Result<(), ValidationError> {
        if self.control.current.as_ref() == Some(id) {
            return Err(ValidationError::ActiveStateRemoval {
                state: format!("{:?}", id),
            });
        }

        let Some(mut state) = self.states.shift_remove(id) else {
            return Err(ValidationError::UnknownState {
                state: format!("{:?}", id),
            });
        };

        self.control.registered.retain(|known| known != id);
        if self.control.pending.as_ref().is_some_and(|p| &p.target == id) {
            self.control.pending = None;
        }
        if self.started {
            state.unload(&mut self.context);
        }
        Ok(())
    }

    /// Initialize every state, then enter the initial state.
    pub fn start(&mut self) -> Result<(), ValidationError> {
        if self.started {
            return Err(ValidationError::AlreadyStarted);
        }
        if !self.states.contains_key(&self.initial) {
            return Err(ValidationError::UnknownState {
                state: format!("{:?}", self.initial),
            });
        }

        for state in self.states.values_mut() {
            state.initialize(&mut self.context);
        }

        self.started = true;
        let initial = self.initial.clone();
        self.control.current = Some(initial.clone());
        self.entered_at = Some(Instant::now());
        debug!(machine = %self.control.machine, state = ?initial, "State machine started");

        if let Some(state) = self.states.get_mut(&initial) {
            state.enter(&mut self.context, &mut self.control);
        }
        if self.control.pending_is_immediate() {
            self.drain_pending();
        }
        Ok(())
    }

    /// Apply pending transitions, then update the current state.
    pub fn update(&mut self) -> Result<(), ValidationError> {
        if !self.started {
            return Err(ValidationError::NotStarted);
        }

        self.drain_pending();

        if let Some(current) = self.control.current.clone() {
            if let Some(state) = self.states.get_mut(&current) {
                state.update(&mut self.context, &mut self.control);
            }
        }
        if self.control.pending_is_immediate() {
            self.drain_pending();
        }
        Ok(())
    }

    pub fn set_state(&mut self, request: StateRequest<Id>) -> Result<(), ValidationError> {
        let immediate = request.immediate;
        let accepted = self.control.offer(request)?;
        if accepted && immediate && self.started {
            self.drain_pending();
        }
        Ok(())
    }

    /// Exit the current state and unload every state.
    pub fn stop(&mut self) -> Result<(), ValidationError> {
        if !self.started {
            return Err(ValidationError::NotStarted);
        }

        if let Some(current) = self.control.current.take() {
            if let Some(state) = self.states.get_mut(&current) {
                state.exit(&mut self.context);
            }
        }
        for state in self.states.values_mut() {
            state.unload(&mut self.context);
        }

        self.control.pending = None;
        self.entered_at = None;
        self.started = false;
        debug!(machine = %self.control.machine, "State machine stopped");
        Ok(())
    }

    fn drain_pending(&mut self) {
        let mut chained = 0;
        while let Some(pending) = self.control.pending.take() {
            if chained == MAX_TRANSITION_CHAIN {
                warn!(
                    machine = %self.control.machine,
                    target = ?pending.target,
                    "Transition chain limit reached, deferring to next update"
                );
                self.control.pending = Some(pending);
                return;
            }
            self.switch_to(pending.target);
            chained += 1;
        }
    }

    fn switch_to(&mut self, target: Id) {
        if let Some(entered_at) = self.entered_at.take() {
            self.last_state_duration = entered_at.elapsed();
        }

        let previous = self.control.current.take();
        if let Some(previous) = &previous {
            if let Some(state) = self.states.get_mut(previous) {
                state.exit(&mut self.context);
            }
        }

        debug!(
            machine = %self.control.machine,
            from = ?previous,
            to = ?target,
            "State transition"
        );

        self.control.current = Some(target.clone());
        self.control.pending = None;
        if let Some(state) = self.states.get_mut(&target) {
            state.enter(&mut self.context, &mut self.control);
        }
        self.entered_at = Some(Instant::now());
    }
}

impl<Id: StateId, Ctx> StateRequester<Id> for Fsm<Id, Ctx> {
    fn request_state(&mut self, request: StateRequest<Id>) -> Result<(), ValidationError> {
        self.set_state(request)
    }

    fn current_state(&self) -> Option<&Id> {
        self.control.current.as_ref()
    }
}

impl<Id: StateId, Ctx> std::fmt::Debug for Fsm<Id, Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("name", &self.control.machine)
            .field("states", &self.control.registered)
            .field("current", &self.control.current)
            .field("pending", &self.control.pending)
            .field("started", &self.started)
            .finish()
    }
}
