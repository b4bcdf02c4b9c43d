// State sequencing policies layered on top of an Fsm
//
// Drivers only decide which state to request next. They never touch the
// active state directly; every change goes through a StateRequester.

use std::collections::VecDeque;

use super::{Priority, StateId, StateRequest, StateRequester};
use crate::error::ValidationError;

/// Cycles through an ordered list of states.
#[derive(Debug, Clone)]
pub struct CycleDriver<Id> {
    states: Vec<Id>,
    cursor: usize,
}

impl<Id: StateId> CycleDriver<Id> {
    pub fn new(states: Vec<Id>) -> Self {
        Self { states, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&Id> {
        self.states.get(self.cursor)
    }

    /// Advance the cursor (wrapping) and request the state under it.
    pub fn move_to_next<R: StateRequester<Id>>(
        &mut self,
        fsm: &mut R,
        priority: Priority,
    ) -> Result<Id, ValidationError> {
        if self.states.is_empty() {
            return Err(ValidationError::EmptyQueue);
        }
        self.cursor = (self.cursor + 1) % self.states.len();
        let target = self.states[self.cursor].clone();
        fsm.request_state(StateRequest::to(target.clone()).priority(priority))?;
        Ok(target)
    }

    pub fn insert(&mut self, index: usize, id: Id) -> Result<(), ValidationError> {
        if index > self.states.len() {
            return Err(ValidationError::IndexOutOfRange {
                index,
                len: self.states.len(),
            });
        }
        self.states.insert(index, id);
        if index <= self.cursor && self.states.len() > 1 {
            self.cursor += 1;
        }
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<Id, ValidationError> {
        if index >= self.states.len() {
            return Err(ValidationError::IndexOutOfRange {
                index,
                len: self.states.len(),
            });
        }
        if index == self.cursor {
            return Err(ValidationError::CursorRemoval { index });
        }
        let removed = self.states.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        Ok(removed)
    }
}

/// FIFO of upcoming states.
#[derive(Debug, Clone, Default)]
pub struct QueueDriver<Id> {
    queue: VecDeque<Id>,
}

impl<Id: StateId> QueueDriver<Id> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn from_states(states: impl IntoIterator<Item = Id>) -> Self {
        Self {
            queue: states.into_iter().collect(),
        }
    }

    pub fn enqueue(&mut self, id: Id) {
        self.queue.push_back(id);
    }

    pub fn peek(&self) -> Option<&Id> {
        self.queue.front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.queue.contains(id)
    }

    /// Pop the next state and request it. Fails on an empty queue.
    pub fn dequeue<R: StateRequester<Id>>(
        &mut self,
        fsm: &mut R,
        priority: Priority,
        immediate: bool,
    ) -> Result<Id, ValidationError> {
        let target = self.queue.pop_front().ok_or(ValidationError::EmptyQueue)?;
        let mut request = StateRequest::to(target.clone()).priority(priority);
        if immediate {
            request = request.immediate();
        }
        fsm.request_state(request)?;
        Ok(target)
    }

    /// Like [`QueueDriver::dequeue`] but reports an empty queue as `false`.
    pub fn try_dequeue<R: StateRequester<Id>>(
        &mut self,
        fsm: &mut R,
        priority: Priority,
        immediate: bool,
    ) -> Result<bool, ValidationError> {
        if self.queue.is_empty() {
            return Ok(false);
        }
        self.dequeue(fsm, priority, immediate).map(|_| true)
    }

    /// Drop every queued state ahead of `id`. Returns how many were skipped,
    /// or `None` when `id` is not queued (the queue is left untouched).
    pub fn skip_until(&mut self, id: &Id) -> Option<usize> {
        let position = self.queue.iter().position(|queued| queued == id)?;
        self.queue.drain(..position);
        Some(position)
    }
}

/// Push/pop navigation: `pop` returns to the state active before the matching `push`.
#[derive(Debug, Clone, Default)]
pub struct StackDriver<Id> {
    stack: Vec<Id>,
}

impl<Id: StateId> StackDriver<Id> {
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn push<R: StateRequester<Id>>(
        &mut self,
        fsm: &mut R,
        target: Id,
        priority: Priority,
    ) -> Result<(), ValidationError> {
        let previous = fsm.current_state().cloned();
        fsm.request_state(StateRequest::to(target).priority(priority))?;
        if let Some(previous) = previous {
            self.stack.push(previous);
        }
        Ok(())
    }

    pub fn pop<R: StateRequester<Id>>(
        &mut self,
        fsm: &mut R,
        priority: Priority,
    ) -> Result<Id, ValidationError> {
        let target = self.stack.last().cloned().ok_or(ValidationError::EmptyQueue)?;
        fsm.request_state(StateRequest::to(target.clone()).priority(priority))?;
        self.stack.pop();
        Ok(target)
    }
}
