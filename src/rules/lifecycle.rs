// Atomic rule lifecycle flag
//
// The module polls this flag every tick. Rules doing background work keep a
// cloned LifecycleHandle and complete their phase from any thread.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Lifecycle of a single rule. Forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum RuleState {
    Unused = 0,
    Initializing = 1,
    Initialized = 2,
    Unloading = 3,
    Unloaded = 4,
}

impl RuleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RuleState::Unused,
            1 => RuleState::Initializing,
            2 => RuleState::Initialized,
            3 => RuleState::Unloading,
            _ => RuleState::Unloaded,
        }
    }

    /// A phase is in flight and waiting for its completion call.
    pub fn is_pending(self) -> bool {
        matches!(self, RuleState::Initializing | RuleState::Unloading)
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RuleState::Unused => "unused",
            RuleState::Initializing => "initializing",
            RuleState::Initialized => "initialized",
            RuleState::Unloading => "unloading",
            RuleState::Unloaded => "unloaded",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug)]
struct LifecycleCell {
    state: AtomicU8,
    error: AtomicBool,
}

/// Shared, thread-safe view of one rule's lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    cell: Arc<LifecycleCell>,
}

impl Default for LifecycleHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleHandle {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(LifecycleCell {
                state: AtomicU8::new(RuleState::Unused as u8),
                error: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> RuleState {
        RuleState::from_u8(self.cell.state.load(Ordering::Acquire))
    }

    pub fn has_error(&self) -> bool {
        self.cell.error.load(Ordering::Acquire)
    }

    /// Complete initialization. Only valid while `Initializing`.
    pub fn mark_initialized(&self) -> bool {
        let done = self.advance(RuleState::Initializing, RuleState::Initialized);
        if !done {
            warn!(state = %self.state(), "mark_initialized called outside of initialization");
        }
        done
    }

    /// Complete unloading. Only valid while `Unloading`.
    pub fn mark_unloaded(&self) -> bool {
        let done = self.advance(RuleState::Unloading, RuleState::Unloaded);
        if !done {
            warn!(state = %self.state(), "mark_unloaded called outside of unloading");
        }
        done
    }

    /// Flag the rule as faulted. A rule that never started, or has a phase in
    /// flight, is moved straight to `Unloaded`.
    pub fn mark_error(&self) {
        self.cell.error.store(true, Ordering::Release);
        for from in [
            RuleState::Unused,
            RuleState::Initializing,
            RuleState::Unloading,
        ] {
            if self.advance(from, RuleState::Unloaded) {
                break;
            }
        }
    }

    pub(crate) fn advance(&self, from: RuleState, to: RuleState) -> bool {
        self.cell
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
