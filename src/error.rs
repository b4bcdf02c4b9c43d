// Error taxonomy for the lifecycle runtime

use std::time::Duration;
use thiserror::Error;

use crate::dependencies::DependencySource;
use crate::rules::RulePhase;

/// Misuse caught at the call site. Never ignored silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown state {state}")]
    UnknownState { state: String },
    #[error("State {state} is already registered")]
    DuplicateState { state: String },
    #[error("Cannot remove active state {state}")]
    ActiveStateRemoval { state: String },
    #[error("State machine already started")]
    AlreadyStarted,
    #[error("State machine not started")]
    NotStarted,
    #[error("Rule type {rule} is already registered")]
    DuplicateRule { rule: String },
    #[error("Rule type {rule} is not registered in module {module}")]
    UnknownRule { rule: String, module: String },
    #[error("Invalid schedule for {rule}: frequency {frequency}, offset {offset}")]
    InvalidSchedule {
        rule: String,
        frequency: i64,
        offset: i64,
    },
    #[error("Capability {capability} already provided by {existing}")]
    DuplicateProvider {
        capability: String,
        existing: String,
    },
    #[error("Rule {rule} already provides {existing}, cannot also provide {capability}")]
    MultipleCapabilities {
        rule: String,
        existing: String,
        capability: String,
    },
    #[error("Driver queue is empty")]
    EmptyQueue,
    #[error("Index {index} out of range for driver of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Cannot remove the state under the driver cursor at {index}")]
    CursorRemoval { index: usize },
}

/// A required capability could not be found in any reachable scope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Rule {dependent} requires {capability} from {scope} scope, but no provider was found")]
pub struct DependencyError {
    pub dependent: String,
    pub capability: String,
    pub scope: DependencySource,
}

/// What went wrong inside a rule.
#[derive(Debug, Error)]
pub enum FaultKind {
    #[error("{0:#}")]
    Error(anyhow::Error),
    #[error("stalled for {elapsed:?} (timeout {timeout:?})")]
    Stall { elapsed: Duration, timeout: Duration },
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A fault attributed to one rule during one lifecycle phase.
#[derive(Debug, Error)]
#[error("Rule {rule} faulted during {phase}: {kind}")]
pub struct RuleFault {
    pub rule: String,
    pub phase: RulePhase,
    pub kind: FaultKind,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl RuleFault {
    pub fn new(rule: impl Into<String>, phase: RulePhase, kind: FaultKind) -> Self {
        Self {
            rule: rule.into(),
            phase,
            kind,
            at: chrono::Utc::now(),
        }
    }

    pub fn is_stall(&self) -> bool {
        matches!(self.kind, FaultKind::Stall { .. })
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Fault(#[from] RuleFault),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
