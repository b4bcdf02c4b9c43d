// Tickframe Library - cooperative lifecycle orchestration for tick-driven applications
// This exposes the runtime, module and rule building blocks for hosts and tests

pub mod config;
pub mod dependencies;
pub mod error;
pub mod fsm;
pub mod module;
pub mod orchestrator;
pub mod rules;
pub mod runtime;
pub mod stats;
pub mod telemetry;
pub mod time;
pub mod transition;

// Re-export key types for easy access
pub use config::{config, init_config, RuntimeConfig};
pub use dependencies::{CapabilityRegistry, DependencyProvider, DependencySource, Injector};
pub use error::{DependencyError, FaultKind, RuleFault, RuntimeError, ValidationError};
pub use fsm::{CycleDriver, Fsm, FsmState, QueueDriver, StackDriver, StateControl, StateRequest};
pub use module::{
    ExceptionPolicy, FnSetup, Module, ModuleBuilder, ModuleSetup, ModuleState, OnExceptionBehaviour,
    PerformancePolicy, SharedSetup,
};
pub use orchestrator::{Orchestrator, OrchestratorState, OrchestratorStatus};
pub use rules::{
    Completion, LifecycleHandle, Rule, RuleContext, RuleKey, RulePhase, RuleScheduling, RuleSet,
    RuleState,
};
pub use runtime::{Runtime, RuntimeBuilder};
pub use stats::{RuntimeSnapshot, RuntimeStats};
pub use telemetry::{create_module_span, create_orchestrator_span, generate_correlation_id, init_telemetry};
pub use time::{Clock, TickContext};
pub use transition::{TimedTransition, Transition, TransitionState};
