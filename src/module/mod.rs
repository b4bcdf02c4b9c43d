//! Modules: a set of rules driven through a fixed six-phase lifecycle
//!
//! `Setup -> DependencyInjection -> InitializeRules -> UpdateRules ->
//! UnloadRules -> End`. The phases are queued on a [`QueueDriver`]; an unload
//! request fast-forwards the queue to `UnloadRules` with a priority no regular
//! phase advance can override.

mod phases;
pub mod policy;
pub mod setup;

use serde::Serialize;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::dependencies::DependencyProvider;
use crate::error::{FaultKind, RuleFault, ValidationError};
use crate::fsm::{Fsm, FsmState, Priority, QueueDriver, StateControl, StateRequester};
use crate::rules::rule_set::RuleEnv;
use crate::rules::{RuleEntry, RuleKey, RulePhase, RuleScheduling, RuleSet, RuleState};
use crate::stats::RuntimeStats;
use crate::telemetry::{create_module_span, generate_correlation_id};
use crate::time::TickContext;

pub use policy::{
    Escalation, ExceptionPolicy, LoadStage, OnExceptionBehaviour, PerformancePolicy,
};
pub use setup::{FnSetup, ModuleBuilder, ModuleDefaults, ModuleSetup, SharedSetup};

const PHASE_PRIORITY: Priority = 0;
const UNLOAD_PRIORITY: Priority = 10;
const MAX_FAULT_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ModuleState {
    #[default]
    Setup,
    DependencyInjection,
    InitializeRules,
    UpdateRules,
    UnloadRules,
    End,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModuleState::Setup => "setup",
            ModuleState::DependencyInjection => "dependency injection",
            ModuleState::InitializeRules => "initializing rules",
            ModuleState::UpdateRules => "running",
            ModuleState::UnloadRules => "unloading rules",
            ModuleState::End => "ended",
        };
        write!(f, "{}", label)
    }
}

/// Request from a rule to the orchestrator that owns its module.
pub enum ModuleCommand {
    AddSubmodule { category: String, setup: SharedSetup },
    RemoveSubmodule { category: String },
    SwitchTo(SharedSetup),
    UnloadSelf,
    Reload,
}

impl fmt::Debug for ModuleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleCommand::AddSubmodule { category, setup } => f
                .debug_struct("AddSubmodule")
                .field("category", category)
                .field("setup", &setup.name())
                .finish(),
            ModuleCommand::RemoveSubmodule { category } => f
                .debug_struct("RemoveSubmodule")
                .field("category", category)
                .finish(),
            ModuleCommand::SwitchTo(setup) => f.debug_tuple("SwitchTo").field(&setup.name()).finish(),
            ModuleCommand::UnloadSelf => write!(f, "UnloadSelf"),
            ModuleCommand::Reload => write!(f, "Reload"),
        }
    }
}

/// How a phase proceeds after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum FaultReaction {
    /// Move on to the next rule.
    Advance,
    /// Move past the rule, then stop for this tick.
    YieldTick,
    /// Stop for this tick without moving past the rule.
    Halt,
}

/// Scopes and shared state a module is created with.
#[derive(Clone)]
pub struct ModuleEnv {
    pub parent_provider: Option<Rc<DependencyProvider>>,
    pub services: Option<Rc<DependencyProvider>>,
    pub stats: Arc<RuntimeStats>,
    pub defaults: ModuleDefaults,
}

impl Default for ModuleEnv {
    fn default() -> Self {
        Self {
            parent_provider: None,
            services: None,
            stats: Arc::new(RuntimeStats::new()),
            defaults: ModuleDefaults::default(),
        }
    }
}

/// Context shared by every phase of one module.
pub(crate) struct ModuleCore {
    name: String,
    setup: SharedSetup,
    defaults: ModuleDefaults,
    rules: RuleSet,
    init_order: Vec<RuleKey>,
    schedule: Vec<RuleScheduling>,
    exception_policy: ExceptionPolicy,
    performance_policy: PerformancePolicy,
    phases: QueueDriver<ModuleState>,
    provider: Option<Rc<DependencyProvider>>,
    parent_provider: Option<Rc<DependencyProvider>>,
    services: Option<Rc<DependencyProvider>>,
    tick: TickContext,
    update_frame: i64,
    paused: bool,
    unload_requested: bool,
    faults: Vec<RuleFault>,
    escalation: Option<Escalation>,
    commands: Vec<ModuleCommand>,
    stats: Arc<RuntimeStats>,
}

impl ModuleCore {
    /// Run `f` on one rule with the module environment lent out.
    pub(crate) fn with_rule<T>(
        &mut self,
        key: RuleKey,
        f: impl FnOnce(&mut RuleEntry, &mut RuleEnv<'_>) -> T,
    ) -> Option<T> {
        let entry = self.rules.entry_mut(key)?;
        let mut env = RuleEnv {
            module: &self.name,
            tick: &self.tick,
            commands: &mut self.commands,
        };
        Some(f(entry, &mut env))
    }

    pub(crate) fn rule_state(&self, key: RuleKey) -> Option<RuleState> {
        self.rules.entry(key).map(RuleEntry::state)
    }

    /// Run the module definition and adopt the resulting plan.
    pub(crate) fn configure(&mut self) -> FaultReaction {
        let mut builder = ModuleBuilder::new(&self.name, &self.defaults);
        let mut reaction = FaultReaction::Advance;

        if let Err(error) = self.setup.configure(&mut builder) {
            let fault = RuleFault::new(self.name.clone(), RulePhase::Setup, FaultKind::Error(error));
            reaction = reaction.max(self.handle_fault(fault, LoadStage::Load));
        }

        match builder.build() {
            Ok(plan) => {
                debug!(module = %self.name, rules = plan.rules.len(), "Module configured");
                self.rules = plan.rules;
                self.init_order = plan.init_order;
                self.schedule = plan.schedule;
                self.exception_policy = plan.exception_policy;
                self.performance_policy = plan.performance_policy;
            }
            Err(invalid) => {
                let fault = RuleFault::new(self.name.clone(), RulePhase::Setup, invalid.into());
                reaction = reaction.max(self.handle_fault(fault, LoadStage::Load));
            }
        }
        reaction
    }

    /// Record a fault and apply the exception policy for `stage`.
    pub(crate) fn handle_fault(&mut self, fault: RuleFault, stage: LoadStage) -> FaultReaction {
        let behaviour = self.exception_policy.behaviour_for(stage);
        self.stats.record_fault();
        if fault.is_stall() {
            self.stats.record_stall();
        }
        error!(
            module = %self.name,
            rule = %fault.rule,
            phase = %fault.phase,
            behaviour = ?behaviour,
            error = %fault.kind,
            "Rule fault"
        );

        if self.faults.len() == MAX_FAULT_HISTORY {
            self.faults.remove(0);
        }
        self.faults.push(fault);

        match behaviour {
            OnExceptionBehaviour::Continue => FaultReaction::Advance,
            OnExceptionBehaviour::SkipTick => FaultReaction::YieldTick,
            OnExceptionBehaviour::PauseModule => {
                warn!(module = %self.name, "Pausing module after fault");
                self.paused = true;
                FaultReaction::Halt
            }
            OnExceptionBehaviour::UnloadModule if stage == LoadStage::Unload => FaultReaction::Advance,
            OnExceptionBehaviour::UnloadModule => {
                warn!(module = %self.name, "Unloading module after fault");
                self.unload_requested = true;
                if let Some(fallback) = self.exception_policy.fallback.clone() {
                    info!(module = %self.name, fallback = %fallback.name(), "Switching to fallback module");
                    self.commands.push(ModuleCommand::SwitchTo(fallback));
                }
                FaultReaction::Halt
            }
            OnExceptionBehaviour::PauseAll => {
                self.escalate(Escalation::PauseAll);
                self.paused = true;
                FaultReaction::Halt
            }
            OnExceptionBehaviour::StopAll => {
                self.escalate(Escalation::StopAll);
                FaultReaction::Halt
            }
        }
    }

    /// Synthesize a stall fault for a rule whose phase timed out.
    pub(crate) fn handle_stall(
        &mut self,
        key: RuleKey,
        phase: RulePhase,
        elapsed: std::time::Duration,
        timeout: Option<std::time::Duration>,
        stage: LoadStage,
    ) -> FaultReaction {
        if let Some(entry) = self.rules.entry(key) {
            entry.lifecycle().mark_error();
        }
        let fault = RuleFault::new(
            key.name(),
            phase,
            FaultKind::Stall {
                elapsed,
                timeout: timeout.unwrap_or_default(),
            },
        );
        self.handle_fault(fault, stage)
    }

    fn escalate(&mut self, escalation: Escalation) {
        warn!(module = %self.name, escalation = ?escalation, "Escalating fault beyond module");
        self.stats.record_escalation();
        self.escalation = Some(Escalation::merge(self.escalation, escalation));
    }

    /// End of a phase hook: honor a pending unload, else advance when `done`.
    pub(crate) fn conclude(&mut self, control: &mut StateControl<ModuleState>, done: bool) {
        if self.unload_requested {
            self.unload_requested = false;
            begin_unload(&mut self.phases, control, true, &self.name);
        } else if done && !self.paused {
            self.advance(control);
        }
    }

    fn advance(&mut self, control: &mut StateControl<ModuleState>) {
        if control.pending().is_some() {
            return;
        }
        if let Err(e) = self.phases.dequeue(control, PHASE_PRIORITY, true) {
            warn!(module = %self.name, error = %e, "No further module phase to advance to");
        }
    }

    /// Run fixed or late updates over the scheduled rules.
    fn run_secondary(&mut self, phase: RulePhase, frame: Option<i64>) {
        let due: Vec<RuleKey> = self
            .schedule
            .iter()
            .filter(|s| frame.map_or(true, |frame| s.is_expected_at_frame(frame)))
            .map(RuleScheduling::rule)
            .collect();

        for key in due {
            let result = self.with_rule(key, |entry, env| entry.base_update(env, phase));
            if let Some(Err(fault)) = result {
                if self.handle_fault(fault, LoadStage::Update) != FaultReaction::Advance {
                    break;
                }
            }
            if self.paused || self.unload_requested {
                break;
            }
        }
    }
}

/// Fast-forward the phase queue to `UnloadRules` and request it.
fn begin_unload<R: StateRequester<ModuleState>>(
    phases: &mut QueueDriver<ModuleState>,
    requester: &mut R,
    immediate: bool,
    module: &str,
) -> bool {
    if matches!(
        requester.current_state(),
        Some(ModuleState::UnloadRules | ModuleState::End)
    ) {
        debug!(module = module, "Unload requested while already unloading");
        return false;
    }
    let Some(skipped) = phases.skip_until(&ModuleState::UnloadRules) else {
        debug!(module = module, "Unload already scheduled");
        return false;
    };

    match phases.dequeue(requester, UNLOAD_PRIORITY, immediate) {
        Ok(_) => {
            info!(module = module, skipped_phases = skipped, "Module unload requested");
            true
        }
        Err(e) => {
            warn!(module = module, error = %e, "Failed to request module unload");
            false
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub name: String,
    pub state: RuleState,
    pub error: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub name: String,
    pub state: ModuleState,
    pub paused: bool,
    pub update_frame: i64,
    pub faults: usize,
    pub rules: Vec<RuleStatus>,
}

/// One running instance of a [`ModuleSetup`].
pub struct Module {
    fsm: Fsm<ModuleState, ModuleCore>,
    correlation_id: String,
    span: tracing::Span,
}

impl Module {
    pub fn new(setup: SharedSetup, env: ModuleEnv) -> Result<Self, ValidationError> {
        let name = setup.name().to_string();
        let correlation_id = generate_correlation_id();
        let span = create_module_span(&name, &correlation_id);

        let core = ModuleCore {
            name: name.clone(),
            setup,
            exception_policy: env.defaults.exception_policy.clone(),
            performance_policy: env.defaults.performance_policy,
            defaults: env.defaults,
            rules: RuleSet::new(),
            init_order: Vec::new(),
            schedule: Vec::new(),
            phases: QueueDriver::from_states([
                ModuleState::DependencyInjection,
                ModuleState::InitializeRules,
                ModuleState::UpdateRules,
                ModuleState::UnloadRules,
                ModuleState::End,
            ]),
            provider: None,
            parent_provider: env.parent_provider,
            services: env.services,
            tick: TickContext::default(),
            update_frame: 0,
            paused: false,
            unload_requested: false,
            faults: Vec::new(),
            escalation: None,
            commands: Vec::new(),
            stats: env.stats,
        };

        let mut fsm = Fsm::new(format!("module:{}", name), ModuleState::Setup, core);
        for phase in phases::all() {
            fsm.add_state(phase)?;
        }

        Ok(Self {
            fsm,
            correlation_id,
            span,
        })
    }

    pub fn name(&self) -> &str {
        &self.fsm.context().name
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn setup(&self) -> SharedSetup {
        self.fsm.context().setup.clone()
    }

    /// Enter `Setup`, which configures the module and queues the next phase.
    pub fn start(&mut self) -> Result<(), ValidationError> {
        let _entered = self.span.clone().entered();
        self.fsm.context().stats.record_module_loaded();
        self.fsm.start()
    }

    pub fn is_started(&self) -> bool {
        self.fsm.is_started()
    }

    pub fn state(&self) -> ModuleState {
        self.fsm.current_state().copied().unwrap_or_default()
    }

    pub fn update(&mut self, tick: &TickContext) {
        if !self.fsm.is_started() || self.fsm.context().paused {
            return;
        }
        let _entered = self.span.clone().entered();
        self.fsm.context_mut().tick = *tick;
        if let Err(e) = self.fsm.update() {
            warn!(module = %self.name(), error = %e, "Module update failed");
        }
    }

    /// Fixed-rate update for every scheduled rule. Only while running.
    pub fn fixed_update(&mut self, tick: &TickContext) {
        if !self.is_running() {
            return;
        }
        let _entered = self.span.clone().entered();
        let core = self.fsm.context_mut();
        core.tick = *tick;
        core.run_secondary(RulePhase::FixedUpdate, None);
        self.apply_unload_request();
    }

    /// Late update for the rules that ran in the most recent update.
    pub fn late_update(&mut self, tick: &TickContext) {
        if !self.is_running() {
            return;
        }
        let _entered = self.span.clone().entered();
        let core = self.fsm.context_mut();
        if core.update_frame == 0 {
            return;
        }
        core.tick = *tick;
        let frame = core.update_frame - 1;
        core.run_secondary(RulePhase::LateUpdate, Some(frame));
        self.apply_unload_request();
    }

    fn is_running(&self) -> bool {
        self.fsm.is_started()
            && !self.fsm.context().paused
            && self.state() == ModuleState::UpdateRules
    }

    pub fn pause(&mut self) {
        if !self.fsm.context().paused {
            info!(module = %self.name(), "Module paused");
            self.fsm.context_mut().paused = true;
        }
    }

    pub fn restart(&mut self) {
        if self.fsm.context().paused {
            info!(module = %self.name(), "Module resumed");
            self.fsm.context_mut().paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.fsm.context().paused
    }

    /// Request unloading. Idempotent; resumes a paused module so the unload
    /// can make progress.
    pub fn unload(&mut self) {
        let _entered = self.span.clone().entered();
        self.fsm.context_mut().paused = false;
        self.fsm.context_mut().unload_requested = true;
        self.apply_unload_request();
    }

    fn apply_unload_request(&mut self) {
        let core = self.fsm.context_mut();
        if !core.unload_requested {
            return;
        }
        core.unload_requested = false;
        let name = core.name.clone();
        let mut phases = std::mem::take(&mut core.phases);
        begin_unload(&mut phases, &mut self.fsm, false, &name);
        self.fsm.context_mut().phases = phases;
    }

    /// The module is unloading, or will start to on its next update.
    pub fn is_unloading(&self) -> bool {
        matches!(self.state(), ModuleState::UnloadRules | ModuleState::End)
            || self
                .fsm
                .pending()
                .is_some_and(|p| p.target == ModuleState::UnloadRules)
    }

    /// Fraction of the initialization order that has settled, in `[0, 1]`.
    pub fn load_progress(&self) -> f32 {
        let core = self.fsm.context();
        match self.state() {
            ModuleState::Setup | ModuleState::DependencyInjection => 0.0,
            ModuleState::InitializeRules if !core.init_order.is_empty() => {
                let settled = core
                    .init_order
                    .iter()
                    .filter(|key| {
                        matches!(
                            core.rule_state(**key),
                            Some(RuleState::Initialized | RuleState::Unloaded)
                        )
                    })
                    .count();
                settled as f32 / core.init_order.len() as f32
            }
            _ => 1.0,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.fsm.context().rules
    }

    pub fn rules_mut(&mut self) -> &mut RuleSet {
        &mut self.fsm.context_mut().rules
    }

    pub fn init_order(&self) -> &[RuleKey] {
        &self.fsm.context().init_order
    }

    pub fn schedule(&self) -> &[RuleScheduling] {
        &self.fsm.context().schedule
    }

    /// This module's provider, available once dependency injection has collected it.
    pub fn provider(&self) -> Option<Rc<DependencyProvider>> {
        self.fsm.context().provider.clone()
    }

    pub fn update_frame(&self) -> i64 {
        self.fsm.context().update_frame
    }

    pub fn faults(&self) -> &[RuleFault] {
        &self.fsm.context().faults
    }

    pub fn take_commands(&mut self) -> Vec<ModuleCommand> {
        std::mem::take(&mut self.fsm.context_mut().commands)
    }

    pub fn take_escalation(&mut self) -> Option<Escalation> {
        self.fsm.context_mut().escalation.take()
    }

    /// Call every rule's quit hook, whatever its state. Failures are collected, not fatal.
    pub fn quit(&mut self) -> Vec<RuleFault> {
        let _entered = self.span.clone().entered();
        let core = self.fsm.context_mut();
        let mut failures = Vec::new();
        for entry in core.rules.iter_mut() {
            if let Err(fault) = entry.base_quit() {
                warn!(module = %core.name, rule = %fault.rule, error = %fault.kind, "Rule quit hook failed");
                failures.push(fault);
            }
        }
        failures
    }

    pub fn status(&self) -> ModuleStatus {
        let core = self.fsm.context();
        ModuleStatus {
            name: core.name.clone(),
            state: self.state(),
            paused: core.paused,
            update_frame: core.update_frame,
            faults: core.faults.len(),
            rules: core
                .rules
                .iter()
                .map(|entry| RuleStatus {
                    name: entry.name().to_string(),
                    state: entry.state(),
                    error: entry.has_error(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("rules", &self.fsm.context().rules)
            .finish()
    }
}

// Phases need mutable access to the core from their hooks.
pub(crate) type ModulePhase = Box<dyn FsmState<ModuleState, ModuleCore>>;
