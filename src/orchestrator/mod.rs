//! Orchestrators: load, switch and unload one module at a time, optionally
//! under a transition, and own a tree of child orchestrators (submodules).
//!
//! Requests are queued as [`Operation`]s and drained one per tick while the
//! orchestrator is in `RunTransition`. The orchestrator only becomes
//! `Operational` once the queue is empty, the module is running, and the
//! transition (if any) reports completion.

mod states;

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::dependencies::DependencyProvider;
use crate::error::{RuleFault, ValidationError};
use crate::fsm::{Fsm, Priority, StateControl, StateRequest, StateRequester};
use crate::module::{
    Escalation, Module, ModuleCommand, ModuleDefaults, ModuleEnv, ModuleState, ModuleStatus,
    SharedSetup,
};
use crate::stats::RuntimeStats;
use crate::telemetry::create_orchestrator_span;
use crate::time::TickContext;
use crate::transition::{Transition, TransitionState, TransitionStatus};

const FLOW_PRIORITY: Priority = 0;
const RESET_PRIORITY: Priority = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrchestratorState {
    Wait,
    EnterTransition,
    RunTransition,
    ChangeTransition,
    Operational,
    ExitTransition,
    Reset,
}

/// Queued unit of work.
pub enum Operation {
    UnloadCurrent,
    Instantiate(SharedSetup),
    Start,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::UnloadCurrent => write!(f, "UnloadCurrent"),
            Operation::Instantiate(setup) => write!(f, "Instantiate({})", setup.name()),
            Operation::Start => write!(f, "Start"),
        }
    }
}

/// Scopes and shared state handed down the orchestrator tree.
#[derive(Clone)]
pub struct OrchestratorEnv {
    pub parent_provider: Option<Rc<DependencyProvider>>,
    pub services: Option<Rc<DependencyProvider>>,
    pub stats: Arc<RuntimeStats>,
    pub defaults: ModuleDefaults,
    pub depth: usize,
}

impl Default for OrchestratorEnv {
    fn default() -> Self {
        Self {
            parent_provider: None,
            services: None,
            stats: Arc::new(RuntimeStats::new()),
            defaults: ModuleDefaults::default(),
            depth: 0,
        }
    }
}

pub struct Submodule {
    category: String,
    orchestrator: Orchestrator,
    unloading: bool,
}

impl Submodule {
    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn is_unloading(&self) -> bool {
        self.unloading
    }
}

pub(crate) struct OrchestratorCore {
    name: String,
    env: OrchestratorEnv,
    module: Option<Module>,
    transition: Option<Box<dyn Transition>>,
    incoming: Option<Box<dyn Transition>>,
    past_transitions: Vec<Box<dyn Transition>>,
    operations: VecDeque<Operation>,
    children: Vec<Submodule>,
    tick: TickContext,
    escalation: Option<Escalation>,
}

impl OrchestratorCore {
    fn module_env(&self) -> ModuleEnv {
        ModuleEnv {
            parent_provider: self.env.parent_provider.clone(),
            services: self.env.services.clone(),
            stats: self.env.stats.clone(),
            defaults: self.env.defaults.clone(),
        }
    }

    fn has_pending_instantiate(&self) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Instantiate(_)))
    }

    pub(crate) fn enqueue_load(&mut self, setup: SharedSetup) {
        info!(orchestrator = %self.name, module = %setup.name(), "Module load queued");
        if self.module.is_some() || self.has_pending_instantiate() {
            self.operations.push_back(Operation::UnloadCurrent);
        }
        self.operations.push_back(Operation::Instantiate(setup));
        self.operations.push_back(Operation::Start);
    }

    pub(crate) fn enqueue_unload(&mut self) {
        if self.module.is_some() || self.has_pending_instantiate() {
            info!(orchestrator = %self.name, "Module unload queued");
            self.operations.push_back(Operation::UnloadCurrent);
        } else {
            debug!(orchestrator = %self.name, "Nothing to unload");
        }
    }

    pub(crate) fn enqueue_reload(&mut self) {
        let Some(setup) = self.module.as_ref().map(Module::setup) else {
            warn!(orchestrator = %self.name, "Reload requested without a module");
            return;
        };
        info!(orchestrator = %self.name, module = %setup.name(), "Module reload queued");
        self.operations.push_back(Operation::UnloadCurrent);
        self.operations.push_back(Operation::Instantiate(setup));
        self.operations.push_back(Operation::Start);
    }

    pub(crate) fn add_submodule(&mut self, category: &str, setup: SharedSetup) {
        if let Some(child) = self.children.iter_mut().find(|c| c.category == category) {
            child.unloading = false;
            child.orchestrator.load_module(setup);
            return;
        }

        let env = OrchestratorEnv {
            parent_provider: self
                .module
                .as_ref()
                .and_then(Module::provider)
                .or_else(|| self.env.parent_provider.clone()),
            services: self.env.services.clone(),
            stats: self.env.stats.clone(),
            defaults: self.env.defaults.clone(),
            depth: self.env.depth + 1,
        };
        let name = format!("{}/{}", self.name, category);

        let mut orchestrator = match Orchestrator::new(name, env) {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                error!(orchestrator = %self.name, category = category, error = %e, "Failed to create submodule");
                return;
            }
        };
        if let Err(e) = orchestrator.start() {
            error!(orchestrator = %self.name, category = category, error = %e, "Failed to start submodule");
            return;
        }
        orchestrator.load_module(setup);
        info!(orchestrator = %self.name, category = category, "Submodule added");
        self.children.push(Submodule {
            category: category.to_string(),
            orchestrator,
            unloading: false,
        });
    }

    pub(crate) fn remove_submodule(&mut self, category: &str) -> bool {
        let Some(child) = self.children.iter_mut().find(|c| c.category == category) else {
            debug!(orchestrator = %self.name, category = category, "No submodule to remove");
            return false;
        };
        info!(orchestrator = %self.name, category = category, "Submodule removal requested");
        child.unloading = true;
        child.orchestrator.unload_module();
        true
    }

    fn reset_children(&mut self) {
        for child in &mut self.children {
            child.unloading = true;
            child.orchestrator.reset();
        }
    }

    /// Reset every child not already on its way out.
    fn unload_remaining_children(&mut self) {
        for child in self.children.iter_mut().filter(|c| !c.unloading) {
            info!(orchestrator = %self.name, category = %child.category, "Unloading orphaned submodule");
            child.unloading = true;
            child.orchestrator.reset();
        }
    }

    fn has_unloading_children(&self) -> bool {
        self.children.iter().any(|c| c.unloading)
    }

    fn raise(&mut self, escalation: Escalation) {
        self.escalation = Some(Escalation::merge(self.escalation, escalation));
    }

    fn handle_command(&mut self, command: ModuleCommand) {
        debug!(orchestrator = %self.name, command = ?command, "Module command");
        match command {
            ModuleCommand::AddSubmodule { category, setup } => self.add_submodule(&category, setup),
            ModuleCommand::RemoveSubmodule { category } => {
                self.remove_submodule(&category);
            }
            ModuleCommand::SwitchTo(setup) => self.enqueue_load(setup),
            ModuleCommand::UnloadSelf => self.enqueue_unload(),
            ModuleCommand::Reload => self.enqueue_reload(),
        }
    }

    fn tick_module(&mut self) {
        let Some(module) = self.module.as_mut() else {
            return;
        };
        module.update(&self.tick);
        let commands = module.take_commands();
        let escalation = module.take_escalation();

        for command in commands {
            self.handle_command(command);
        }
        if let Some(escalation) = escalation {
            self.raise(escalation);
        }
    }

    fn tick_children(&mut self) {
        let mut escalations = Vec::new();
        for child in &mut self.children {
            child.orchestrator.update(&self.tick);
            escalations.extend(child.orchestrator.take_escalation());
        }
        for escalation in escalations {
            self.raise(escalation);
        }

        let name = &self.name;
        self.children.retain(|child| {
            let finished = child.unloading && child.orchestrator.is_idle();
            if finished {
                info!(orchestrator = %name, category = %child.category, "Submodule removed");
            }
            !finished
        });
    }

    fn tick_transitions(&mut self) {
        if let Some(transition) = self.transition.as_mut() {
            transition.update(&self.tick);
        }
        for transition in &mut self.past_transitions {
            transition.update(&self.tick);
        }
        self.past_transitions.retain_mut(|transition| {
            let done = transition.state() == TransitionState::Inactive;
            if done {
                transition.cleanup();
            }
            !done
        });
    }

    /// Move the current transition to the background and start exiting it.
    fn retire_transition(&mut self) {
        if let Some(mut transition) = self.transition.take() {
            transition.exit();
            self.env.stats.record_transition();
            self.past_transitions.push(transition);
        }
    }

    /// Drop the module once it has ended. Returns whether one was dropped.
    fn destroy_finished_module(&mut self) -> bool {
        let finished = self
            .module
            .as_ref()
            .is_some_and(|m| m.state() == ModuleState::End || (!m.is_started() && m.is_unloading()));
        if finished {
            if let Some(module) = self.module.take() {
                info!(orchestrator = %self.name, module = %module.name(), "Module destroyed");
            }
        }
        finished
    }

    fn report_progress(&mut self) {
        let (Some(transition), Some(module)) = (self.transition.as_mut(), self.module.as_ref())
        else {
            return;
        };
        let action = format!("{}: {}", module.name(), module.state());
        transition.report_progress(module.load_progress(), &action);
    }

    fn next_transition(&self) -> Option<Box<dyn Transition>> {
        let incoming = self.operations.iter().find_map(|op| match op {
            Operation::Instantiate(setup) => Some(setup.clone()),
            _ => None,
        });
        incoming
            .or_else(|| self.module.as_ref().map(Module::setup))
            .and_then(|setup| setup.transition())
    }

    /// Leave a resting state to work through queued operations.
    fn begin_operations(&mut self, control: &mut StateControl<OrchestratorState>) {
        if self.operations.is_empty() {
            return;
        }
        let target = match self.next_transition() {
            Some(next) if self.transition.is_some() => {
                self.incoming = Some(next);
                OrchestratorState::ChangeTransition
            }
            Some(next) => {
                self.transition = Some(next);
                OrchestratorState::EnterTransition
            }
            None => {
                self.retire_transition();
                OrchestratorState::RunTransition
            }
        };
        request(control, target, &self.name);
    }

    /// Execute the next queued operation, unless an unload is still in flight.
    fn run_next_operation(&mut self) {
        if self.has_unloading_children() {
            return;
        }
        if self.module.as_ref().is_some_and(Module::is_unloading) {
            return;
        }
        let Some(operation) = self.operations.pop_front() else {
            return;
        };
        debug!(orchestrator = %self.name, operation = ?operation, "Running operation");

        match operation {
            Operation::UnloadCurrent => match self.module.as_ref().map(Module::is_started) {
                Some(true) => {
                    if let Some(module) = self.module.as_mut() {
                        module.unload();
                    }
                }
                // Never started, nothing to unwind
                Some(false) => self.module = None,
                None => debug!(orchestrator = %self.name, "No module to unload"),
            },
            Operation::Instantiate(setup) => {
                if let Some(module) = self.module.as_mut() {
                    warn!(orchestrator = %self.name, module = %module.name(), "Unloading module before instantiating another");
                    module.unload();
                    self.operations.push_front(Operation::Instantiate(setup));
                    return;
                }
                match Module::new(setup, self.module_env()) {
                    Ok(module) => {
                        info!(orchestrator = %self.name, module = %module.name(), "Module instantiated");
                        self.module = Some(module);
                    }
                    Err(e) => error!(orchestrator = %self.name, error = %e, "Failed to instantiate module"),
                }
            }
            Operation::Start => {
                if let Some(module) = self.module.as_mut().filter(|m| !m.is_started()) {
                    if let Err(e) = module.start() {
                        error!(orchestrator = %self.name, module = %module.name(), error = %e, "Failed to start module");
                    }
                }
            }
        }
    }

    /// Queue drained, module running or gone, transition done.
    fn load_settled(&self) -> bool {
        self.operations.is_empty()
            && !self.has_unloading_children()
            && self.module.as_ref().map_or(true, |m| {
                m.is_started() && matches!(m.state(), ModuleState::UpdateRules | ModuleState::End)
            })
            && self.transition.as_ref().map_or(true, |t| t.is_complete())
    }

    fn is_idle(&self) -> bool {
        self.module.is_none() && self.operations.is_empty() && self.children.is_empty()
    }
}

fn request(control: &mut StateControl<OrchestratorState>, target: OrchestratorState, name: &str) {
    let request = StateRequest::to(target).priority(FLOW_PRIORITY).immediate();
    if let Err(e) = control.request_state(request) {
        error!(orchestrator = name, target = ?target, error = %e, "Orchestrator transition rejected");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmoduleStatus {
    pub category: String,
    pub unloading: bool,
    pub status: OrchestratorStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub name: String,
    pub state: OrchestratorState,
    pub module: Option<ModuleStatus>,
    pub transition: Option<TransitionStatus>,
    pub pending_operations: usize,
    pub submodules: Vec<SubmoduleStatus>,
}

pub struct Orchestrator {
    fsm: Fsm<OrchestratorState, OrchestratorCore>,
    span: tracing::Span,
}

impl Orchestrator {
    pub fn new(name: impl Into<String>, env: OrchestratorEnv) -> Result<Self, ValidationError> {
        let name = name.into();
        let span = create_orchestrator_span(&name, env.depth);
        let core = OrchestratorCore {
            name: name.clone(),
            env,
            module: None,
            transition: None,
            incoming: None,
            past_transitions: Vec::new(),
            operations: VecDeque::new(),
            children: Vec::new(),
            tick: TickContext::default(),
            escalation: None,
        };

        let mut fsm = Fsm::new(format!("orchestrator:{}", name), OrchestratorState::Wait, core);
        for state in states::all() {
            fsm.add_state(state)?;
        }
        Ok(Self { fsm, span })
    }

    pub fn start(&mut self) -> Result<(), ValidationError> {
        self.fsm.start()
    }

    pub fn name(&self) -> &str {
        &self.fsm.context().name
    }

    pub fn state(&self) -> OrchestratorState {
        self.fsm
            .current_state()
            .copied()
            .unwrap_or(OrchestratorState::Wait)
    }

    pub fn update(&mut self, tick: &TickContext) {
        let _entered = self.span.clone().entered();
        self.fsm.context_mut().tick = *tick;
        if let Err(e) = self.fsm.update() {
            warn!(orchestrator = %self.name(), error = %e, "Orchestrator update failed");
        }
    }

    /// Fixed update for the running module and every submodule.
    pub fn fixed_update(&mut self, tick: &TickContext) {
        let core = self.fsm.context_mut();
        if let Some(module) = core.module.as_mut() {
            module.fixed_update(tick);
        }
        for child in &mut core.children {
            child.orchestrator.fixed_update(tick);
        }
    }

    pub fn late_update(&mut self, tick: &TickContext) {
        let core = self.fsm.context_mut();
        if let Some(module) = core.module.as_mut() {
            module.late_update(tick);
        }
        for child in &mut core.children {
            child.orchestrator.late_update(tick);
        }
    }

    /// Load `setup`, replacing the current module if there is one.
    pub fn load_module(&mut self, setup: SharedSetup) {
        self.fsm.context_mut().enqueue_load(setup);
    }

    pub fn switch_to_module(&mut self, setup: SharedSetup) {
        self.load_module(setup);
    }

    pub fn unload_module(&mut self) {
        self.fsm.context_mut().enqueue_unload();
    }

    pub fn reload_module(&mut self) {
        self.fsm.context_mut().enqueue_reload();
    }

    /// Drop queued work, unload the module and every submodule, return to `Wait`.
    pub fn reset(&mut self) {
        info!(orchestrator = %self.name(), "Orchestrator reset requested");
        let request = StateRequest::to(OrchestratorState::Reset).priority(RESET_PRIORITY);
        if let Err(e) = self.fsm.set_state(request) {
            error!(orchestrator = %self.name(), error = %e, "Reset rejected");
        }
    }

    pub fn add_submodule(&mut self, category: &str, setup: SharedSetup) {
        self.fsm.context_mut().add_submodule(category, setup);
    }

    pub fn remove_submodule(&mut self, category: &str) -> bool {
        self.fsm.context_mut().remove_submodule(category)
    }

    pub fn submodule(&self, category: &str) -> Option<&Orchestrator> {
        self.fsm
            .context()
            .children
            .iter()
            .find(|c| c.category == category)
            .map(|c| &c.orchestrator)
    }

    pub fn submodule_mut(&mut self, category: &str) -> Option<&mut Orchestrator> {
        self.fsm
            .context_mut()
            .children
            .iter_mut()
            .find(|c| c.category == category)
            .map(|c| &mut c.orchestrator)
    }

    pub fn submodules(&self) -> impl Iterator<Item = &Submodule> {
        self.fsm.context().children.iter()
    }

    pub fn module(&self) -> Option<&Module> {
        self.fsm.context().module.as_ref()
    }

    pub fn module_mut(&mut self) -> Option<&mut Module> {
        self.fsm.context_mut().module.as_mut()
    }

    pub fn transition(&self) -> Option<&dyn Transition> {
        self.fsm.context().transition.as_deref()
    }

    pub fn pending_operations(&self) -> usize {
        self.fsm.context().operations.len()
    }

    /// Resting with nothing loaded and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.state() == OrchestratorState::Wait
            && self.fsm.pending().is_none()
            && self.fsm.context().is_idle()
    }

    pub fn pause_all(&mut self) {
        let core = self.fsm.context_mut();
        if let Some(module) = core.module.as_mut() {
            module.pause();
        }
        for child in &mut core.children {
            child.orchestrator.pause_all();
        }
    }

    pub fn restart_all(&mut self) {
        let core = self.fsm.context_mut();
        if let Some(module) = core.module.as_mut() {
            module.restart();
        }
        for child in &mut core.children {
            child.orchestrator.restart_all();
        }
    }

    pub fn take_escalation(&mut self) -> Option<Escalation> {
        self.fsm.context_mut().escalation.take()
    }

    /// Run every rule's quit hook in this subtree, parents first.
    pub fn quit(&mut self) -> Vec<RuleFault> {
        let core = self.fsm.context_mut();
        let mut failures = core.module.as_mut().map(Module::quit).unwrap_or_default();
        for child in &mut core.children {
            failures.extend(child.orchestrator.quit());
        }
        failures
    }

    pub fn status(&self) -> OrchestratorStatus {
        let core = self.fsm.context();
        OrchestratorStatus {
            name: core.name.clone(),
            state: self.state(),
            module: core.module.as_ref().map(Module::status),
            transition: core.transition.as_deref().map(TransitionStatus::of),
            pending_operations: core.operations.len(),
            submodules: core
                .children
                .iter()
                .map(|child| SubmoduleStatus {
                    category: child.category.clone(),
                    unloading: child.unloading,
                    status: child.orchestrator.status(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.fsm.context();
        f.debug_struct("Orchestrator")
            .field("name", &core.name)
            .field("state", &self.state())
            .field("module", &core.module)
            .field("operations", &core.operations)
            .field("submodules", &core.children.len())
            .finish()
    }
}
