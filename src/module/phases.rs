// The six module phases, as states of the module's Fsm

use std::rc::Rc;
use tracing::{debug, info};

use super::{FaultReaction, LoadStage, ModuleCore, ModulePhase, ModuleState};
use crate::dependencies::{CapabilityRegistry, DependencyProvider, Injector};
use crate::error::RuleFault;
use crate::fsm::{FsmState, StateControl};
use crate::rules::{RuleKey, RulePhase, RuleState};
use crate::stats::PhaseTimer;
use crate::time::TickBudget;

pub(super) fn all() -> Vec<ModulePhase> {
    vec![
        Box::new(SetupPhase),
        Box::new(InjectionPhase::default()),
        Box::new(InitializePhase::default()),
        Box::new(UpdatePhase),
        Box::new(UnloadPhase::default()),
        Box::new(EndPhase),
    ]
}

/// Outcome of processing one rule in a batched phase.
enum Step {
    Next,
    NextThenStop,
    Stop,
}

impl From<FaultReaction> for Step {
    fn from(reaction: FaultReaction) -> Self {
        match reaction {
            FaultReaction::Advance => Step::Next,
            FaultReaction::YieldTick => Step::NextThenStop,
            FaultReaction::Halt => Step::Stop,
        }
    }
}

struct SetupPhase;

impl FsmState<ModuleState, ModuleCore> for SetupPhase {
    fn id(&self) -> ModuleState {
        ModuleState::Setup
    }

    fn enter(&mut self, core: &mut ModuleCore, control: &mut StateControl<ModuleState>) {
        let timer = PhaseTimer::new(&core.name, "setup");
        let reaction = core.configure();
        timer.finish();
        core.conclude(control, reaction != FaultReaction::Halt);
    }

    // Only reached when setup halted, e.g. after a pause
    fn update(&mut self, core: &mut ModuleCore, control: &mut StateControl<ModuleState>) {
        core.conclude(control, true);
    }
}

#[derive(Default, PartialEq, Eq)]
enum InjectionStage {
    #[default]
    Collect,
    Inject,
}

/// Collects every rule's capability, then injects every rule's dependencies.
#[derive(Default)]
struct InjectionPhase {
    stage: InjectionStage,
    cursor: usize,
    building: Option<DependencyProvider>,
}

impl InjectionPhase {
    fn collect(&mut self, core: &mut ModuleCore) -> Step {
        let building = self.building.get_or_insert_with(|| {
            DependencyProvider::with_parent(core.name.clone(), core.parent_provider.clone())
        });

        let Some(entry) = core.rules.entry_at(self.cursor) else {
            let provider = self
                .building
                .take()
                .unwrap_or_else(|| DependencyProvider::new(core.name.clone()));
            debug!(module = %core.name, capabilities = provider.len(), "Capabilities collected");
            core.provider = Some(Rc::new(provider));
            self.stage = InjectionStage::Inject;
            self.cursor = 0;
            return Step::Next;
        };

        let name = entry.name();
        let result = entry
            .rule()
            .provides(&mut CapabilityRegistry::new(building, name));
        self.cursor += 1;

        match result {
            Ok(()) => Step::Next,
            Err(invalid) => {
                entry.lifecycle().mark_error();
                let fault = RuleFault::new(name, RulePhase::Injection, invalid.into());
                core.handle_fault(fault, LoadStage::Load).into()
            }
        }
    }

    fn inject(&mut self, core: &mut ModuleCore) -> Option<Step> {
        let provider = core.provider.clone()?;
        let services = core.services.clone();
        let entry = core.rules.entry_at_mut(self.cursor)?;
        self.cursor += 1;

        let name = entry.name();
        if entry.state() != RuleState::Unused {
            return Some(Step::Next);
        }
        let result = entry
            .rule_mut()
            .inject(&Injector::new(name, &provider, services.as_deref()));

        Some(match result {
            Ok(()) => Step::Next,
            Err(missing) => {
                entry.lifecycle().mark_error();
                let fault = RuleFault::new(name, RulePhase::Injection, missing.into());
                core.handle_fault(fault, LoadStage::Load).into()
            }
        })
    }
}

impl FsmState<ModuleState, ModuleCore> for InjectionPhase {
    fn id(&self) -> ModuleState {
        ModuleState::DependencyInjection
    }

    fn enter(&mut self, core: &mut ModuleCore, _control: &mut StateControl<ModuleState>) {
        self.stage = InjectionStage::Collect;
        self.cursor = 0;
        self.building = Some(DependencyProvider::with_parent(
            core.name.clone(),
            core.parent_provider.clone(),
        ));
    }

    fn update(&mut self, core: &mut ModuleCore, control: &mut StateControl<ModuleState>) {
        let budget = TickBudget::start(core.performance_policy.max_tick_budget);
        let mut done = false;

        loop {
            let step = match self.stage {
                InjectionStage::Collect => self.collect(core),
                InjectionStage::Inject => match self.inject(core) {
                    Some(step) => step,
                    None => {
                        done = true;
                        break;
                    }
                },
            };
            if !matches!(step, Step::Next) || budget.exhausted() {
                break;
            }
        }

        core.conclude(control, done);
    }
}

/// Initializes rules one at a time in initialization order.
#[derive(Default)]
struct InitializePhase {
    cursor: usize,
    timer: Option<PhaseTimer>,
}

impl InitializePhase {
    fn step(core: &mut ModuleCore, key: RuleKey) -> Step {
        match core.rule_state(key) {
            Some(RuleState::Unused) => {
                let result = core.with_rule(key, |entry, env| entry.base_initialize(env));
                if let Some(Err(fault)) = result {
                    return core.handle_fault(fault, LoadStage::Load).into();
                }
                match core.rule_state(key) {
                    Some(RuleState::Initializing) => Step::Stop,
                    _ => Step::Next,
                }
            }
            Some(RuleState::Initializing) => Self::check_stall(core, key),
            _ => Step::Next,
        }
    }

    fn check_stall(core: &mut ModuleCore, key: RuleKey) -> Step {
        let timeout = core.performance_policy.init_stall_timeout;
        let stalled = core.rules.entry(key).and_then(|e| e.stalled_for(timeout));
        match stalled {
            Some(elapsed) => core
                .handle_stall(key, RulePhase::Initialize, elapsed, timeout, LoadStage::Load)
                .into(),
            None => Step::Stop,
        }
    }
}

impl FsmState<ModuleState, ModuleCore> for InitializePhase {
    fn id(&self) -> ModuleState {
        ModuleState::InitializeRules
    }

    fn enter(&mut self, core: &mut ModuleCore, _control: &mut StateControl<ModuleState>) {
        self.cursor = 0;
        self.timer = Some(PhaseTimer::new(&core.name, "initialize"));
    }

    fn update(&mut self, core: &mut ModuleCore, control: &mut StateControl<ModuleState>) {
        let budget = TickBudget::start(core.performance_policy.max_tick_budget);

        while let Some(key) = core.init_order.get(self.cursor).copied() {
            match Self::step(core, key) {
                Step::Next => self.cursor += 1,
                Step::NextThenStop => {
                    self.cursor += 1;
                    break;
                }
                Step::Stop => break,
            }
            if budget.exhausted() {
                break;
            }
        }

        let done = self.cursor >= core.init_order.len();
        if done {
            if let Some(timer) = self.timer.take() {
                timer.finish();
            }
        }
        core.conclude(control, done);
    }

    fn exit(&mut self, _core: &mut ModuleCore) {
        self.timer = None;
    }
}

/// Updates the rules scheduled for the current frame, in schedule order.
struct UpdatePhase;

impl FsmState<ModuleState, ModuleCore> for UpdatePhase {
    fn id(&self) -> ModuleState {
        ModuleState::UpdateRules
    }

    fn enter(&mut self, core: &mut ModuleCore, _control: &mut StateControl<ModuleState>) {
        core.update_frame = 0;
        info!(module = %core.name, rules = core.rules.len(), "Module running");
    }

    fn update(&mut self, core: &mut ModuleCore, control: &mut StateControl<ModuleState>) {
        let frame = core.update_frame;
        let due: Vec<RuleKey> = core
            .schedule
            .iter()
            .filter(|s| s.is_expected_at_frame(frame))
            .map(|s| s.rule())
            .collect();

        for key in due {
            let result = core.with_rule(key, |entry, env| entry.base_update(env, RulePhase::Update));
            if let Some(Err(fault)) = result {
                if core.handle_fault(fault, LoadStage::Update) != FaultReaction::Advance {
                    break;
                }
            }
            if core.paused || core.unload_requested {
                break;
            }
        }

        core.update_frame += 1;
        core.conclude(control, false);
    }
}

/// Unloads rules in reverse initialization order, skipping those never initialized.
#[derive(Default)]
struct UnloadPhase {
    cursor: usize,
    timer: Option<PhaseTimer>,
}

impl UnloadPhase {
    fn step(core: &mut ModuleCore, key: RuleKey) -> Step {
        let policy = core.performance_policy;
        match core.rule_state(key) {
            Some(RuleState::Initialized) => {
                let result = core.with_rule(key, |entry, env| entry.base_unload(env));
                if let Some(Err(fault)) = result {
                    return core.handle_fault(fault, LoadStage::Unload).into();
                }
                match core.rule_state(key) {
                    Some(RuleState::Unloading) => Step::Stop,
                    _ => Step::Next,
                }
            }
            // Let an in-flight initialization finish so it can be unloaded cleanly
            Some(RuleState::Initializing) => {
                Self::check_stall(core, key, RulePhase::Initialize, policy.init_stall_timeout)
            }
            Some(RuleState::Unloading) => {
                Self::check_stall(core, key, RulePhase::Unload, policy.unload_stall_timeout)
            }
            _ => Step::Next,
        }
    }

    fn check_stall(
        core: &mut ModuleCore,
        key: RuleKey,
        phase: RulePhase,
        timeout: Option<std::time::Duration>,
    ) -> Step {
        let stalled = core.rules.entry(key).and_then(|e| e.stalled_for(timeout));
        match stalled {
            Some(elapsed) => core
                .handle_stall(key, phase, elapsed, timeout, LoadStage::Unload)
                .into(),
            None => Step::Stop,
        }
    }
}

impl FsmState<ModuleState, ModuleCore> for UnloadPhase {
    fn id(&self) -> ModuleState {
        ModuleState::UnloadRules
    }

    fn enter(&mut self, core: &mut ModuleCore, _control: &mut StateControl<ModuleState>) {
        self.cursor = 0;
        self.timer = Some(PhaseTimer::new(&core.name, "unload"));
        info!(module = %core.name, "Unloading rules");
    }

    fn update(&mut self, core: &mut ModuleCore, control: &mut StateControl<ModuleState>) {
        let budget = TickBudget::start(core.performance_policy.max_tick_budget);
        let total = core.init_order.len();

        while self.cursor < total {
            let key = core.init_order[total - 1 - self.cursor];
            match Self::step(core, key) {
                Step::Next => self.cursor += 1,
                Step::NextThenStop => {
                    self.cursor += 1;
                    break;
                }
                Step::Stop => break,
            }
            if budget.exhausted() {
                break;
            }
        }

        let done = self.cursor >= total;
        if done {
            if let Some(timer) = self.timer.take() {
                timer.finish();
            }
        }
        core.conclude(control, done);
    }
}

struct EndPhase;

impl FsmState<ModuleState, ModuleCore> for EndPhase {
    fn id(&self) -> ModuleState {
        ModuleState::End
    }

    fn enter(&mut self, core: &mut ModuleCore, _control: &mut StateControl<ModuleState>) {
        core.stats.record_module_unloaded();
        info!(module = %core.name, faults = core.faults.len(), "Module ended");
    }
}
