// Orchestrator states

use tracing::{debug, info};

use super::{request, OrchestratorCore, OrchestratorState};
use crate::fsm::{FsmState, StateControl};
use crate::module::{Module, ModuleState};
use crate::transition::TransitionState;

type Control = StateControl<OrchestratorState>;

pub(super) fn all() -> Vec<Box<dyn FsmState<OrchestratorState, OrchestratorCore>>> {
    vec![
        Box::new(Wait),
        Box::new(EnterTransition),
        Box::new(RunTransition),
        Box::new(ChangeTransition),
        Box::new(Operational),
        Box::new(ExitTransition),
        Box::new(Reset),
    ]
}

/// Nothing loaded; waits for queued operations.
struct Wait;

impl FsmState<OrchestratorState, OrchestratorCore> for Wait {
    fn id(&self) -> OrchestratorState {
        OrchestratorState::Wait
    }

    fn update(&mut self, core: &mut OrchestratorCore, control: &mut Control) {
        core.tick_transitions();
        core.begin_operations(control);
    }
}

/// Plays the transition's entering section while the current module keeps running.
struct EnterTransition;

impl FsmState<OrchestratorState, OrchestratorCore> for EnterTransition {
    fn id(&self) -> OrchestratorState {
        OrchestratorState::EnterTransition
    }

    fn enter(&mut self, core: &mut OrchestratorCore, _control: &mut Control) {
        if let Some(transition) = core.transition.as_mut() {
            debug!(orchestrator = %core.name, transition = %transition.name(), "Entering transition");
            transition.enter();
        }
    }

    fn update(&mut self, core: &mut OrchestratorCore, control: &mut Control) {
        core.tick_transitions();
        core.tick_module();
        core.destroy_finished_module();

        let ready = core.transition.as_ref().map_or(true, |t| t.is_ready());
        if ready {
            request(control, OrchestratorState::RunTransition, &core.name);
        }
    }
}

/// Works through queued operations, one per tick.
struct RunTransition;

impl FsmState<OrchestratorState, OrchestratorCore> for RunTransition {
    fn id(&self) -> OrchestratorState {
        OrchestratorState::RunTransition
    }

    fn enter(&mut self, core: &mut OrchestratorCore, _control: &mut Control) {
        info!(
            orchestrator = %core.name,
            operations = core.operations.len(),
            submodules = core.children.len(),
            "Running module operations"
        );
        core.reset_children();
    }

    fn update(&mut self, core: &mut OrchestratorCore, control: &mut Control) {
        core.tick_transitions();
        core.tick_children();
        core.tick_module();
        core.destroy_finished_module();
        core.run_next_operation();
        core.report_progress();

        if !core.load_settled() {
            return;
        }
        let running = core
            .module
            .as_ref()
            .is_some_and(|m| m.state() == ModuleState::UpdateRules);
        let target = if running {
            OrchestratorState::Operational
        } else if core.transition.is_some() {
            OrchestratorState::ExitTransition
        } else {
            OrchestratorState::Wait
        };
        request(control, target, &core.name);
    }
}

/// Hands over from the current transition to the incoming one.
struct ChangeTransition;

impl FsmState<OrchestratorState, OrchestratorCore> for ChangeTransition {
    fn id(&self) -> OrchestratorState {
        OrchestratorState::ChangeTransition
    }

    fn enter(&mut self, core: &mut OrchestratorCore, control: &mut Control) {
        core.retire_transition();
        core.transition = core.incoming.take();
        request(control, OrchestratorState::EnterTransition, &core.name);
    }
}

/// The module is running. Ticks it and the submodules, and picks up new work.
struct Operational;

impl FsmState<OrchestratorState, OrchestratorCore> for Operational {
    fn id(&self) -> OrchestratorState {
        OrchestratorState::Operational
    }

    fn enter(&mut self, core: &mut OrchestratorCore, _control: &mut Control) {
        core.retire_transition();
        if let Some(module) = core.module.as_ref() {
            info!(orchestrator = %core.name, module = %module.name(), "Orchestrator operational");
        }
    }

    fn update(&mut self, core: &mut OrchestratorCore, control: &mut Control) {
        core.tick_transitions();
        core.tick_module();
        core.tick_children();
        core.destroy_finished_module();

        let module_leaving = core.module.as_ref().map_or(true, Module::is_unloading);
        if module_leaving && core.operations.is_empty() {
            // Submodules go down with the module that owns them
            core.unload_remaining_children();
            if core.module.is_none() && core.children.is_empty() {
                request(control, OrchestratorState::Wait, &core.name);
            }
            return;
        }
        core.begin_operations(control);
    }
}

/// Plays the transition's exiting section after the last module went away.
struct ExitTransition;

impl FsmState<OrchestratorState, OrchestratorCore> for ExitTransition {
    fn id(&self) -> OrchestratorState {
        OrchestratorState::ExitTransition
    }

    fn enter(&mut self, core: &mut OrchestratorCore, _control: &mut Control) {
        if let Some(transition) = core.transition.as_mut() {
            transition.exit();
        }
    }

    fn update(&mut self, core: &mut OrchestratorCore, control: &mut Control) {
        core.tick_transitions();
        if !core.operations.is_empty() {
            core.begin_operations(control);
            return;
        }

        let finished = core
            .transition
            .as_ref()
            .map_or(true, |t| t.state() == TransitionState::Inactive);
        if finished {
            if let Some(mut transition) = core.transition.take() {
                core.env.stats.record_transition();
                transition.cleanup();
            }
            request(control, OrchestratorState::Wait, &core.name);
        }
    }
}

/// Unloads everything and drops queued work.
struct Reset;

impl FsmState<OrchestratorState, OrchestratorCore> for Reset {
    fn id(&self) -> OrchestratorState {
        OrchestratorState::Reset
    }

    fn enter(&mut self, core: &mut OrchestratorCore, _control: &mut Control) {
        let dropped = core.operations.len();
        core.operations.clear();
        core.incoming = None;
        core.retire_transition();
        match core.module.as_ref().map(|m| m.is_started()) {
            Some(true) => {
                if let Some(module) = core.module.as_mut() {
                    module.unload();
                }
            }
            Some(false) => core.module = None,
            None => {}
        }
        core.reset_children();
        info!(orchestrator = %core.name, dropped_operations = dropped, "Orchestrator resetting");
    }

    fn update(&mut self, core: &mut OrchestratorCore, control: &mut Control) {
        core.tick_transitions();
        core.tick_module();
        core.destroy_finished_module();
        core.tick_children();

        if core.module.is_none() && core.children.is_empty() {
            request(control, OrchestratorState::Wait, &core.name);
        }
    }
}
