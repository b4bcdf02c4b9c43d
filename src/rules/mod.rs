//! Rules: the units of behaviour a module is composed of
//!
//! A rule goes through `Unused -> Initializing -> Initialized -> Unloading ->
//! Unloaded`. The owning module drives the transitions into `Initializing` and
//! `Unloading`; the rule itself completes them, either synchronously by
//! returning [`Completion::Done`] or later through its [`LifecycleHandle`].

pub mod lifecycle;
pub mod rule_set;
pub mod scheduling;

use std::any::{Any, TypeId};
use std::fmt;

use crate::dependencies::{CapabilityRegistry, Injector};
use crate::error::{DependencyError, ValidationError};
use crate::module::{ModuleCommand, SharedSetup};
use crate::time::TickContext;

pub use lifecycle::{LifecycleHandle, RuleState};
pub use rule_set::{RuleEntry, RuleSet};
pub use scheduling::RuleScheduling;

/// Result of a lifecycle hook that may finish asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The phase is complete.
    Done,
    /// The rule will call the matching completion on its lifecycle handle later.
    Pending,
}

/// Phase a rule was in when something happened to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RulePhase {
    Setup,
    Injection,
    Initialize,
    Update,
    FixedUpdate,
    LateUpdate,
    Unload,
    Quit,
}

impl fmt::Display for RulePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RulePhase::Setup => "setup",
            RulePhase::Injection => "dependency injection",
            RulePhase::Initialize => "initialize",
            RulePhase::Update => "update",
            RulePhase::FixedUpdate => "fixed update",
            RulePhase::LateUpdate => "late update",
            RulePhase::Unload => "unload",
            RulePhase::Quit => "quit",
        };
        write!(f, "{}", label)
    }
}

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Behaviour hooks of a rule. Every hook defaults to an immediate no-op.
pub trait Rule: AsAny {
    /// Register the capability this rule offers to others. At most one.
    fn provides(&self, _registry: &mut CapabilityRegistry<'_>) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Resolve the capabilities this rule depends on.
    fn inject(&mut self, _injector: &Injector<'_>) -> Result<(), DependencyError> {
        Ok(())
    }

    fn on_initialize(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        Ok(Completion::Done)
    }

    fn on_update(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_fixed_update(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_late_update(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_unload(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        Ok(Completion::Done)
    }

    /// Last-chance hook at application shutdown, regardless of lifecycle state.
    fn on_quit(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Identity of a rule type inside a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey {
    type_id: TypeId,
    name: &'static str,
}

impl RuleKey {
    pub fn of<R: Rule>() -> Self {
        Self {
            type_id: TypeId::of::<R>(),
            name: short_type_name(std::any::type_name::<R>()),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// `a::b::Thing<c::D>` -> `Thing`
pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// What a rule sees while one of its hooks runs.
pub struct RuleContext<'a> {
    pub(crate) module: &'a str,
    pub(crate) tick: &'a TickContext,
    pub(crate) lifecycle: &'a LifecycleHandle,
    pub(crate) commands: &'a mut Vec<ModuleCommand>,
}

impl RuleContext<'_> {
    pub fn module_name(&self) -> &str {
        self.module
    }

    pub fn tick(&self) -> &TickContext {
        self.tick
    }

    pub fn state(&self) -> RuleState {
        self.lifecycle.state()
    }

    /// Handle for completing a pending phase later, possibly from another thread.
    pub fn lifecycle(&self) -> LifecycleHandle {
        self.lifecycle.clone()
    }

    pub fn add_submodule(&mut self, category: impl Into<String>, setup: SharedSetup) {
        self.commands.push(ModuleCommand::AddSubmodule {
            category: category.into(),
            setup,
        });
    }

    pub fn remove_submodule(&mut self, category: impl Into<String>) {
        self.commands.push(ModuleCommand::RemoveSubmodule {
            category: category.into(),
        });
    }

    /// Replace the owning module with another one.
    pub fn switch_to(&mut self, setup: SharedSetup) {
        self.commands.push(ModuleCommand::SwitchTo(setup));
    }

    pub fn unload_module(&mut self) {
        self.commands.push(ModuleCommand::UnloadSelf);
    }

    pub fn reload_module(&mut self) {
        self.commands.push(ModuleCommand::Reload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod nested {
        pub struct Scoreboard;
        impl crate::rules::Rule for Scoreboard {}
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("a::b::Thing"), "Thing");
        assert_eq!(short_type_name("a::Thing<b::Other>"), "Thing");
        assert_eq!(short_type_name("dyn a::b::Service"), "Service");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_rule_key_identity() {
        let key = RuleKey::of::<nested::Scoreboard>();
        assert_eq!(key.name(), "Scoreboard");
        assert_eq!(key, RuleKey::of::<nested::Scoreboard>());
        assert_eq!(key.type_id(), TypeId::of::<nested::Scoreboard>());
    }
}
