// Typed, ordered collection of a module's rules

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Completion, LifecycleHandle, Rule, RuleContext, RuleKey, RulePhase, RuleState};
use crate::error::{FaultKind, RuleFault, ValidationError};
use crate::module::ModuleCommand;
use crate::time::TickContext;

/// Module-side environment lent to rule hooks.
pub(crate) struct RuleEnv<'a> {
    pub module: &'a str,
    pub tick: &'a TickContext,
    pub commands: &'a mut Vec<ModuleCommand>,
}

/// One registered rule together with its lifecycle bookkeeping.
pub struct RuleEntry {
    key: RuleKey,
    rule: Box<dyn Rule>,
    lifecycle: LifecycleHandle,
    phase_started: Option<Instant>,
}

impl RuleEntry {
    fn new(key: RuleKey, rule: Box<dyn Rule>) -> Self {
        Self {
            key,
            rule,
            lifecycle: LifecycleHandle::new(),
            phase_started: None,
        }
    }

    pub fn key(&self) -> RuleKey {
        self.key
    }

    pub fn name(&self) -> &'static str {
        self.key.name()
    }

    pub fn state(&self) -> RuleState {
        self.lifecycle.state()
    }

    pub fn has_error(&self) -> bool {
        self.lifecycle.has_error()
    }

    pub fn lifecycle(&self) -> &LifecycleHandle {
        &self.lifecycle
    }

    pub fn rule(&self) -> &dyn Rule {
        &*self.rule
    }

    pub fn rule_mut(&mut self) -> &mut dyn Rule {
        &mut *self.rule
    }

    /// How long the current initialize/unload phase has been in flight.
    pub fn phase_elapsed(&self) -> Option<Duration> {
        if self.state().is_pending() {
            self.phase_started.map(|started| started.elapsed())
        } else {
            None
        }
    }

    /// Elapsed time if the in-flight phase outlived `timeout`.
    pub(crate) fn stalled_for(&self, timeout: Option<Duration>) -> Option<Duration> {
        let timeout = timeout?;
        self.phase_elapsed().filter(|elapsed| *elapsed > timeout)
    }

    fn context<'a>(
        lifecycle: &'a LifecycleHandle,
        env: &'a mut RuleEnv<'_>,
    ) -> RuleContext<'a> {
        RuleContext {
            module: env.module,
            tick: env.tick,
            lifecycle,
            commands: &mut *env.commands,
        }
    }

    fn fault(&self, phase: RulePhase, error: anyhow::Error) -> RuleFault {
        self.lifecycle.mark_error();
        RuleFault::new(self.name(), phase, FaultKind::Error(error))
    }

    /// Move an `Unused` rule into `Initializing` and run its hook. No-op otherwise.
    pub(crate) fn base_initialize(&mut self, env: &mut RuleEnv<'_>) -> Result<(), RuleFault> {
        if !self
            .lifecycle
            .advance(RuleState::Unused, RuleState::Initializing)
        {
            debug!(rule = %self.key, state = %self.state(), "Initialize skipped");
            return Ok(());
        }
        self.phase_started = Some(Instant::now());

        let mut ctx = Self::context(&self.lifecycle, env);
        match self.rule.on_initialize(&mut ctx) {
            Ok(Completion::Done) => {
                self.lifecycle
                    .advance(RuleState::Initializing, RuleState::Initialized);
                Ok(())
            }
            Ok(Completion::Pending) => {
                debug!(rule = %self.key, "Initialization pending");
                Ok(())
            }
            Err(error) => Err(self.fault(RulePhase::Initialize, error)),
        }
    }

    /// Run one update-family hook. Returns whether the rule was eligible.
    pub(crate) fn base_update(
        &mut self,
        env: &mut RuleEnv<'_>,
        phase: RulePhase,
    ) -> Result<bool, RuleFault> {
        if self.state() != RuleState::Initialized {
            return Ok(false);
        }

        let mut ctx = Self::context(&self.lifecycle, env);
        let result = match phase {
            RulePhase::FixedUpdate => self.rule.on_fixed_update(&mut ctx),
            RulePhase::LateUpdate => self.rule.on_late_update(&mut ctx),
            _ => self.rule.on_update(&mut ctx),
        };
        match result {
            Ok(()) => Ok(true),
            Err(error) => Err(self.fault(phase, error)),
        }
    }

    /// Move an `Initialized` rule into `Unloading` and run its hook. No-op otherwise.
    pub(crate) fn base_unload(&mut self, env: &mut RuleEnv<'_>) -> Result<(), RuleFault> {
        if !self
            .lifecycle
            .advance(RuleState::Initialized, RuleState::Unloading)
        {
            debug!(rule = %self.key, state = %self.state(), "Unload skipped");
            return Ok(());
        }
        self.phase_started = Some(Instant::now());

        let mut ctx = Self::context(&self.lifecycle, env);
        match self.rule.on_unload(&mut ctx) {
            Ok(Completion::Done) => {
                self.lifecycle
                    .advance(RuleState::Unloading, RuleState::Unloaded);
                Ok(())
            }
            Ok(Completion::Pending) => {
                debug!(rule = %self.key, "Unload pending");
                Ok(())
            }
            Err(error) => Err(self.fault(RulePhase::Unload, error)),
        }
    }

    pub(crate) fn base_quit(&mut self) -> Result<(), RuleFault> {
        self.rule
            .on_quit()
            .map_err(|error| RuleFault::new(self.name(), RulePhase::Quit, FaultKind::Error(error)))
    }
}

/// Rules keyed by their concrete type, iterated in declaration order.
#[derive(Default)]
pub struct RuleSet {
    entries: Vec<RuleEntry>,
    index: HashMap<RuleKey, usize>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<R: Rule>(&mut self, rule: R) -> Result<RuleKey, ValidationError> {
        let key = RuleKey::of::<R>();
        if self.index.contains_key(&key) {
            return Err(ValidationError::DuplicateRule {
                rule: key.name().to_string(),
            });
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(RuleEntry::new(key, Box::new(rule)));
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: RuleKey) -> bool {
        self.index.contains_key(&key)
    }

    pub fn get<R: Rule>(&self) -> Option<&R> {
        let entry = self.entry(RuleKey::of::<R>())?;
        entry.rule().as_any().downcast_ref::<R>()
    }

    pub fn get_mut<R: Rule>(&mut self) -> Option<&mut R> {
        let entry = self.entry_mut(RuleKey::of::<R>())?;
        entry.rule_mut().as_any_mut().downcast_mut::<R>()
    }

    pub fn entry(&self, key: RuleKey) -> Option<&RuleEntry> {
        self.index.get(&key).map(|idx| &self.entries[*idx])
    }

    pub fn entry_mut(&mut self, key: RuleKey) -> Option<&mut RuleEntry> {
        let idx = *self.index.get(&key)?;
        self.entries.get_mut(idx)
    }

    pub fn state_of<R: Rule>(&self) -> Option<RuleState> {
        self.entry(RuleKey::of::<R>()).map(RuleEntry::state)
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &RuleEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut RuleEntry> {
        self.entries.iter_mut()
    }

    pub fn keys(&self) -> Vec<RuleKey> {
        self.entries.iter().map(RuleEntry::key).collect()
    }

    pub(crate) fn entry_at(&self, idx: usize) -> Option<&RuleEntry> {
        self.entries.get(idx)
    }

    pub(crate) fn entry_at_mut(&mut self, idx: usize) -> Option<&mut RuleEntry> {
        self.entries.get_mut(idx)
    }
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.name(), e.state())))
            .finish()
    }
}
