// Module definitions and the builder they configure

use std::collections::HashSet;
use std::rc::Rc;

use super::policy::{ExceptionPolicy, PerformancePolicy};
use crate::error::ValidationError;
use crate::rules::{Rule, RuleKey, RuleScheduling, RuleSet};
use crate::transition::Transition;

/// Shared handle to a module definition.
pub type SharedSetup = Rc<dyn ModuleSetup>;

/// Declares what a module is made of.
///
/// `configure` runs once per module instance, during its `Setup` phase.
pub trait ModuleSetup {
    fn name(&self) -> &str;

    fn configure(&self, builder: &mut ModuleBuilder) -> anyhow::Result<()>;

    /// Visual transition shown while this module loads or unloads.
    fn transition(&self) -> Option<Box<dyn Transition>> {
        None
    }
}

/// Policies applied to modules that do not set their own.
#[derive(Debug, Clone, Default)]
pub struct ModuleDefaults {
    pub exception_policy: ExceptionPolicy,
    pub performance_policy: PerformancePolicy,
}

pub struct ModuleBuilder {
    name: String,
    rules: RuleSet,
    init_order: Option<Vec<RuleKey>>,
    schedule: Option<Vec<RuleScheduling>>,
    exception_policy: ExceptionPolicy,
    performance_policy: PerformancePolicy,
}

/// Validated result of a builder.
pub(crate) struct ModulePlan {
    pub rules: RuleSet,
    pub init_order: Vec<RuleKey>,
    pub schedule: Vec<RuleScheduling>,
    pub exception_policy: ExceptionPolicy,
    pub performance_policy: PerformancePolicy,
}

impl ModuleBuilder {
    pub(crate) fn new(name: &str, defaults: &ModuleDefaults) -> Self {
        Self {
            name: name.to_string(),
            rules: RuleSet::new(),
            init_order: None,
            schedule: None,
            exception_policy: defaults.exception_policy.clone(),
            performance_policy: defaults.performance_policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn add_rule<R: Rule>(&mut self, rule: R) -> Result<RuleKey, ValidationError> {
        self.rules.insert(rule)
    }

    /// Order for initialization; unloading uses the reverse. Rules left out
    /// follow in declaration order.
    pub fn init_order(&mut self, order: impl IntoIterator<Item = RuleKey>) -> &mut Self {
        self.init_order = Some(order.into_iter().collect());
        self
    }

    /// Append an update schedule entry. Once any entry is given, only
    /// scheduled rules are updated, in the order given.
    pub fn schedule(&mut self, schedule: RuleScheduling) -> &mut Self {
        self.schedule.get_or_insert_with(Vec::new).push(schedule);
        self
    }

    pub fn exception_policy(&mut self, policy: ExceptionPolicy) -> &mut Self {
        self.exception_policy = policy;
        self
    }

    pub fn performance_policy(&mut self, policy: PerformancePolicy) -> &mut Self {
        self.performance_policy = policy;
        self
    }

    fn check_known(&self, key: RuleKey) -> Result<(), ValidationError> {
        if self.rules.contains(key) {
            Ok(())
        } else {
            Err(ValidationError::UnknownRule {
                rule: key.name().to_string(),
                module: self.name.clone(),
            })
        }
    }

    pub(crate) fn build(self) -> Result<ModulePlan, ValidationError> {
        let mut init_order = Vec::with_capacity(self.rules.len());
        let mut seen = HashSet::new();
        for key in self.init_order.iter().flatten() {
            self.check_known(*key)?;
            if !seen.insert(*key) {
                return Err(ValidationError::DuplicateRule {
                    rule: key.name().to_string(),
                });
            }
            init_order.push(*key);
        }
        for key in self.rules.keys() {
            if seen.insert(key) {
                init_order.push(key);
            }
        }

        let schedule = match &self.schedule {
            Some(schedule) => {
                for entry in schedule {
                    self.check_known(entry.rule())?;
                }
                schedule.clone()
            }
            None => self
                .rules
                .keys()
                .into_iter()
                .map(RuleScheduling::every_tick)
                .collect(),
        };

        Ok(ModulePlan {
            rules: self.rules,
            init_order,
            schedule,
            exception_policy: self.exception_policy,
            performance_policy: self.performance_policy,
        })
    }
}

type ConfigureFn = dyn Fn(&mut ModuleBuilder) -> anyhow::Result<()>;
type TransitionFn = dyn Fn() -> Box<dyn Transition>;

/// [`ModuleSetup`] assembled from closures.
pub struct FnSetup {
    name: String,
    configure: Box<ConfigureFn>,
    transition: Option<Box<TransitionFn>>,
}

impl FnSetup {
    pub fn new(
        name: impl Into<String>,
        configure: impl Fn(&mut ModuleBuilder) -> anyhow::Result<()> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            configure: Box::new(configure),
            transition: None,
        }
    }

    pub fn with_transition(
        mut self,
        factory: impl Fn() -> Box<dyn Transition> + 'static,
    ) -> Self {
        self.transition = Some(Box::new(factory));
        self
    }

    pub fn shared(self) -> SharedSetup {
        Rc::new(self)
    }
}

impl ModuleSetup for FnSetup {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, builder: &mut ModuleBuilder) -> anyhow::Result<()> {
        (self.configure)(builder)
    }

    fn transition(&self) -> Option<Box<dyn Transition>> {
        self.transition.as_ref().map(|factory| factory())
    }
}
