// Exception and performance policies attached to a module

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::SharedSetup;

/// Reaction to a rule fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExceptionBehaviour {
    /// Log and move on to the next rule.
    #[default]
    Continue,
    /// Move past the rule but stop processing for this tick.
    SkipTick,
    PauseModule,
    UnloadModule,
    /// Pause every module in the runtime.
    PauseAll,
    /// Reset the whole runtime.
    StopAll,
}

/// Broad lifecycle stage a fault happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Load,
    Update,
    Unload,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ExceptionPolicy {
    #[serde(default)]
    pub on_load: OnExceptionBehaviour,
    #[serde(default)]
    pub on_update: OnExceptionBehaviour,
    #[serde(default)]
    pub on_unload: OnExceptionBehaviour,
    /// Faults during unloading never interrupt the unload sequence.
    #[serde(default)]
    pub skip_unload_if_exception: bool,
    /// Module to switch to when this one is unloaded because of a fault.
    #[serde(skip)]
    pub fallback: Option<SharedSetup>,
}

impl ExceptionPolicy {
    pub fn behaviour_for(&self, stage: LoadStage) -> OnExceptionBehaviour {
        match stage {
            LoadStage::Load => self.on_load,
            LoadStage::Update => self.on_update,
            LoadStage::Unload if self.skip_unload_if_exception => OnExceptionBehaviour::Continue,
            LoadStage::Unload => self.on_unload,
        }
    }

    pub fn with_fallback(mut self, fallback: SharedSetup) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl fmt::Debug for ExceptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionPolicy")
            .field("on_load", &self.on_load)
            .field("on_update", &self.on_update)
            .field("on_unload", &self.on_unload)
            .field("skip_unload_if_exception", &self.skip_unload_if_exception)
            .field("fallback", &self.fallback.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

/// Time limits for a module's phases. `None` disables the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerformancePolicy {
    /// Wall-clock allowance per tick for batched phases. At least one rule
    /// is always processed per tick.
    pub max_tick_budget: Option<Duration>,
    pub init_stall_timeout: Option<Duration>,
    pub unload_stall_timeout: Option<Duration>,
}

/// Cross-module request raised by a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Escalation {
    PauseAll,
    StopAll,
}

impl Escalation {
    /// Keep the more severe of two escalations.
    pub fn merge(current: Option<Escalation>, incoming: Escalation) -> Escalation {
        current.map_or(incoming, |current| current.max(incoming))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_unload_overrides_unload_behaviour() {
        let policy = ExceptionPolicy {
            on_unload: OnExceptionBehaviour::StopAll,
            skip_unload_if_exception: true,
            ..Default::default()
        };
        assert_eq!(
            policy.behaviour_for(LoadStage::Unload),
            OnExceptionBehaviour::Continue
        );
        assert_eq!(
            policy.behaviour_for(LoadStage::Load),
            OnExceptionBehaviour::Continue
        );
    }

    #[test]
    fn test_behaviour_deserializes_from_snake_case() {
        let policy: ExceptionPolicy =
            toml::from_str("on_load = \"unload_module\"\non_update = \"skip_tick\"").unwrap();
        assert_eq!(policy.on_load, OnExceptionBehaviour::UnloadModule);
        assert_eq!(policy.on_update, OnExceptionBehaviour::SkipTick);
        assert_eq!(policy.on_unload, OnExceptionBehaviour::Continue);
    }

    #[test]
    fn test_stop_all_wins_over_pause_all() {
        assert_eq!(
            Escalation::merge(Some(Escalation::StopAll), Escalation::PauseAll),
            Escalation::StopAll
        );
        assert_eq!(Escalation::merge(None, Escalation::PauseAll), Escalation::PauseAll);
    }
}
