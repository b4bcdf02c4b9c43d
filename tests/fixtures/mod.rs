//! Shared rules and drivers for the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tickframe::module::{FnSetup, Module, ModuleBuilder, ModuleEnv, SharedSetup};
use tickframe::orchestrator::{Orchestrator, OrchestratorEnv};
use tickframe::time::{Clock, TickContext};

/// Ordered record of rule hook calls, e.g. `"Alpha:init"`.
pub type EventLog = Rc<RefCell<Vec<String>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.borrow().clone()
}

/// Events with the given suffix, in order, without the suffix.
pub fn events_of(log: &EventLog, hook: &str) -> Vec<String> {
    let suffix = format!(":{}", hook);
    log.borrow()
        .iter()
        .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
        .collect()
}

pub fn clear(log: &EventLog) {
    log.borrow_mut().clear();
}

/// A rule that records every hook call and completes each phase immediately.
macro_rules! recording_rule {
    ($($name:ident),* $(,)?) => {
        $(
            pub struct $name {
                pub log: EventLog,
            }

            impl $name {
                pub fn new(log: &EventLog) -> Self {
                    Self { log: log.clone() }
                }

                fn record(&self, hook: &str) {
                    self.log
                        .borrow_mut()
                        .push(format!("{}:{}", stringify!($name), hook));
                }
            }

            impl tickframe::rules::Rule for $name {
                fn on_initialize(
                    &mut self,
                    _ctx: &mut tickframe::rules::RuleContext<'_>,
                ) -> anyhow::Result<tickframe::rules::Completion> {
                    self.record("init");
                    Ok(tickframe::rules::Completion::Done)
                }

                fn on_update(&mut self, _ctx: &mut tickframe::rules::RuleContext<'_>) -> anyhow::Result<()> {
                    self.record("update");
                    Ok(())
                }

                fn on_fixed_update(
                    &mut self,
                    _ctx: &mut tickframe::rules::RuleContext<'_>,
                ) -> anyhow::Result<()> {
                    self.record("fixed");
                    Ok(())
                }

                fn on_late_update(
                    &mut self,
                    _ctx: &mut tickframe::rules::RuleContext<'_>,
                ) -> anyhow::Result<()> {
                    self.record("late");
                    Ok(())
                }

                fn on_unload(
                    &mut self,
                    _ctx: &mut tickframe::rules::RuleContext<'_>,
                ) -> anyhow::Result<tickframe::rules::Completion> {
                    self.record("unload");
                    Ok(tickframe::rules::Completion::Done)
                }

                fn on_quit(&mut self) -> anyhow::Result<()> {
                    self.record("quit");
                    Ok(())
                }
            }
        )*
    };
}

recording_rule!(Alpha, Beta, Gamma, Delta, Epsilon);

pub fn setup(
    name: &str,
    configure: impl Fn(&mut ModuleBuilder) -> anyhow::Result<()> + 'static,
) -> SharedSetup {
    FnSetup::new(name, configure).shared()
}

/// Module over Alpha, Beta and Gamma, declared in that order.
pub fn abc_setup(name: &str, log: &EventLog) -> SharedSetup {
    let log = log.clone();
    setup(name, move |builder| {
        builder.add_rule(Alpha::new(&log))?;
        builder.add_rule(Beta::new(&log))?;
        builder.add_rule(Gamma::new(&log))?;
        Ok(())
    })
}

pub fn started_module(setup: SharedSetup) -> Module {
    let mut module = Module::new(setup, ModuleEnv::default()).expect("module");
    module.start().expect("start");
    module
}

pub fn started_orchestrator(name: &str) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(name, OrchestratorEnv::default()).expect("orchestrator");
    orchestrator.start().expect("start");
    orchestrator
}

/// Hands out consecutive tick contexts.
pub struct Ticker {
    clock: Clock,
}

impl Ticker {
    pub fn new() -> Self {
        Self { clock: Clock::new() }
    }

    pub fn next(&mut self) -> TickContext {
        self.clock.advance(Duration::from_millis(16))
    }

    pub fn ticks(&self) -> u64 {
        self.clock.ticks()
    }
}

/// Update `module` until `done` holds, returning the number of updates taken.
pub fn drive_module(
    module: &mut Module,
    ticker: &mut Ticker,
    max: u64,
    done: impl Fn(&Module) -> bool,
) -> Option<u64> {
    for n in 0..max {
        if done(module) {
            return Some(n);
        }
        module.update(&ticker.next());
    }
    done(module).then_some(max)
}

pub fn drive_orchestrator(
    orchestrator: &mut Orchestrator,
    ticker: &mut Ticker,
    max: u64,
    done: impl Fn(&Orchestrator) -> bool,
) -> Option<u64> {
    for n in 0..max {
        if done(orchestrator) {
            return Some(n);
        }
        orchestrator.update(&ticker.next());
    }
    done(orchestrator).then_some(max)
}
