//! Module lifecycle: phase ordering, scheduling, unloading and fault policies.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tickframe::dependencies::{CapabilityRegistry, DependencySource, Injector};
use tickframe::error::{DependencyError, FaultKind, ValidationError};
use tickframe::module::{
    ExceptionPolicy, ModuleCommand, ModuleState, OnExceptionBehaviour, PerformancePolicy,
};
use tickframe::rules::{
    Completion, LifecycleHandle, Rule, RuleContext, RuleKey, RulePhase, RuleScheduling, RuleState,
};

mod fixtures;
use fixtures::*;

/// Initialization finishes only when the test says so.
struct Deferred {
    handle: Rc<RefCell<Option<LifecycleHandle>>>,
}

impl Rule for Deferred {
    fn on_initialize(&mut self, ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        *self.handle.borrow_mut() = Some(ctx.lifecycle());
        Ok(Completion::Pending)
    }
}

/// Never finishes initializing.
struct Hanging;

impl Rule for Hanging {
    fn on_initialize(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        Ok(Completion::Pending)
    }
}

/// Fails every update.
struct Faulty;

impl Rule for Faulty {
    fn on_update(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<()> {
        anyhow::bail!("update exploded")
    }
}

/// Fails a fixed number of updates, then behaves.
struct Hiccup {
    failures_left: u32,
}

impl Rule for Hiccup {
    fn on_update(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<()> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            anyhow::bail!("hiccup");
        }
        Ok(())
    }
}

/// Fails to release its resources.
struct LeakyUnload;

impl Rule for LeakyUnload {
    fn on_unload(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        anyhow::bail!("file handle still open")
    }
}

/// Never finishes unloading.
struct StuckUnload;

impl Rule for StuckUnload {
    fn on_unload(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        Ok(Completion::Pending)
    }
}

/// Seed value shared inside one module.
struct Seed(u32);

struct SeedProvider;

impl Rule for SeedProvider {
    fn provides(&self, registry: &mut CapabilityRegistry<'_>) -> Result<(), ValidationError> {
        registry.provide(Rc::new(Seed(11)))
    }
}

#[derive(Default)]
struct SeedReader {
    seed: Option<u32>,
}

impl Rule for SeedReader {
    fn inject(&mut self, injector: &Injector<'_>) -> Result<(), DependencyError> {
        self.seed = Some(injector.require::<Seed>(DependencySource::Module)?.0);
        Ok(())
    }
}

/// Fails to initialize.
struct BrokenInit;

impl Rule for BrokenInit {
    fn on_initialize(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        anyhow::bail!("missing asset")
    }
}

fn is_running(module: &tickframe::module::Module) -> bool {
    module.state() == ModuleState::UpdateRules
}

fn has_ended(module: &tickframe::module::Module) -> bool {
    module.state() == ModuleState::End
}

#[test]
fn test_module_reaches_update_through_every_phase() {
    let log = event_log();
    let mut module = started_module(abc_setup("scene", &log));
    let mut ticker = Ticker::new();

    assert_eq!(module.state(), ModuleState::DependencyInjection);
    let ticks = drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");
    assert_eq!(ticks, 2);
    assert_eq!(module.load_progress(), 1.0);
    assert!(module
        .rules()
        .iter()
        .all(|entry| entry.state() == RuleState::Initialized));
}

#[test]
fn test_init_order_is_reversed_for_unload() {
    let log = event_log();
    let mut module = started_module(abc_setup("scene", &log));
    let mut ticker = Ticker::new();

    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");
    assert_eq!(events_of(&log, "init"), vec!["Alpha", "Beta", "Gamma"]);

    module.unload();
    assert!(module.is_unloading());
    drive_module(&mut module, &mut ticker, 10, has_ended).expect("module ended");

    assert_eq!(events_of(&log, "unload"), vec!["Gamma", "Beta", "Alpha"]);
    assert!(module
        .rules()
        .iter()
        .all(|entry| entry.state() == RuleState::Unloaded));
}

#[test]
fn test_explicit_init_order() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("ordered", move |builder| {
        builder.add_rule(Alpha::new(&module_log))?;
        builder.add_rule(Beta::new(&module_log))?;
        builder.add_rule(Gamma::new(&module_log))?;
        // Alpha is left out and follows in declaration order
        builder.init_order([RuleKey::of::<Gamma>(), RuleKey::of::<Beta>()]);
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();

    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");
    module.unload();
    drive_module(&mut module, &mut ticker, 10, has_ended).expect("module ended");

    assert_eq!(events_of(&log, "init"), vec!["Gamma", "Beta", "Alpha"]);
    assert_eq!(events_of(&log, "unload"), vec!["Alpha", "Beta", "Gamma"]);
}

#[test]
fn test_schedule_selects_rules_per_frame() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("scheduled", move |builder| {
        let a = builder.add_rule(Alpha::new(&module_log))?;
        let b = builder.add_rule(Beta::new(&module_log))?;
        let c = builder.add_rule(Gamma::new(&module_log))?;
        builder
            .schedule(RuleScheduling::every_tick(a))
            .schedule(RuleScheduling::new(b, 2, 0)?)
            .schedule(RuleScheduling::new(c, 2, 1)?);
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    let mut frames = Vec::new();
    for _ in 0..3 {
        clear(&log);
        module.update(&ticker.next());
        frames.push(events_of(&log, "update"));
    }

    assert_eq!(
        frames,
        vec![
            vec!["Alpha", "Beta"],
            vec!["Alpha", "Gamma"],
            vec!["Alpha", "Beta"],
        ]
    );
    assert_eq!(module.update_frame(), 3);
}

#[test]
fn test_fixed_and_late_updates() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("scheduled", move |builder| {
        let a = builder.add_rule(Alpha::new(&module_log))?;
        let b = builder.add_rule(Beta::new(&module_log))?;
        builder
            .schedule(RuleScheduling::every_tick(a))
            .schedule(RuleScheduling::new(b, 2, 1)?);
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    let tick = ticker.next();
    // Nothing has been updated yet, so late update has nothing to follow
    module.late_update(&tick);
    assert!(events_of(&log, "late").is_empty());

    module.update(&tick);
    module.fixed_update(&tick);
    module.late_update(&tick);

    assert_eq!(events_of(&log, "update"), vec!["Alpha"]);
    assert_eq!(events_of(&log, "fixed"), vec!["Alpha", "Beta"]);
    assert_eq!(events_of(&log, "late"), vec!["Alpha"]);
}

#[test]
fn test_unload_during_initialization_skips_uninitialized_rules() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("slow", move |builder| {
        builder.add_rule(Alpha::new(&module_log))?;
        builder.add_rule(Beta::new(&module_log))?;
        builder.add_rule(Gamma::new(&module_log))?;
        builder.performance_policy(PerformancePolicy {
            max_tick_budget: Some(Duration::ZERO),
            ..PerformancePolicy::default()
        });
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();

    drive_module(&mut module, &mut ticker, 20, |m| {
        m.state() == ModuleState::InitializeRules
    })
    .expect("initializing");

    // One rule per tick with a zero budget
    module.update(&ticker.next());
    assert_eq!(events_of(&log, "init"), vec!["Alpha"]);

    module.unload();
    drive_module(&mut module, &mut ticker, 20, has_ended).expect("module ended");

    assert_eq!(events_of(&log, "init"), vec!["Alpha"]);
    assert_eq!(events_of(&log, "unload"), vec!["Alpha"]);
    assert_eq!(module.rules().state_of::<Alpha>(), Some(RuleState::Unloaded));
    assert_eq!(module.rules().state_of::<Beta>(), Some(RuleState::Unused));
    assert_eq!(module.rules().state_of::<Gamma>(), Some(RuleState::Unused));
}

#[test]
fn test_unload_is_idempotent() {
    let log = event_log();
    let mut module = started_module(abc_setup("scene", &log));
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    module.unload();
    module.unload();
    drive_module(&mut module, &mut ticker, 10, has_ended).expect("module ended");
    module.unload();
    module.update(&ticker.next());

    assert_eq!(module.state(), ModuleState::End);
    assert_eq!(events_of(&log, "unload").len(), 3);
}

#[test]
fn test_pending_initialization_blocks_later_rules() {
    let log = event_log();
    let handle = Rc::new(RefCell::new(None));
    let module_log = log.clone();
    let module_handle = handle.clone();
    let setup = setup("deferred", move |builder| {
        builder.add_rule(Deferred {
            handle: module_handle.clone(),
        })?;
        builder.add_rule(Alpha::new(&module_log))?;
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();

    drive_module(&mut module, &mut ticker, 10, |m| {
        m.rules().state_of::<Deferred>() == Some(RuleState::Initializing)
    })
    .expect("deferred rule initializing");

    for _ in 0..3 {
        module.update(&ticker.next());
    }
    assert_eq!(module.state(), ModuleState::InitializeRules);
    assert!(events_of(&log, "init").is_empty());
    assert_eq!(module.load_progress(), 0.0);

    let lifecycle = handle.borrow().clone().expect("handle captured");
    assert!(lifecycle.mark_initialized());

    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");
    assert_eq!(events_of(&log, "init"), vec!["Alpha"]);
}

#[test]
fn test_mark_error_during_initialization() {
    let handle = Rc::new(RefCell::new(None));
    let module_handle = handle.clone();
    let setup = setup("deferred", move |builder| {
        builder.add_rule(Deferred {
            handle: module_handle.clone(),
        })?;
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();

    drive_module(&mut module, &mut ticker, 10, |m| {
        m.rules().state_of::<Deferred>() == Some(RuleState::Initializing)
    })
    .expect("deferred rule initializing");

    let lifecycle = handle.borrow().clone().expect("handle captured");
    lifecycle.mark_error();

    let entry = module
        .rules()
        .entry(RuleKey::of::<Deferred>())
        .expect("entry");
    assert_eq!(entry.state(), RuleState::Unloaded);
    assert!(entry.has_error());

    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");
}

#[test]
fn test_stalled_initialization_is_faulted() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("stalling", move |builder| {
        builder.add_rule(Hanging)?;
        builder.add_rule(Alpha::new(&module_log))?;
        builder.performance_policy(PerformancePolicy {
            init_stall_timeout: Some(Duration::from_millis(1)),
            ..PerformancePolicy::default()
        });
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();

    let running = drive_module(&mut module, &mut ticker, 50, |m| {
        std::thread::sleep(Duration::from_millis(2));
        is_running(m)
    });
    assert!(running.is_some());

    assert_eq!(module.faults().len(), 1);
    assert!(module.faults()[0].is_stall());
    assert_eq!(module.faults()[0].rule, "Hanging");
    assert_eq!(module.rules().state_of::<Hanging>(), Some(RuleState::Unloaded));
    assert_eq!(events_of(&log, "init"), vec!["Alpha"]);
}

#[test]
fn test_update_fault_pauses_module() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("fragile", move |builder| {
        builder.add_rule(Faulty)?;
        builder.add_rule(Alpha::new(&module_log))?;
        builder.exception_policy(ExceptionPolicy {
            on_update: OnExceptionBehaviour::PauseModule,
            ..ExceptionPolicy::default()
        });
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    module.update(&ticker.next());
    assert!(module.is_paused());
    assert!(events_of(&log, "update").is_empty());
    assert!(matches!(module.faults()[0].kind, FaultKind::Error(_)));

    // A paused module does not tick
    let frame = module.update_frame();
    module.update(&ticker.next());
    assert_eq!(module.update_frame(), frame);

    module.restart();
    module.update(&ticker.next());
    assert_eq!(module.update_frame(), frame + 1);
}

#[test]
fn test_skip_tick_stops_the_rest_of_the_frame() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("skippy", move |builder| {
        builder.add_rule(Hiccup { failures_left: 2 })?;
        builder.add_rule(Alpha::new(&module_log))?;
        builder.exception_policy(ExceptionPolicy {
            on_update: OnExceptionBehaviour::SkipTick,
            ..ExceptionPolicy::default()
        });
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    // Every faulting tick skips the rules after Hiccup
    for _ in 0..2 {
        module.update(&ticker.next());
        assert!(events_of(&log, "update").is_empty());
        assert!(!module.is_paused());
    }
    assert_eq!(module.faults().len(), 2);
    assert_eq!(module.rules().state_of::<Hiccup>(), Some(RuleState::Initialized));

    module.update(&ticker.next());
    assert_eq!(events_of(&log, "update"), vec!["Alpha"]);
    assert_eq!(module.faults().len(), 2);
}

#[test]
fn test_update_fault_continues_by_default() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("tolerant", move |builder| {
        builder.add_rule(Faulty)?;
        builder.add_rule(Alpha::new(&module_log))?;
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    module.update(&ticker.next());
    assert_eq!(events_of(&log, "update"), vec!["Alpha"]);
    let faulty = module.rules().entry(RuleKey::of::<Faulty>()).expect("entry");
    assert!(faulty.has_error());
}

#[test]
fn test_load_fault_unloads_module_and_requests_fallback() {
    let log = event_log();
    let module_log = log.clone();
    let fallback = abc_setup("fallback", &event_log());
    let setup = setup("broken", move |builder| {
        builder.add_rule(Alpha::new(&module_log))?;
        builder.add_rule(BrokenInit)?;
        builder.add_rule(Beta::new(&module_log))?;
        builder.exception_policy(
            ExceptionPolicy {
                on_load: OnExceptionBehaviour::UnloadModule,
                ..ExceptionPolicy::default()
            }
            .with_fallback(fallback.clone()),
        );
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();

    drive_module(&mut module, &mut ticker, 20, has_ended).expect("module ended");

    assert_eq!(events_of(&log, "init"), vec!["Alpha"]);
    assert_eq!(events_of(&log, "unload"), vec!["Alpha"]);
    let commands = module.take_commands();
    assert!(matches!(
        commands.as_slice(),
        [ModuleCommand::SwitchTo(setup)] if setup.name() == "fallback"
    ));
}

#[test]
fn test_quit_reaches_every_rule() {
    let log = event_log();
    let mut module = started_module(abc_setup("scene", &log));

    let failures = module.quit();

    assert!(failures.is_empty());
    assert_eq!(events_of(&log, "quit"), vec!["Alpha", "Beta", "Gamma"]);
}

#[test]
fn test_invalid_schedule_is_a_setup_fault() {
    let setup = setup("invalid", |builder| {
        builder.add_rule(Hanging)?;
        builder.schedule(RuleScheduling::every_tick(RuleKey::of::<Faulty>()));
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();

    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");
    assert_eq!(module.faults().len(), 1);
    assert!(matches!(module.faults()[0].kind, FaultKind::Validation(_)));
    assert!(module.rules().is_empty());
}

fn leaky_setup(log: &EventLog, skip_unload_if_exception: bool) -> tickframe::module::SharedSetup {
    let log = log.clone();
    setup("leaky", move |builder| {
        builder.add_rule(Alpha::new(&log))?;
        builder.add_rule(LeakyUnload)?;
        builder.add_rule(Gamma::new(&log))?;
        builder.exception_policy(ExceptionPolicy {
            on_unload: OnExceptionBehaviour::PauseModule,
            skip_unload_if_exception,
            ..ExceptionPolicy::default()
        });
        Ok(())
    })
}

#[test]
fn test_unload_fault_is_skipped_when_configured() {
    let log = event_log();
    let mut module = started_module(leaky_setup(&log, true));
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    module.unload();
    drive_module(&mut module, &mut ticker, 10, has_ended).expect("module ended");

    assert!(!module.is_paused());
    assert_eq!(events_of(&log, "unload"), vec!["Gamma", "Alpha"]);
    assert_eq!(module.faults().len(), 1);
    assert_eq!(module.faults()[0].rule, "LeakyUnload");
    assert_eq!(module.faults()[0].phase, RulePhase::Unload);
    let leaky = module.rules().entry(RuleKey::of::<LeakyUnload>()).expect("entry");
    assert_eq!(leaky.state(), RuleState::Unloaded);
    assert!(leaky.has_error());
}

#[test]
fn test_unload_fault_applies_policy_when_not_skipped() {
    let log = event_log();
    let mut module = started_module(leaky_setup(&log, false));
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    module.unload();
    module.update(&ticker.next());

    assert!(module.is_paused());
    assert_eq!(module.state(), ModuleState::UnloadRules);
    assert_eq!(events_of(&log, "unload"), vec!["Gamma"]);

    // Stays put while paused
    for _ in 0..3 {
        module.update(&ticker.next());
    }
    assert_eq!(module.state(), ModuleState::UnloadRules);
    assert_eq!(events_of(&log, "unload"), vec!["Gamma"]);

    module.restart();
    drive_module(&mut module, &mut ticker, 10, has_ended).expect("module ended");
    assert_eq!(events_of(&log, "unload"), vec!["Gamma", "Alpha"]);
    assert_eq!(module.faults().len(), 1);
}

#[test]
fn test_stalled_unload_is_faulted() {
    let log = event_log();
    let module_log = log.clone();
    let setup = setup("sticky", move |builder| {
        builder.add_rule(Alpha::new(&module_log))?;
        builder.add_rule(StuckUnload)?;
        builder.performance_policy(PerformancePolicy {
            unload_stall_timeout: Some(Duration::from_millis(1)),
            ..PerformancePolicy::default()
        });
        Ok(())
    });
    let mut module = started_module(setup);
    let mut ticker = Ticker::new();
    drive_module(&mut module, &mut ticker, 10, is_running).expect("module running");

    module.unload();
    module.update(&ticker.next());
    assert_eq!(module.rules().state_of::<StuckUnload>(), Some(RuleState::Unloading));
    // Alpha waits behind the rule still unloading
    assert!(events_of(&log, "unload").is_empty());

    let ended = drive_module(&mut module, &mut ticker, 50, |m| {
        std::thread::sleep(Duration::from_millis(2));
        has_ended(m)
    });
    assert!(ended.is_some());

    assert_eq!(module.faults().len(), 1);
    assert!(module.faults()[0].is_stall());
    assert_eq!(module.faults()[0].rule, "StuckUnload");
    assert_eq!(module.faults()[0].phase, RulePhase::Unload);
    let stuck = module.rules().entry(RuleKey::of::<StuckUnload>()).expect("entry");
    assert_eq!(stuck.state(), RuleState::Unloaded);
    assert!(stuck.has_error());
    assert_eq!(events_of(&log, "unload"), vec!["Alpha"]);
}

#[test]
fn test_injection_is_batched_under_zero_budget() {
    let seeded = |budget: Option<Duration>| {
        setup("seeded", move |builder| {
            builder.add_rule(SeedProvider)?;
            builder.add_rule(SeedReader::default())?;
            builder.add_rule(Hanging)?;
            builder.performance_policy(PerformancePolicy {
                max_tick_budget: budget,
                ..PerformancePolicy::default()
            });
            Ok(())
        })
    };
    let injecting = |m: &tickframe::module::Module| m.state() == ModuleState::DependencyInjection;

    let mut unbounded = started_module(seeded(None));
    let mut ticker = Ticker::new();
    let unbounded_ticks =
        drive_module(&mut unbounded, &mut ticker, 20, |m| !injecting(m)).expect("injected");
    assert_eq!(unbounded_ticks, 1);

    let mut batched = started_module(seeded(Some(Duration::ZERO)));
    let mut ticker = Ticker::new();
    let batched_ticks =
        drive_module(&mut batched, &mut ticker, 20, |m| !injecting(m)).expect("injected");

    // One rule per tick, once to collect and once to inject
    assert!(batched_ticks >= 6, "injection took {} ticks", batched_ticks);
    assert_eq!(batched.state(), ModuleState::InitializeRules);
    assert!(batched.faults().is_empty());
    let reader = batched.rules().get::<SeedReader>().expect("reader");
    assert_eq!(reader.seed, Some(11));
}
