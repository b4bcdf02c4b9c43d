//! Demo module used by the `tickframe` binary.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};

use tickframe::dependencies::{CapabilityRegistry, DependencySource, Injector};
use tickframe::error::{DependencyError, ValidationError};
use tickframe::module::{FnSetup, SharedSetup};
use tickframe::rules::{Completion, Rule, RuleContext, RuleKey, RuleScheduling};
use tickframe::transition::TimedTransition;

/// Frames counted by [`FrameCounter`], shared with anyone who asks.
#[derive(Debug, Default)]
pub struct FrameCount(Cell<u64>);

impl FrameCount {
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

#[derive(Default)]
pub struct FrameCounter {
    count: Rc<FrameCount>,
}

impl Rule for FrameCounter {
    fn provides(&self, registry: &mut CapabilityRegistry<'_>) -> Result<(), ValidationError> {
        registry.provide(self.count.clone())
    }

    fn on_update(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<()> {
        self.count.0.set(self.count.get() + 1);
        Ok(())
    }
}

/// Logs the frame count on a schedule.
#[derive(Default)]
pub struct FrameReporter {
    count: Option<Rc<FrameCount>>,
}

impl Rule for FrameReporter {
    fn inject(&mut self, injector: &Injector<'_>) -> Result<(), DependencyError> {
        self.count = Some(injector.require::<FrameCount>(DependencySource::Module)?);
        Ok(())
    }

    fn on_update(&mut self, ctx: &mut RuleContext<'_>) -> anyhow::Result<()> {
        if let Some(count) = &self.count {
            info!(module = %ctx.module_name(), frames = count.get(), "Frame report");
        }
        Ok(())
    }
}

/// Initialization finishes on a background task.
pub struct AssetLoader {
    delay: Duration,
}

impl AssetLoader {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Rule for AssetLoader {
    fn on_initialize(&mut self, ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        let handle = ctx.lifecycle();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(delay_ms = delay.as_millis() as u64, "Assets loaded");
            handle.mark_initialized();
        });
        Ok(Completion::Pending)
    }
}

/// Brings up the HUD submodule once the scene is initialized.
pub struct HudSpawner;

impl Rule for HudSpawner {
    fn on_initialize(&mut self, ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        ctx.add_submodule("hud", hud_setup());
        Ok(Completion::Done)
    }

    fn on_unload(&mut self, ctx: &mut RuleContext<'_>) -> anyhow::Result<Completion> {
        ctx.remove_submodule("hud");
        Ok(Completion::Done)
    }
}

/// Reads the scene's frame count through the parent scope.
#[derive(Default)]
pub struct HudOverlay {
    frames: Option<Rc<FrameCount>>,
}

impl Rule for HudOverlay {
    fn inject(&mut self, injector: &Injector<'_>) -> Result<(), DependencyError> {
        self.frames = injector.optional::<FrameCount>(DependencySource::Related);
        Ok(())
    }

    fn on_late_update(&mut self, _ctx: &mut RuleContext<'_>) -> anyhow::Result<()> {
        if let Some(frames) = &self.frames {
            debug!(frames = frames.get(), "HUD refreshed");
        }
        Ok(())
    }
}

pub fn hud_setup() -> SharedSetup {
    FnSetup::new("hud", |builder| {
        builder.add_rule(HudOverlay::default())?;
        Ok(())
    })
    .shared()
}

/// Scene with a counter, a scheduled reporter, a background loader and a HUD.
pub fn scene_setup(report_every: i64, transition_ticks: u32, load_delay: Duration) -> SharedSetup {
    FnSetup::new("demo-scene", move |builder| {
        let counter = builder.add_rule(FrameCounter::default())?;
        let reporter = builder.add_rule(FrameReporter::default())?;
        builder.add_rule(AssetLoader::new(load_delay))?;
        builder.add_rule(HudSpawner)?;

        builder.schedule(RuleScheduling::every_tick(counter));
        builder.schedule(RuleScheduling::new(reporter, report_every.max(1), 0)?);
        builder.schedule(RuleScheduling::every_tick(RuleKey::of::<HudSpawner>()));
        Ok(())
    })
    .with_transition(move || Box::new(TimedTransition::fade("loading", transition_ticks)))
    .shared()
}
