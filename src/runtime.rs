//! Host-facing entry point: owns the root orchestrator, the service scope and the clock.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::dependencies::DependencyProvider;
use crate::error::{RuleFault, ValidationError};
use crate::module::{Escalation, SharedSetup};
use crate::orchestrator::{Orchestrator, OrchestratorEnv, OrchestratorState, OrchestratorStatus};
use crate::stats::{RuntimeSnapshot, RuntimeStats};
use crate::time::{Clock, TickContext};

/// Collects process-wide services before the runtime starts.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    services: DependencyProvider,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            services: DependencyProvider::new("services"),
        }
    }

    /// Register a service under capability `C`, visible to every module.
    pub fn service<C: ?Sized + 'static>(
        mut self,
        provider: &str,
        value: Rc<C>,
    ) -> Result<Self, ValidationError> {
        self.services.register(provider, value)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Runtime, ValidationError> {
        let stats = Arc::new(RuntimeStats::new());
        let env = OrchestratorEnv {
            parent_provider: None,
            services: Some(Rc::new(self.services)),
            stats: stats.clone(),
            defaults: self.config.module_defaults(),
            depth: 0,
        };
        let mut root = Orchestrator::new("root", env)?;
        root.start()?;
        info!("Runtime started");

        Ok(Runtime {
            root,
            clock: Clock::new(),
            config: self.config,
            stats,
        })
    }
}

pub struct Runtime {
    root: Orchestrator,
    clock: Clock,
    config: RuntimeConfig,
    stats: Arc<RuntimeStats>,
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn new(config: RuntimeConfig) -> Result<Self, ValidationError> {
        RuntimeBuilder::new(config).build()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn root(&self) -> &Orchestrator {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Orchestrator {
        &mut self.root
    }

    pub fn load_module(&mut self, setup: SharedSetup) {
        self.root.load_module(setup);
    }

    /// Advance one tick of `delta` and drive the whole tree.
    pub fn tick(&mut self, delta: Duration) -> TickContext {
        let ctx = self.clock.advance(delta);
        self.stats.record_tick();
        self.root.update(&ctx);
        self.handle_escalation();
        ctx
    }

    /// Fixed-rate pass over running modules, using the latest tick's timing.
    pub fn fixed_tick(&mut self) {
        let ctx = self.clock.last();
        self.root.fixed_update(&ctx);
        self.handle_escalation();
    }

    pub fn late_tick(&mut self) {
        let ctx = self.clock.last();
        self.root.late_update(&ctx);
        self.handle_escalation();
    }

    fn handle_escalation(&mut self) {
        match self.root.take_escalation() {
            Some(Escalation::PauseAll) => {
                warn!("Pausing every module after escalated fault");
                self.root.pause_all();
            }
            Some(Escalation::StopAll) => {
                warn!("Stopping every module after escalated fault");
                self.root.reset();
            }
            None => {}
        }
    }

    pub fn pause_all(&mut self) {
        self.root.pause_all();
    }

    pub fn restart_all(&mut self) {
        self.root.restart_all();
    }

    pub fn reset(&mut self) {
        self.root.reset();
    }

    pub fn is_idle(&self) -> bool {
        self.root.is_idle()
    }

    pub fn is_operational(&self) -> bool {
        self.root.state() == OrchestratorState::Operational
    }

    pub fn status(&self) -> OrchestratorStatus {
        self.root.status()
    }

    pub fn stats(&self) -> RuntimeSnapshot {
        self.stats.get_stats()
    }

    /// Application shutdown: every rule's quit hook runs, failures are logged and returned.
    pub fn quit(&mut self) -> Vec<RuleFault> {
        let failures = self.root.quit();
        if !failures.is_empty() {
            warn!(failures = failures.len(), "Some rules failed to quit cleanly");
        }
        self.stats.log_stats();
        info!("Runtime quit");
        failures
    }
}
