use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Process-wide runtime counters, shared by every module and orchestrator.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    pub ticks: AtomicU64,
    pub modules_loaded: AtomicU64,
    pub modules_unloaded: AtomicU64,
    pub rule_faults: AtomicU64,
    pub stalls: AtomicU64,
    pub escalations: AtomicU64,
    pub transitions_run: AtomicU64,
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_module_loaded(&self) {
        self.modules_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_module_unloaded(&self) {
        self.modules_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.rule_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
        warn!("Rule stall detected");
    }

    pub fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self) {
        self.transitions_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            modules_loaded: self.modules_loaded.load(Ordering::Relaxed),
            modules_unloaded: self.modules_unloaded.load(Ordering::Relaxed),
            rule_faults: self.rule_faults.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            transitions_run: self.transitions_run.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Runtime stats: ticks={}, modules_loaded={}, modules_unloaded={}, faults={}, stalls={}, escalations={}, transitions={}",
            stats.ticks,
            stats.modules_loaded,
            stats.modules_unloaded,
            stats.rule_faults,
            stats.stalls,
            stats.escalations,
            stats.transitions_run
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeSnapshot {
    pub ticks: u64,
    pub modules_loaded: u64,
    pub modules_unloaded: u64,
    pub rule_faults: u64,
    pub stalls: u64,
    pub escalations: u64,
    pub transitions_run: u64,
}

/// Time a lifecycle phase and log its duration when finished
pub struct PhaseTimer {
    module: String,
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    pub fn new(module: &str, phase: &'static str) -> Self {
        Self {
            module: module.to_string(),
            phase,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            module = %self.module,
            phase = self.phase,
            duration_ms = duration.as_millis(),
            "Phase completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let stats = RuntimeStats::new();
        stats.record_tick();
        stats.record_tick();
        stats.record_module_loaded();
        stats.record_fault();

        let snapshot = stats.get_stats();
        assert_eq!(snapshot.ticks, 2);
        assert_eq!(snapshot.modules_loaded, 1);
        assert_eq!(snapshot.rule_faults, 1);
        assert_eq!(snapshot.stalls, 0);
    }
}
