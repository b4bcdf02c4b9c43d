// Tick timing: per-tick context, the clock producing it, and budget tracking

use serde::Serialize;
use std::time::{Duration, Instant};

/// Timing information delivered with every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TickContext {
    /// Host-supplied time step for this tick.
    pub delta: Duration,
    /// Sum of all deltas so far.
    pub elapsed: Duration,
    /// Monotonic tick number, starting at 0.
    pub tick: u64,
    /// Wall-clock time since the clock started.
    pub real_elapsed: Duration,
}

/// Produces [`TickContext`] values from host-supplied deltas.
#[derive(Debug, Clone)]
pub struct Clock {
    started: Instant,
    elapsed: Duration,
    next_tick: u64,
    last: TickContext,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            elapsed: Duration::ZERO,
            next_tick: 0,
            last: TickContext::default(),
        }
    }

    pub fn advance(&mut self, delta: Duration) -> TickContext {
        self.elapsed += delta;
        let ctx = TickContext {
            delta,
            elapsed: self.elapsed,
            tick: self.next_tick,
            real_elapsed: self.started.elapsed(),
        };
        self.next_tick += 1;
        self.last = ctx;
        ctx
    }

    /// Context of the most recent tick.
    pub fn last(&self) -> TickContext {
        self.last
    }

    pub fn ticks(&self) -> u64 {
        self.next_tick
    }
}

/// Wall-clock allowance for one tick of work.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TickBudget {
    started: Instant,
    limit: Option<Duration>,
}

impl TickBudget {
    pub fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }
}
