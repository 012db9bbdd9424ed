//! Bridge tuning knobs.
//!
//! Defaults match what hosts ship with. `from_env` lets a deployment override
//! them without a rebuild:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `TETHER_QUEUE_CAPACITY` | one-shot queue capacity (submitters block when full) |
//! | `TETHER_DRAIN_BUDGET` | one-shot tasks run per tick; `0` or `all` drains everything |
//! | `TETHER_TIMER_PREFIX` | prefix of the per-tick timer name |

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_DRAIN_BUDGET: usize = 3;
pub const DEFAULT_TIMER_PREFIX: &str = "TetherThinkQueue";

/// How many queued one-shot tasks a single tick may run.
///
/// `Bounded` caps the time a tick can add to the host frame; leftovers stay at
/// the head of the queue for the next tick. `All` minimises completion latency
/// at the cost of unpredictable frame time under bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    Bounded(usize),
    All,
}

impl DrainPolicy {
    /// Tasks one tick may run when `queued` were waiting as the drain began.
    ///
    /// Work enqueued while the drain runs always waits for the next tick.
    /// `Bounded(0)` behaves like `All` rather than stalling the queue.
    pub fn budget(self, queued: usize) -> usize {
        match self {
            DrainPolicy::Bounded(0) | DrainPolicy::All => queued,
            DrainPolicy::Bounded(n) => n.min(queued),
        }
    }
}

impl Default for DrainPolicy {
    fn default() -> Self {
        DrainPolicy::Bounded(DEFAULT_DRAIN_BUDGET)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    pub drain_policy: DrainPolicy,
    pub timer_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_policy: DrainPolicy::default(),
            timer_prefix: DEFAULT_TIMER_PREFIX.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `TETHER_*` environment variables.
    /// Unparsable or zero values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(capacity) = get("TETHER_QUEUE_CAPACITY")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&v| v != 0)
        {
            config.queue_capacity = capacity;
        }

        if let Some(budget) = get("TETHER_DRAIN_BUDGET") {
            let budget = budget.trim();
            if budget == "0" || budget.eq_ignore_ascii_case("all") {
                config.drain_policy = DrainPolicy::All;
            } else if let Ok(n) = budget.parse::<usize>() {
                config.drain_policy = DrainPolicy::Bounded(n);
            }
        }

        if let Some(prefix) = get("TETHER_TIMER_PREFIX").filter(|v| !v.trim().is_empty()) {
            config.timer_prefix = prefix.trim().to_string();
        }

        config
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn timer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.timer_prefix = prefix.into();
        self
    }
}
