//! Victim selection for cache tiers.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How a full tier chooses the entry to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvictionStrategy {
    /// Least recently accessed.
    Lru,
    /// Least frequently accessed, ties broken by recency.
    Lfu,
    /// Oldest insertion.
    Fifo,
    /// Closest to expiry; entries without a TTL go last.
    Ttl,
    /// Whichever of LRU, LFU or FIFO would have missed least recently.
    Adaptive,
}

impl std::fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionStrategy::Lru => write!(f, "lru"),
            EvictionStrategy::Lfu => write!(f, "lfu"),
            EvictionStrategy::Fifo => write!(f, "fifo"),
            EvictionStrategy::Ttl => write!(f, "ttl"),
            EvictionStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Entry metadata the strategies rank on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RankInfo {
    pub access_seq: u64,
    pub insert_seq: u64,
    pub access_count: u64,
    pub expires_at: Option<Instant>,
}

/// Pick the victim among `candidates` for a concrete (non-adaptive) strategy.
pub(crate) fn select_victim<'a, I>(strategy: EvictionStrategy, candidates: I) -> Option<&'a str>
where
    I: Iterator<Item = (&'a str, RankInfo)>,
{
    match strategy {
        EvictionStrategy::Lru | EvictionStrategy::Adaptive => candidates
            .min_by_key(|(_, r)| r.access_seq)
            .map(|(k, _)| k),
        EvictionStrategy::Lfu => candidates
            .min_by_key(|(_, r)| (r.access_count, r.access_seq))
            .map(|(k, _)| k),
        EvictionStrategy::Fifo => candidates
            .min_by_key(|(_, r)| r.insert_seq)
            .map(|(k, _)| k),
        EvictionStrategy::Ttl => candidates
            .min_by_key(|(_, r)| (r.expires_at.is_none(), r.expires_at, r.insert_seq))
            .map(|(k, _)| k),
    }
}

const CANDIDATES: [EvictionStrategy; 3] = [
    EvictionStrategy::Lru,
    EvictionStrategy::Lfu,
    EvictionStrategy::Fifo,
];

/// Shadow bookkeeping for the adaptive strategy.
///
/// On every eviction each candidate strategy records the key it would have
/// evicted in its ghost list. A later request for a ghosted key is a miss
/// that candidate would have caused, so it is charged to it. The candidate
/// with the fewest charges over the last `window` charges becomes active.
#[derive(Debug)]
pub(crate) struct AdaptiveState {
    active: EvictionStrategy,
    ghosts: [VecDeque<String>; 3],
    ghost_capacity: usize,
    charges: VecDeque<usize>,
    window: usize,
    switches: u64,
}

impl AdaptiveState {
    pub fn new(ghost_capacity: usize, window: usize) -> Self {
        Self {
            active: EvictionStrategy::Lru,
            ghosts: Default::default(),
            ghost_capacity: ghost_capacity.max(1),
            charges: VecDeque::new(),
            window: window.max(1),
            switches: 0,
        }
    }

    pub fn active(&self) -> EvictionStrategy {
        self.active
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Record what each candidate would evict right now.
    pub fn record_eviction<'a, I>(&mut self, candidates: I)
    where
        I: Iterator<Item = (&'a str, RankInfo)> + Clone,
    {
        for (i, strategy) in CANDIDATES.iter().enumerate() {
            if let Some(victim) = select_victim(*strategy, candidates.clone()) {
                let ghosts = &mut self.ghosts[i];
                if ghosts.len() >= self.ghost_capacity {
                    ghosts.pop_front();
                }
                ghosts.push_back(victim.to_string());
            }
        }
    }

    /// Charge every candidate that ghosted `key`, then re-pick the active one.
    pub fn on_request(&mut self, key: &str) {
        let mut charged = false;
        for (i, ghosts) in self.ghosts.iter_mut().enumerate() {
            if let Some(pos) = ghosts.iter().position(|k| k == key) {
                ghosts.remove(pos);
                if self.charges.len() >= self.window {
                    self.charges.pop_front();
                }
                self.charges.push_back(i);
                charged = true;
            }
        }
        if charged {
            self.reselect();
        }
    }

    /// Forget `key` once it is resident again.
    pub fn forget(&mut self, key: &str) {
        for ghosts in self.ghosts.iter_mut() {
            ghosts.retain(|k| k != key);
        }
    }

    fn reselect(&mut self) {
        let mut counts = [0usize; 3];
        for &i in &self.charges {
            counts[i] += 1;
        }
        let current = CANDIDATES
            .iter()
            .position(|s| *s == self.active)
            .unwrap_or(0);

        let mut best = current;
        for i in 0..CANDIDATES.len() {
            if counts[i] < counts[best] {
                best = i;
            }
        }
        if best != current {
            debug!(
                from = %self.active,
                to = %CANDIDATES[best],
                "Adaptive eviction switched strategy"
            );
            self.active = CANDIDATES[best];
            self.switches += 1;
        }
    }
}

/// Absolute expiry for an entry created at `created` with `ttl`.
pub(crate) fn expiry(created: Instant, ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| created + ttl)
}
