//! BUGGIFY fault injection.
//!
//! Every decision point that can fail in production (a segment write, an
//! fsync, a push over the wire) gets a named injection site. Under DST the
//! simulated stores and the local messaging cluster consult these sites
//! with a seeded RNG, so a failing seed replays the same faults.
//!
//! ```ignore
//! if crate::buggify!(&mut rng, faults::disk::FSYNC_FAIL) {
//!     return Err(SegmentError::FsyncFailed("injected".into()));
//! }
//! ```
//!
//! Configuration and stats are thread-local: each DST seed runs on its own
//! thread (or sets its config before starting) and never sees another
//! seed's counters.

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use std::cell::RefCell;
use std::collections::HashMap;

/// Per-fault check/trigger counters.
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    pub checks: HashMap<String, u64>,
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn record_check(&mut self, fault_id: &str) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_trigger(&mut self, fault_id: &str) {
        *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn total_triggers(&self) -> u64 {
        self.triggers.values().sum()
    }
}

#[derive(Debug, Default)]
struct BuggifyContext {
    config: FaultConfig,
    stats: BuggifyStats,
    suppressed: bool,
}

thread_local! {
    static BUGGIFY_CONTEXT: RefCell<BuggifyContext> = RefCell::new(BuggifyContext::default());
}

pub fn set_config(config: FaultConfig) {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow_mut().config = config);
}

pub fn get_stats() -> BuggifyStats {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

pub fn reset_stats() {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow_mut().stats = BuggifyStats::default());
}

/// Disables injection until dropped. Used around recovery paths that must
/// observe the store as it is.
pub struct BuggifySuppressor {
    previous: bool,
}

impl BuggifySuppressor {
    pub fn new() -> Self {
        let previous = BUGGIFY_CONTEXT.with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            std::mem::replace(&mut ctx.suppressed, true)
        });
        BuggifySuppressor { previous }
    }
}

impl Default for BuggifySuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BuggifySuppressor {
    fn drop(&mut self) {
        let previous = self.previous;
        BUGGIFY_CONTEXT.with(|ctx| ctx.borrow_mut().suppressed = previous);
    }
}

/// Check a fault site against the thread's configured probability.
#[inline]
pub fn should_buggify<R: crate::io::Rng>(rng: &mut R, fault_id: &str) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);
        if ctx.suppressed {
            return false;
        }
        let prob = ctx.config.get(fault_id);
        if prob <= 0.0 {
            return false;
        }
        let triggered = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0 < prob;
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

/// Check a fault site with an explicit probability. Still gated by the
/// thread's `enabled` switch.
#[inline]
pub fn should_buggify_with_prob<R: crate::io::Rng>(
    rng: &mut R,
    fault_id: &str,
    probability: f64,
) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);
        if ctx.suppressed || !ctx.config.enabled {
            return false;
        }
        let triggered =
            rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0 < probability.clamp(0.0, 1.0);
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}

#[macro_export]
macro_rules! suppress_buggify {
    () => {
        $crate::buggify::BuggifySuppressor::new()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulation::SimulatedRng;

    #[test]
    fn test_buggify_disabled() {
        set_config(FaultConfig::disabled());
        let mut rng = SimulatedRng::new(1);
        for _ in 0..1000 {
            assert!(!buggify!(&mut rng, faults::network::PACKET_DROP));
            assert!(!buggify!(&mut rng, faults::disk::WRITE_FAIL, 1.0));
        }
    }

    #[test]
    fn test_buggify_with_prob() {
        set_config(FaultConfig::new());
        let mut rng = SimulatedRng::new(2);
        assert!((0..100).all(|_| buggify!(&mut rng, "test.always", 1.0)));
        assert!(!(0..100).any(|_| buggify!(&mut rng, "test.never", 0.0)));
    }

    #[test]
    fn test_buggify_stats() {
        reset_stats();
        set_config(FaultConfig::moderate());
        let mut rng = SimulatedRng::new(3);
        for _ in 0..1000 {
            let _ = buggify!(&mut rng, faults::network::PACKET_DROP);
        }
        let stats = get_stats();
        assert_eq!(stats.checks.get(faults::network::PACKET_DROP), Some(&1000));
        let triggers = stats
            .triggers
            .get(faults::network::PACKET_DROP)
            .copied()
            .unwrap_or(0);
        assert!(triggers > 0 && triggers < 100, "triggers: {}", triggers);
    }

    #[test]
    fn test_suppression_nests() {
        set_config(FaultConfig::new());
        let mut rng = SimulatedRng::new(4);
        {
            let _outer = suppress_buggify!();
            {
                let _inner = suppress_buggify!();
            }
            assert!(!buggify!(&mut rng, "test.suppressed", 1.0));
        }
        assert!(buggify!(&mut rng, "test.after_suppress", 1.0));
    }

    #[test]
    fn test_same_seed_same_faults() {
        set_config(FaultConfig::chaos());
        let run = |seed| {
            let mut rng = SimulatedRng::new(seed);
            (0..200)
                .map(|_| buggify!(&mut rng, faults::disk::WRITE_FAIL))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(11), run(11));
    }
}
