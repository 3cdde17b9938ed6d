//! Per-thread fault probabilities.

use super::faults::ALL_FAULTS;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Master switch; when false nothing triggers, not even explicit
    /// probability overrides.
    pub enabled: bool,
    /// Scales every configured probability (clamped to 1.0).
    pub global_multiplier: f64,
    probabilities: HashMap<String, f64>,
}

impl FaultConfig {
    /// Enabled, with no per-fault probabilities registered.
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            global_multiplier: 1.0,
            probabilities: HashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            ..Self::new()
        }
    }

    /// Every known fault at its baseline probability.
    pub fn moderate() -> Self {
        let mut config = Self::new();
        for (id, prob) in ALL_FAULTS {
            config.set(id, *prob);
        }
        config
    }

    /// Baseline probabilities multiplied by ten.
    pub fn chaos() -> Self {
        FaultConfig {
            global_multiplier: 10.0,
            ..Self::moderate()
        }
    }

    pub fn set(&mut self, fault_id: &str, probability: f64) {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
    }

    pub fn with(mut self, fault_id: &str, probability: f64) -> Self {
        self.set(fault_id, probability);
        self
    }

    /// Effective probability for a fault, 0.0 when disabled or unknown.
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let base = self.probabilities.get(fault_id).copied().unwrap_or(0.0);
        (base * self.global_multiplier).clamp(0.0, 1.0)
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buggify::faults::disk;

    #[test]
    fn test_disabled_returns_zero() {
        let config = FaultConfig::moderate();
        assert!(config.get(disk::WRITE_FAIL) > 0.0);
        let config = FaultConfig {
            enabled: false,
            ..config
        };
        assert_eq!(config.get(disk::WRITE_FAIL), 0.0);
    }

    #[test]
    fn test_chaos_multiplies_and_clamps() {
        let config = FaultConfig::chaos().with("x", 0.5);
        assert!((config.get(disk::WRITE_FAIL) - 0.1).abs() < 1e-9);
        assert_eq!(config.get("x"), 1.0);
    }
}
