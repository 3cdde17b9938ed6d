//! Randomness for simulation.
//!
//! Every fault-injection site and every simulated component draws from an
//! [`Rng`], so a DST run is fully determined by its seed.

pub mod simulation;

/// Source of randomness used by buggify and the simulated stores.
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `[min, max)`. Returns `min` when the range is empty.
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    fn shuffle<T>(&mut self, slice: &mut [T]);
}
