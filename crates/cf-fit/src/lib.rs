//! `cf-fit` - Derivative-free minimiser wrapper for cubefit.
//!
//! This crate provides:
//! - A `Fitter` acquisition object with typed put/get access, action verbs,
//!   grid normalisation and loop control
//! - Three interchangeable back-ends: golden-section nested intervals,
//!   Nelder-Mead simplex, and particle swarm with pattern search
//! - The `Objective` trait (closures implement it) with a batched variant
//!   for the swarm's vectorised mode
//! - A reproducible shuffled random stream implementing `rand::RngCore`

pub mod control;
pub mod error;
pub mod golden;
pub mod objective;
pub mod rng;
pub mod simplex;
pub mod swarm;

// Re-export primary types at the crate root for convenience.
pub use control::{Action, Fitter, Method, StopHandle};
pub use error::{ErrorFlags, Result};
pub use golden::Golden;
pub use objective::Objective;
pub use rng::ShuffleRng;
pub use simplex::Simplex;
pub use swarm::{Swarm, SwarmOptions};
