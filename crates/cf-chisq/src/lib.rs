//! `cf-chisq` - FFT beam convolution and chi-square evaluation for cubefit.
//!
//! This crate provides:
//! - `KernelCache`: precomputed Fourier-domain Gaussian factors for the
//!   beam and the half-beam weight path
//! - `ConvolutionEngine`: separable real-to-complex convolution on the
//!   padded cube layout
//! - `WeightMap`: the quantisation-noise weight cube
//! - `ChiSquareEngine`: the owning facade that evaluates chi-square for a
//!   model realization at a given spectral dispersion

pub mod convolve;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod reduce;
pub mod weight;

// Re-export primary types at the crate root for convenience.
pub use convolve::{ConvolutionEngine, PlanEffort};
pub use engine::{ChiSquareEngine, EngineConfig, EngineMode};
pub use error::{EngineError, Result};
pub use kernel::{KernelCache, SIGMA_PER_HPBW};
pub use reduce::ReduceStrategy;
pub use weight::WeightMap;
