//! `cf-cube` - Spectral-line data cubes with FITS I/O and WCS for cubefit.
//!
//! This crate provides:
//! - A `Cube` type: a 3-D f32 grid with the padded x-row layout an in-place
//!   real-to-complex FFT needs
//! - A validating FITS reader/writer with a regenerated canonical header
//! - Pixel/world coordinate conversion for the (RA, DEC, spectral) triplet
//! - The cube error taxonomy shared by the reader and the fitting engine

pub mod cube;
pub mod error;
pub mod fits;
pub mod header;
pub mod wcs;

// Re-export primary types at the crate root for convenience.
pub use cube::{Cube, Meta, HI_REST_FREQ};
pub use error::{CubeError, Result};
pub use fits::canonical_header;
pub use header::{Header, FITS_BLOCK, FITS_CARD};
pub use wcs::{Axis, Wcs};
