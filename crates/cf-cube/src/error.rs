use thiserror::Error;

/// Errors produced while reading, writing, or interpreting a data cube.
///
/// Each header/axis violation has its own variant so that callers can tell
/// exactly which card failed validation. No partial cube is ever returned
/// alongside an error.
#[derive(Error, Debug)]
pub enum CubeError {
    #[error("read error: {0}")]
    Read(#[from] std::io::Error),
    #[error("file too short: expected {expected} data bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("keyword NAXIS not found")]
    NoNaxis,
    #[error("keyword NAXIS has the wrong value ({0}, must be >= 3)")]
    WrongNaxis(i64),
    #[error("keyword NAXIS{0} not found")]
    NoNaxisI(usize),
    #[error("NAXIS{axis} has the wrong value ({value})")]
    WrongNaxisI { axis: usize, value: i64 },
    #[error("keyword CRPIX{0} not found")]
    NoCrpix(usize),
    #[error("keyword CRVAL{0} not found")]
    NoCrval(usize),
    #[error("keyword CDELT{0} not found")]
    NoCdelt(usize),
    #[error("keyword CTYPE{0} not found")]
    NoCtype(usize),
    #[error("CTYPE{axis} has the wrong value (expected {expected})")]
    WrongCtype { axis: usize, expected: &'static str },
    #[error("keyword EPOCH (or EQUINOX) not found")]
    NoEpoch,
    #[error("keyword EPOCH has an unreadable value")]
    WrongEpoch,
    #[error("keyword BUNIT not found or unreadable")]
    WrongBunit,
    #[error("BITPIX has an unsupported value ({0})")]
    WrongBitpix(i64),
    #[error("coordinate conversion failed")]
    Wcs,
}

pub type Result<T> = std::result::Result<T, CubeError>;
