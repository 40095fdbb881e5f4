use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cube shape mismatch: observation {obs:?}, model {model:?}")]
    ShapeMismatch {
        obs: (usize, usize, usize),
        model: (usize, usize, usize),
    },
    #[error("cubes must be in the padded layout before engine setup")]
    UnpaddedCube,
    #[error("detector noise rms must be positive, got {0}")]
    InvalidNoise(f32),
    #[error("noise weight must be positive, got {0}")]
    InvalidNoiseWeight(f32),
    #[error("beam HPBW must be non-negative, got ({maj}, {min})")]
    InvalidBeam { maj: f32, min: f32 },
    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
