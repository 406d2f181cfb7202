//! Error types raised while building the networks.
//!
//! Every variant is a construction-time failure: a network either comes out
//! dimensionally consistent or it is not built at all.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    /// Image size does not agree with the stage strides or resampling schedule.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid stage configuration: {0}")]
    InvalidStageConfig(String),

    #[error("unsupported block variant (bottleneck: {bottleneck}, version: {version})")]
    InvalidVariantSelection { bottleneck: bool, version: u8 },

    #[error("parameter scope '{0}' is already in use, pass reuse=true to share it")]
    ScopeCollision(String),

    #[error("parameter scope '{0}' does not exist and cannot be reused")]
    UnknownScope(String),

    #[error("parameter '{0}' is missing from the reused scope")]
    MissingParameter(String),

    #[error("parameter '{name}' has shape {found:?}, expected {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    /// Channel depth schedule cannot be represented exactly.
    #[error("invalid filter schedule: {0}")]
    FilterSchedule(String),

    #[error("invalid residual block: {0}")]
    InvalidBlock(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input tensor: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Tch(#[from] tch::TchError),
}
