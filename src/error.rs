use crate::checkpoint::CheckpointError;

/// Errors raised by model construction, training and inference.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, detected when a component is built.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Tensor or array shape disagreement at an API boundary.
    #[error("shape error: {0}")]
    Shape(String),

    /// The combined loss became NaN or infinite. Never retried.
    #[error("non-finite loss at step {step}: nll={nll}, kl={kl}, signal={signal}")]
    NonFiniteLoss {
        step: usize,
        nll: f32,
        kl: f32,
        signal: f32,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
