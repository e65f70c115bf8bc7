use thiserror::Error;

#[cfg(feature = "gpu")]
use crate::unmix::gpu::GpuError;

/// Errors produced by the unmixing and remixing engine
#[derive(Debug, Error)]
pub enum ColormapError {
    /// The two reference colors are (nearly) parallel, so the decomposition is
    /// ill-conditioned. `unmix` still runs; this is only returned by explicit
    /// validation.
    #[error(
        "Mixing matrix is degenerate: reference colors are nearly parallel (sin² of angle = {sine_squared:.2e})"
    )]
    InvalidMixingMatrix { sine_squared: f32 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("GPU device unavailable: {0}")]
    DeviceUnavailable(String),

    #[cfg(feature = "gpu")]
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("Invalid settings file: {0}")]
    Settings(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ColormapError>;

/// Shorthand for building an `InvalidParameter` error
pub(crate) fn invalid(message: impl Into<String>) -> ColormapError {
    ColormapError::InvalidParameter(message.into())
}
