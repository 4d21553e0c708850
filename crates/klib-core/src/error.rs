use thiserror::Error;

/// Errors raised while describing views and layouts.
#[derive(Debug, Error)]
pub enum KlibError {
    #[error("Rank mismatch: shape has {shape} dims, strides has {strides}")]
    RankMismatch { shape: usize, strides: usize },

    #[error("Layout offset arithmetic overflowed")]
    LayoutOverflow,

    #[error("Backing storage too small: need {needed} bytes, have {available}")]
    StorageTooSmall { needed: usize, available: usize },

    #[error("View does not own its storage and cannot be restrided")]
    Unowned,

    #[error("Parse error: {0}")]
    Parse(String),
}
