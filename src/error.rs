use thiserror::Error;

/// Errors surfaced by the quantization pipeline.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("a value given to the library was outside the allowed range")]
    ValueOutOfRange,
    #[error("not enough memory to hold the image or its intermediate buffers")]
    OutOfMemory,
    #[error("the supplied output buffer is too small for the remapped image")]
    BufferTooSmall,
    #[error("image degradation exceeds the configured minimum quality")]
    QualityTooLow,
}
