use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Unrecognized configuration value (loss/solver name, bad dimension).
    /// Fatal at startup, before any training step runs.
    #[error("config error: {0}")]
    Config(String),

    /// A sampled record carries no valid object. The provider is expected
    /// to resample; the propagation engine never accepts such a clip.
    #[error("data error: {0}")]
    Data(String),

    /// Tensor dimension mismatch between mask/frame/embedding operands.
    /// Never caught and ignored: a tolerated mismatch would silently
    /// corrupt the attention readout downstream.
    #[error("shape error: {0}")]
    Shape(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache codec error: {0}")]
    Cache(#[from] bincode::Error),

    #[error("config codec error: {0}")]
    ConfigCodec(#[from] serde_json::Error),
}

impl Error {
    pub fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }
}
