use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use machine_learning::MlErr;
use safetensors::SafeTensorError;

/// The result type used in the entire trainer.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// All errors that can occur while setting up or running a training run.
#[derive(Debug)]
pub enum TrainErr {
    /// Invalid configuration, caught before any work is done.
    InvalidConfig(String),
    /// A checkpoint is missing an entry or holds one of the wrong shape.
    Checkpoint(String),
    Ml(MlErr),
    Json(serde_json::Error),
    Safetensors(SafeTensorError),
    Io(io::Error),
}

impl Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Checkpoint(msg) => write!(f, "bad checkpoint: {msg}"),
            Self::Ml(e) => write!(f, "{e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
            Self::Safetensors(e) => write!(f, "safetensors error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Ml(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Safetensors(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for TrainErr {
    fn from(e: MlErr) -> Self {
        match e {
            MlErr::InvalidConfig(msg) => Self::InvalidConfig(msg),
            e => Self::Ml(e),
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<SafeTensorError> for TrainErr {
    fn from(e: SafeTensorError) -> Self {
        Self::Safetensors(e)
    }
}

impl From<TrainErr> for io::Error {
    fn from(e: TrainErr) -> Self {
        match e {
            TrainErr::Io(e) => e,
            e => io::Error::other(e),
        }
    }
}
