use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    StepsMismatch {
        rows: usize,
        steps: usize,
    },
    StaleState {
        layer: &'static str,
        got: usize,
        expected: usize,
    },
    NoForwardCache {
        layer: &'static str,
    },
    MissingBuffer(String),
    InvalidConfig(String),
    MalformedDataset(String),
    Shape(ShapeError),
    Io(io::Error),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => format!("There's a size mismatch in {what}, got {got} and expected {expected}"),
            MlErr::StepsMismatch { rows, steps } => {
                format!("Can't split {rows} rows into {steps} time steps")
            }
            MlErr::StaleState {
                layer,
                got,
                expected,
            } => format!(
                "The {layer} layer holds state for {expected} neurons but got an input of {got}, the model must be reset between batches"
            ),
            MlErr::NoForwardCache { layer } => {
                format!("Called backward on a {layer} layer without a training forward pass")
            }
            MlErr::MissingBuffer(name) => format!("Missing model buffer {name}"),
            MlErr::InvalidConfig(detail) => format!("Invalid configuration: {detail}"),
            MlErr::MalformedDataset(detail) => format!("Malformed dataset: {detail}"),
            MlErr::Shape(e) => format!("Shape error: {e}"),
            MlErr::Io(e) => format!("Io error: {e}"),
        };

        write!(f, "{s}")
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            MlErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
