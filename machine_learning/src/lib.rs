pub mod arch;
pub mod data;
pub mod encoding;
pub mod error;
pub mod metrics;
pub mod optimization;
pub mod scaler;
pub mod schedule;

pub use error::{MlErr, Result};
