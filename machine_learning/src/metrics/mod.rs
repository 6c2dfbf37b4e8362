mod accuracy;
mod logger;
mod smoothed;

pub use accuracy::accuracy;
pub use logger::MetricLogger;
pub use smoothed::{SmoothedValue, ValueFormat};
