mod batch_norm;
mod lif;
mod linear;

pub use batch_norm::BatchNorm;
pub use lif::Lif;
pub use linear::Linear;
