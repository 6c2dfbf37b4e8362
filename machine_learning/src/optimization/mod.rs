mod adamw;
mod clip;
mod optimizer;
mod sgd;
mod spec;

pub use adamw::AdamW;
pub use clip::clip_grad_norm;
pub use optimizer::{Optimizer, OptimizerState};
pub use sgd::Sgd;
pub use spec::{OptimizerKind, OptimizerSpec};
