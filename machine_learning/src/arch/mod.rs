mod config;
pub mod layers;
mod layout;
pub mod loss;
mod mixer;
mod model;

pub use config::MixerConfig;
pub use layout::{ParamEntry, ParamLayout};
pub use mixer::SpikingMixer;
pub use model::Model;
