pub mod config;
pub mod model;
pub mod signature;
pub mod convert;
mod layers;

pub use layers::supported_layers;
