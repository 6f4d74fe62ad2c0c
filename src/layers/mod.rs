//! Concrete layers.

pub mod activation;
mod concat;
mod conv;
mod input;
mod linear;
mod mse;
mod sum;

pub use activation::{Activation, ActivationKind};
pub use concat::Concat;
pub use conv::Convolution2D;
pub use input::Input;
pub use linear::FullyConnected;
pub use mse::Mse;
pub use sum::Sum;
