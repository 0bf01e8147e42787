pub mod activation;
pub mod conv;
pub mod init;
pub mod module;
pub mod norm;

pub use activation::Activation;
pub use conv::{Conv2d, Conv3d, Padding, Size2};
pub use init::WeightsInitializer;
pub use module::{Module, Parameter};
pub use norm::LayerNorm;
