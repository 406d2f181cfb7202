//! # Residual DCGAN
//!
//! Generator and Discriminator assembled from a shared vocabulary of residual
//! blocks (basic or bottleneck, post- or pre-activation), on top of `tch`.
//!
//! - `config`: stage, convolution and network configuration
//! - `block`: the four residual block variants and the shortcut projection
//! - `stack`: stage assembly from residual units
//! - `generator` / `discriminator`: the two networks
//! - `scope`: named parameter scopes with explicit reuse
//! - `layers`: "same"-padded convolution, dense, activation and resampling

pub mod block;
pub mod config;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod layers;
pub mod scope;
pub mod stack;

/// Channel count of generated and scored images.
pub const IMAGE_CHANNELS: i64 = 3;

pub use block::{BlockConfig, BlockVariant, ResidualBlock, ShortcutProjector};
pub use config::{ChannelLayout, ConvConfig, ImageSize, NetworkConfig, StageConfig};
pub use discriminator::Discriminator;
pub use error::{NetworkError, Result};
pub use generator::Generator;
pub use layers::LayerShape;
pub use scope::{ParameterStore, Scope};
pub use stack::BlockStack;
