//! Network configuration
//!
//! One `NetworkConfig` parameterizes both the Generator and the Discriminator.
//! Stages are listed in Generator order; the Discriminator walks the same list
//! with the inverse resampling and channel schedule.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::block::BlockVariant;
use crate::error::{NetworkError, Result};

/// One stage of residual units. Only the first unit may change the shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub unit_count: i64,
    pub stride: i64,
}

impl StageConfig {
    pub fn new(unit_count: i64, stride: i64) -> Result<Self> {
        let stage = Self { unit_count, stride };
        stage.validate()?;
        Ok(stage)
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit_count < 1 {
            return Err(NetworkError::InvalidStageConfig(format!(
                "unit_count must be >= 1, got {}",
                self.unit_count
            )));
        }
        if self.stride < 1 {
            return Err(NetworkError::InvalidStageConfig(format!(
                "stride must be >= 1, got {}",
                self.stride
            )));
        }
        Ok(())
    }

    /// The same stage with its resolution change removed from the blocks.
    ///
    /// Inside the Generator and the Discriminator each stage is followed by a
    /// x2 resampling step that owns the stage's spatial change, so the blocks
    /// themselves run at stride 1.
    pub fn at_unit_stride(&self) -> Self {
        Self { unit_count: self.unit_count, stride: 1 }
    }
}

/// A standalone convolution: the Discriminator head or the Generator tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub kernel_size: i64,
    pub stride: i64,
}

impl ConvConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.kernel_size < 1 || self.stride < 1 {
            return Err(NetworkError::InvalidConfig(format!(
                "{name}: kernel_size and stride must be >= 1, got {}/{}",
                self.kernel_size, self.stride
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: i64,
    pub width: i64,
}

/// Position of the channel axis in the tensors crossing the network boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    ChannelsFirst,
    ChannelsLast,
}

impl ChannelLayout {
    /// Converts a 4-D tensor in this layout to NCHW.
    pub fn to_nchw(self, xs: &Tensor) -> Tensor {
        match self {
            ChannelLayout::ChannelsFirst => xs.shallow_clone(),
            ChannelLayout::ChannelsLast => xs.permute([0, 3, 1, 2]),
        }
    }

    /// Converts an NCHW tensor to this layout.
    pub fn from_nchw(self, xs: &Tensor) -> Tensor {
        match self {
            ChannelLayout::ChannelsFirst => xs.shallow_clone(),
            ChannelLayout::ChannelsLast => xs.permute([0, 2, 3, 1]),
        }
    }

    /// Reshapes flat `(batch, c * h * w)` features into an NCHW tensor, reading
    /// the flat axis in this layout's order.
    pub fn unflatten(self, xs: &Tensor, channels: i64, height: i64, width: i64) -> Tensor {
        match self {
            ChannelLayout::ChannelsFirst => xs.view([-1, channels, height, width]),
            ChannelLayout::ChannelsLast => xs
                .view([-1, height, width, channels])
                .permute([0, 3, 1, 2]),
        }
    }
}

fn default_leaky_relu_slope() -> f64 {
    0.2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub image_size: ImageSize,
    /// Width of the Generator's latent input.
    pub latent_dim: i64,
    pub base_filters: i64,
    pub bottleneck: bool,
    /// 1 = post-activation blocks, 2 = pre-activation blocks.
    pub version: u8,
    pub stages: Vec<StageConfig>,
    pub head_conv: ConvConfig,
    pub tail_conv: ConvConfig,
    pub channel_layout: ChannelLayout,
    #[serde(default = "default_leaky_relu_slope")]
    pub leaky_relu_slope: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            image_size: ImageSize { height: 64, width: 64 },
            latent_dim: 128,
            base_filters: 64,
            bottleneck: false,
            version: 2,
            stages: vec![StageConfig { unit_count: 2, stride: 2 }; 4],
            head_conv: ConvConfig { kernel_size: 3, stride: 1 },
            tail_conv: ConvConfig { kernel_size: 3, stride: 1 },
            channel_layout: ChannelLayout::ChannelsFirst,
            leaky_relu_slope: default_leaky_relu_slope(),
        }
    }
}

impl NetworkConfig {
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NetworkConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Residual block variant for this configuration.
    pub fn variant(&self) -> Result<BlockVariant> {
        BlockVariant::select(self.bottleneck, self.version)
    }

    /// Product of all stage strides.
    pub fn stride_product(&self) -> Result<i64> {
        self.stages.iter().try_fold(1i64, |acc, stage| {
            acc.checked_mul(stage.stride).ok_or_else(|| {
                NetworkError::ShapeMismatch("stage stride product overflows".to_string())
            })
        })
    }

    /// Spatial size `(h0, w0)` the Generator starts from.
    pub fn seed_size(&self) -> Result<(i64, i64)> {
        let product = self.stride_product()?;
        let ImageSize { height, width } = self.image_size;
        if height % product != 0 || width % product != 0 {
            return Err(NetworkError::ShapeMismatch(format!(
                "image size {height}x{width} is not divisible by the stride product {product}"
            )));
        }
        Ok((height / product, width / product))
    }

    /// Accumulated resampling factor over all stages, `2^stage_count`.
    pub fn resampling_factor(&self) -> Result<i64> {
        u32::try_from(self.stages.len())
            .ok()
            .and_then(|n| 2i64.checked_pow(n))
            .ok_or_else(|| NetworkError::ShapeMismatch("too many stages".to_string()))
    }

    /// Generator filter count of stage `index`: `base_filters / 2^index`, exact.
    pub fn generator_filters(&self, index: usize) -> Result<i64> {
        let divisor = u32::try_from(index)
            .ok()
            .and_then(|i| 2i64.checked_pow(i))
            .ok_or_else(|| NetworkError::FilterSchedule(format!("stage index {index} too large")))?;
        if self.base_filters % divisor != 0 || self.base_filters / divisor < 1 {
            return Err(NetworkError::FilterSchedule(format!(
                "base_filters {} cannot be halved {index} times without truncation",
                self.base_filters
            )));
        }
        Ok(self.base_filters / divisor)
    }

    /// Discriminator filter count of stage `index`: `base_filters * 2^index`.
    pub fn discriminator_filters(&self, index: usize) -> Result<i64> {
        u32::try_from(index)
            .ok()
            .and_then(|i| 2i64.checked_pow(i))
            .and_then(|factor| self.base_filters.checked_mul(factor))
            .ok_or_else(|| {
                NetworkError::FilterSchedule(format!(
                    "base_filters {} overflows when doubled {index} times",
                    self.base_filters
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        let ImageSize { height, width } = self.image_size;
        if height < 1 || width < 1 {
            return Err(NetworkError::InvalidConfig(format!(
                "image size must be positive, got {height}x{width}"
            )));
        }
        if self.latent_dim < 1 {
            return Err(NetworkError::InvalidConfig(format!(
                "latent_dim must be >= 1, got {}",
                self.latent_dim
            )));
        }
        if self.base_filters < 1 {
            return Err(NetworkError::InvalidConfig(format!(
                "base_filters must be >= 1, got {}",
                self.base_filters
            )));
        }
        if !(0.0..1.0).contains(&self.leaky_relu_slope) {
            return Err(NetworkError::InvalidConfig(format!(
                "leaky_relu_slope must lie in [0, 1), got {}",
                self.leaky_relu_slope
            )));
        }
        if self.stages.is_empty() {
            return Err(NetworkError::InvalidStageConfig(
                "at least one stage is required".to_string(),
            ));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            stage.validate().map_err(|err| match err {
                NetworkError::InvalidStageConfig(reason) => {
                    NetworkError::InvalidStageConfig(format!("stage {index}: {reason}"))
                }
                other => other,
            })?;
        }
        self.variant()?;
        self.head_conv.validate("head_conv")?;
        self.tail_conv.validate("tail_conv")?;

        let (h0, w0) = self.seed_size()?;
        let factor = self.resampling_factor()?;
        if h0.checked_mul(factor) != Some(height) || w0.checked_mul(factor) != Some(width) {
            return Err(NetworkError::ShapeMismatch(format!(
                "seed {h0}x{w0} resampled by {factor} does not give the image size {height}x{width}"
            )));
        }
        Ok(())
    }
}
