use tch::{nn, Tensor};
use tracing::{debug, info};

use crate::block::BlockVariant;
use crate::config::{ChannelLayout, NetworkConfig};
use crate::error::{NetworkError, Result};
use crate::layers::{
    avg_pool_half, dense, global_avg_pool, same_conv2d, same_output, Dense, LayerShape, LeakyRelu,
    SameConv2d,
};
use crate::scope::ParameterStore;
use crate::stack::BlockStack;
use crate::IMAGE_CHANNELS;

/// Image -> unbounded realism score (a logit), shape `(batch, 1)`.
///
/// head conv -> [v1: activation] -> (stage, 2x2 average pool) per stage ->
/// [v2: activation] -> global average pool -> dense.
///
/// Blocks run at unit stride whatever the stage strides say. The 2x2 pool
/// after each stage halves the resolution.
#[derive(Debug)]
pub struct Discriminator {
    head: SameConv2d,
    stages: Vec<BlockStack>,
    dense: Dense,
    act: LeakyRelu,
    variant: BlockVariant,
    layout: ChannelLayout,
    image_size: (i64, i64),
    shapes: Vec<LayerShape>,
}

impl Discriminator {
    pub const SCOPE: &'static str = "discriminator";

    pub fn new(store: &ParameterStore, config: &NetworkConfig, reuse: bool) -> Result<Discriminator> {
        Self::with_scope(store, Self::SCOPE, config, reuse)
    }

    pub fn with_scope(
        store: &ParameterStore,
        scope_name: &str,
        config: &NetworkConfig,
        reuse: bool,
    ) -> Result<Discriminator> {
        config.validate()?;
        let filters = (0..config.stages.len())
            .map(|i| config.discriminator_filters(i))
            .collect::<Result<Vec<i64>>>()?;

        let variant = config.variant()?;
        let act = LeakyRelu { slope: config.leaky_relu_slope };
        let base = config.base_filters;
        let head_conv = config.head_conv;

        let scope = store.scope(scope_name, reuse)?;
        let head = same_conv2d(
            &scope.sub("head_conv")?,
            IMAGE_CHANNELS,
            base,
            head_conv.kernel_size,
            head_conv.stride,
            false,
        )?;
        let mut height = same_output(config.image_size.height, head_conv.stride);
        let mut width = same_output(config.image_size.width, head_conv.stride);
        let mut channels = base;
        let mut shapes = vec![LayerShape::new("head_conv", channels, height, width)];

        let mut stages = Vec::with_capacity(config.stages.len());
        for (i, (stage, filters)) in config.stages.iter().zip(filters).enumerate() {
            let stack = BlockStack::new(
                &scope.sub(&format!("stage_{i}"))?,
                variant,
                channels,
                filters,
                &stage.at_unit_stride(),
                act,
            )?;
            channels = stack.out_channels();
            (height, width) = stack.output_size(height, width);
            shapes.push(LayerShape::new(format!("stage_{i}"), channels, height, width));
            (height, width) = (same_output(height, 2), same_output(width, 2));
            shapes.push(LayerShape::new(format!("pool_{i}"), channels, height, width));
            debug!(stage = i, filters, channels, height, width, "discriminator stage");
            stages.push(stack);
        }

        shapes.push(LayerShape::new("global_pool", channels, 1, 1));
        let dense = dense(&scope.sub("dense")?, channels, 1)?;
        shapes.push(LayerShape::new("dense", 1, 1, 1));
        info!(scope = scope.name(), ?variant, stages = stages.len(), "built discriminator");

        Ok(Discriminator {
            head,
            stages,
            dense,
            act,
            variant,
            layout: config.channel_layout,
            image_size: (config.image_size.height, config.image_size.width),
            shapes,
        })
    }

    /// Shape after each construction step, channels-first.
    pub fn shapes(&self) -> &[LayerShape] {
        &self.shapes
    }

    /// Checked forward pass: `images` must match the Generator's output shape.
    pub fn score(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let size = images.size();
        let (height, width) = self.image_size;
        let expected = match self.layout {
            ChannelLayout::ChannelsFirst => [IMAGE_CHANNELS, height, width],
            ChannelLayout::ChannelsLast => [height, width, IMAGE_CHANNELS],
        };
        if size.len() != 4 || size[1..] != expected {
            return Err(NetworkError::InvalidInput(format!(
                "expected images of shape (batch, {}, {}, {}), got {size:?}",
                expected[0], expected[1], expected[2]
            )));
        }
        Ok(nn::ModuleT::forward_t(self, images, train))
    }
}

impl nn::ModuleT for Discriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut ys = self.layout.to_nchw(xs).apply(&self.head);
        if !self.variant.is_pre_activation() {
            ys = ys.apply(&self.act);
        }
        for stage in &self.stages {
            ys = avg_pool_half(&ys.apply_t(stage, train));
        }
        if self.variant.is_pre_activation() {
            ys = ys.apply(&self.act);
        }
        global_avg_pool(&ys).apply(&self.dense)
    }
}
