use tch::{nn, Kind, Tensor};
use tracing::{debug, info};

use crate::block::BlockVariant;
use crate::config::{ChannelLayout, NetworkConfig};
use crate::error::{NetworkError, Result};
use crate::layers::{dense, same_conv2d, upsample_nearest, Dense, LayerShape, LeakyRelu, SameConv2d};
use crate::scope::ParameterStore;
use crate::stack::BlockStack;
use crate::IMAGE_CHANNELS;

/// Latent vector -> image in `[-1, 1]`.
///
/// dense -> reshape to `(base_filters, h0, w0)` -> [v1: activation] ->
/// (stage, x2 upsample) per stage -> [v2: activation] -> tail conv -> tanh.
///
/// Stage strides only fix the seed size `(h0, w0)`. The blocks themselves run
/// at unit stride and the x2 upsample after each stage grows the resolution.
#[derive(Debug)]
pub struct Generator {
    dense: Dense,
    stages: Vec<BlockStack>,
    tail: SameConv2d,
    act: LeakyRelu,
    variant: BlockVariant,
    layout: ChannelLayout,
    latent_dim: i64,
    base_filters: i64,
    seed_size: (i64, i64),
    shapes: Vec<LayerShape>,
}

impl Generator {
    pub const SCOPE: &'static str = "generator";

    pub fn new(store: &ParameterStore, config: &NetworkConfig, reuse: bool) -> Result<Generator> {
        Self::with_scope(store, Self::SCOPE, config, reuse)
    }

    pub fn with_scope(
        store: &ParameterStore,
        scope_name: &str,
        config: &NetworkConfig,
        reuse: bool,
    ) -> Result<Generator> {
        config.validate()?;
        if config.tail_conv.stride != 1 {
            return Err(NetworkError::ShapeMismatch(format!(
                "tail_conv stride {} would shrink the generated image",
                config.tail_conv.stride
            )));
        }
        let filters = (0..config.stages.len())
            .map(|i| config.generator_filters(i))
            .collect::<Result<Vec<i64>>>()?;

        let variant = config.variant()?;
        let act = LeakyRelu { slope: config.leaky_relu_slope };
        let (h0, w0) = config.seed_size()?;
        let base = config.base_filters;

        let seed_width = base.checked_mul(h0).and_then(|n| n.checked_mul(w0)).ok_or_else(|| {
            NetworkError::ShapeMismatch(format!("dense output {base}x{h0}x{w0} overflows"))
        })?;

        let scope = store.scope(scope_name, reuse)?;
        let dense = dense(&scope.sub("dense")?, config.latent_dim, seed_width)?;
        let mut shapes = vec![LayerShape::new("reshape", base, h0, w0)];

        let (mut channels, mut height, mut width) = (base, h0, w0);
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
            (height, width) = (height * 2, width * 2);
            shapes.push(LayerShape::new(format!("upsample_{i}"), channels, height, width));
            debug!(stage = i, filters, channels, height, width, "generator stage");
            stages.push(stack);
        }

        let tail = same_conv2d(
            &scope.sub("tail_conv")?,
            channels,
            IMAGE_CHANNELS,
            config.tail_conv.kernel_size,
            config.tail_conv.stride,
            true,
        )?;
        shapes.push(LayerShape::new("tail_conv", IMAGE_CHANNELS, height, width));
        info!(scope = scope.name(), ?variant, stages = stages.len(), "built generator");

        Ok(Generator {
            dense,
            stages,
            tail,
            act,
            variant,
            layout: config.channel_layout,
            latent_dim: config.latent_dim,
            base_filters: base,
            seed_size: (h0, w0),
            shapes,
        })
    }

    /// Shape after each construction step, channels-first.
    pub fn shapes(&self) -> &[LayerShape] {
        &self.shapes
    }

    pub fn latent_dim(&self) -> i64 {
        self.latent_dim
    }

    /// Checked forward pass: `latent` must be `(batch, latent_dim)`.
    pub fn generate(&self, latent: &Tensor, train: bool) -> Result<Tensor> {
        let size = latent.size();
        if size.len() != 2 || size[1] != self.latent_dim {
            return Err(NetworkError::InvalidInput(format!(
                "expected latent of shape (batch, {}), got {size:?}",
                self.latent_dim
            )));
        }
        Ok(nn::ModuleT::forward_t(self, latent, train))
    }

    /// Draws `num` standard-normal latents and generates images in inference mode.
    pub fn generate_random(&self, num: i64, device: tch::Device) -> Tensor {
        let latent = Tensor::randn([num, self.latent_dim], (Kind::Float, device));
        nn::ModuleT::forward_t(self, &latent, false)
    }
}

impl nn::ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let (h0, w0) = self.seed_size;
        let mut ys = self.layout.unflatten(&xs.apply(&self.dense), self.base_filters, h0, w0);
        if !self.variant.is_pre_activation() {
            ys = ys.apply(&self.act);
        }
        for stage in &self.stages {
            ys = upsample_nearest(&ys.apply_t(stage, train), 2);
        }
        if self.variant.is_pre_activation() {
            ys = ys.apply(&self.act);
        }
        let images = ys.apply(&self.tail).tanh();
        self.layout.from_nchw(&images)
    }
}
