//! Residual blocks
//!
//! Four variants, two shapes (basic: 3x3 -> 3x3, bottleneck: 1x1 -> 3x3 -> 1x1
//! with a x4 channel expansion) in two orderings (v1: activation after the
//! residual add, v2: activation before the convolutions, none after the add).
//!
//! The `train` flag of `forward_t` is threaded through but unused: no
//! normalization layer lives in these blocks.

use tch::{nn, Tensor};

use crate::error::{NetworkError, Result};
use crate::layers::{same_conv2d, same_output, LeakyRelu, SameConv2d};
use crate::scope::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockVariant {
    BasicV1,
    BasicV2,
    BottleneckV1,
    BottleneckV2,
}

impl BlockVariant {
    /// Channel expansion of the bottleneck's last 1x1 convolution.
    pub const EXPANSION: i64 = 4;

    pub fn select(bottleneck: bool, version: u8) -> Result<Self> {
        match (bottleneck, version) {
            (false, 1) => Ok(BlockVariant::BasicV1),
            (false, 2) => Ok(BlockVariant::BasicV2),
            (true, 1) => Ok(BlockVariant::BottleneckV1),
            (true, 2) => Ok(BlockVariant::BottleneckV2),
            _ => Err(NetworkError::InvalidVariantSelection { bottleneck, version }),
        }
    }

    pub fn is_bottleneck(self) -> bool {
        matches!(self, BlockVariant::BottleneckV1 | BlockVariant::BottleneckV2)
    }

    pub fn is_pre_activation(self) -> bool {
        matches!(self, BlockVariant::BasicV2 | BlockVariant::BottleneckV2)
    }

    pub fn out_channels(self, filters: i64) -> Result<i64> {
        if !self.is_bottleneck() {
            return Ok(filters);
        }
        filters.checked_mul(Self::EXPANSION).ok_or_else(|| {
            NetworkError::FilterSchedule(format!("{filters} filters overflow the x{} expansion", Self::EXPANSION))
        })
    }

    /// `(kernel_size, out_channels, strided)` for each convolution of the main path.
    fn main_path(self, filters: i64, out_channels: i64) -> Vec<(i64, i64, bool)> {
        if self.is_bottleneck() {
            vec![(1, filters, false), (3, filters, true), (1, out_channels, false)]
        } else {
            vec![(3, filters, true), (3, filters, false)]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    pub filters: i64,
    pub stride: i64,
    pub needs_projection: bool,
}

/// 1x1 convolution reshaping the identity path to the main path's output.
#[derive(Debug)]
pub struct ShortcutProjector {
    conv: SameConv2d,
}

impl ShortcutProjector {
    pub fn new(scope: &Scope, c_in: i64, c_out: i64, stride: i64) -> Result<Self> {
        Ok(Self { conv: same_conv2d(scope, c_in, c_out, 1, stride, false)? })
    }
}

impl nn::Module for ShortcutProjector {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }
}

#[derive(Debug)]
pub struct ResidualBlock {
    variant: BlockVariant,
    convs: Vec<SameConv2d>,
    projection: Option<ShortcutProjector>,
    act: LeakyRelu,
    in_channels: i64,
    out_channels: i64,
    config: BlockConfig,
}

impl ResidualBlock {
    pub fn new(
        scope: &Scope,
        variant: BlockVariant,
        in_channels: i64,
        config: BlockConfig,
        act: LeakyRelu,
    ) -> Result<Self> {
        let BlockConfig { filters, stride, needs_projection } = config;
        if filters < 1 || stride < 1 || in_channels < 1 {
            return Err(NetworkError::InvalidBlock(format!(
                "filters, stride and input channels must be >= 1, got {filters}/{stride}/{in_channels}"
            )));
        }
        let out_channels = variant.out_channels(filters)?;
        if !needs_projection && (stride != 1 || in_channels != out_channels) {
            return Err(NetworkError::InvalidBlock(format!(
                "identity shortcut cannot map {in_channels} channels at stride {stride} to {out_channels} channels"
            )));
        }

        let mut convs = Vec::new();
        let mut c_in = in_channels;
        for (i, (kernel_size, c_out, strided)) in variant.main_path(filters, out_channels).into_iter().enumerate() {
            let conv_stride = if strided { stride } else { 1 };
            let conv_scope = scope.sub(&format!("conv_{}", i + 1))?;
            convs.push(same_conv2d(&conv_scope, c_in, c_out, kernel_size, conv_stride, false)?);
            c_in = c_out;
        }
        let projection = if needs_projection {
            Some(ShortcutProjector::new(&scope.sub("shortcut")?, in_channels, out_channels, stride)?)
        } else {
            None
        };
        Ok(Self { variant, convs, projection, act, in_channels, out_channels, config })
    }

    pub fn in_channels(&self) -> i64 {
        self.in_channels
    }

    pub fn out_channels(&self) -> i64 {
        self.out_channels
    }

    pub fn stride(&self) -> i64 {
        self.config.stride
    }

    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }

    pub fn output_size(&self, height: i64, width: i64) -> (i64, i64) {
        (same_output(height, self.config.stride), same_output(width, self.config.stride))
    }

    /// conv, then (activation, conv) for every further convolution.
    fn residual(&self, xs: &Tensor) -> Tensor {
        let mut convs = self.convs.iter();
        let mut ys = match convs.next() {
            Some(conv) => xs.apply(conv),
            None => xs.shallow_clone(),
        };
        for conv in convs {
            ys = ys.apply(&self.act).apply(conv);
        }
        ys
    }
}

impl nn::ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        if self.variant.is_pre_activation() {
            let pre = xs.apply(&self.act);
            let shortcut = match &self.projection {
                Some(projection) => pre.apply(projection),
                None => xs.shallow_clone(),
            };
            self.residual(&pre) + shortcut
        } else {
            let shortcut = match &self.projection {
                Some(projection) => xs.apply(projection),
                None => xs.shallow_clone(),
            };
            (self.residual(xs) + shortcut).apply(&self.act)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ParameterStore;
    use tch::nn::ModuleT;
    use tch::{Device, Kind};

    const ACT: LeakyRelu = LeakyRelu { slope: 0.2 };

    fn block(
        store: &ParameterStore,
        variant: BlockVariant,
        in_channels: i64,
        filters: i64,
        stride: i64,
        needs_projection: bool,
    ) -> Result<ResidualBlock> {
        let scope = store.scope("block", false)?;
        ResidualBlock::new(&scope, variant, in_channels, BlockConfig { filters, stride, needs_projection }, ACT)
    }

    fn zero_all(store: &ParameterStore) {
        tch::no_grad(|| {
            for (_, mut t) in store.var_store().variables() {
                let _ = t.zero_();
            }
        });
    }

    #[test]
    fn test_variant_selection() {
        assert_eq!(BlockVariant::select(false, 1).unwrap(), BlockVariant::BasicV1);
        assert_eq!(BlockVariant::select(false, 2).unwrap(), BlockVariant::BasicV2);
        assert_eq!(BlockVariant::select(true, 1).unwrap(), BlockVariant::BottleneckV1);
        assert_eq!(BlockVariant::select(true, 2).unwrap(), BlockVariant::BottleneckV2);
        assert!(matches!(
            BlockVariant::select(true, 0),
            Err(NetworkError::InvalidVariantSelection { bottleneck: true, version: 0 })
        ));
    }

    #[test]
    fn test_parameter_layout() {
        let store = ParameterStore::new(Device::Cpu);
        block(&store, BlockVariant::BottleneckV1, 8, 4, 2, true).unwrap();
        let mut names: Vec<String> = store.var_store().variables().into_keys().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["block.conv_1.weight", "block.conv_2.weight", "block.conv_3.weight", "block.shortcut.weight"]
        );
        let variables = store.var_store().variables();
        assert_eq!(variables["block.conv_1.weight"].size(), vec![4, 8, 1, 1]);
        assert_eq!(variables["block.conv_2.weight"].size(), vec![4, 4, 3, 3]);
        assert_eq!(variables["block.conv_3.weight"].size(), vec![16, 4, 1, 1]);
        assert_eq!(variables["block.shortcut.weight"].size(), vec![16, 8, 1, 1]);
    }

    #[test]
    fn test_output_shapes() {
        let xs = Tensor::randn([2, 6, 8, 8], (Kind::Float, Device::Cpu));
        for variant in [
            BlockVariant::BasicV1,
            BlockVariant::BasicV2,
            BlockVariant::BottleneckV1,
            BlockVariant::BottleneckV2,
        ] {
            let store = ParameterStore::new(Device::Cpu);
            let b = block(&store, variant, 6, 4, 2, true).unwrap();
            let ys = b.forward_t(&xs, false);
            let expected = variant.out_channels(4).unwrap();
            assert_eq!(ys.size(), vec![2, expected, 4, 4], "{variant:?}");
            assert_eq!(b.output_size(8, 8), (4, 4));
        }
    }

    #[test]
    fn test_identity_shortcut_requires_matching_shape() {
        let store = ParameterStore::new(Device::Cpu);
        assert!(matches!(
            block(&store, BlockVariant::BasicV1, 4, 8, 1, false),
            Err(NetworkError::InvalidBlock(_))
        ));
        let store = ParameterStore::new(Device::Cpu);
        assert!(matches!(
            block(&store, BlockVariant::BasicV2, 4, 4, 2, false),
            Err(NetworkError::InvalidBlock(_))
        ));
        let store = ParameterStore::new(Device::Cpu);
        assert!(matches!(
            block(&store, BlockVariant::BottleneckV1, 4, 4, 1, false),
            Err(NetworkError::InvalidBlock(_))
        ));
        let store = ParameterStore::new(Device::Cpu);
        let b = block(&store, BlockVariant::BottleneckV2, 16, 4, 1, false).unwrap();
        assert!(!b.has_projection());
    }

    #[test]
    fn test_rejects_degenerate_blocks() {
        let store = ParameterStore::new(Device::Cpu);
        assert!(matches!(
            block(&store, BlockVariant::BasicV1, 4, 0, 1, true),
            Err(NetworkError::InvalidBlock(_))
        ));
        let store = ParameterStore::new(Device::Cpu);
        assert!(matches!(
            block(&store, BlockVariant::BasicV1, 4, 4, 0, true),
            Err(NetworkError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_expansion_overflow_is_an_error() {
        let huge = i64::MAX / 2;
        assert_eq!(BlockVariant::BasicV1.out_channels(huge).unwrap(), huge);
        assert!(matches!(BlockVariant::BottleneckV2.out_channels(huge), Err(NetworkError::FilterSchedule(_))));

        let store = ParameterStore::new(Device::Cpu);
        assert!(matches!(
            block(&store, BlockVariant::BottleneckV1, 4, huge, 1, true),
            Err(NetworkError::FilterSchedule(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_v1_applies_trailing_activation() {
        // With zeroed convolutions the residual path vanishes and only the
        // identity shortcut remains.
        let xs = Tensor::from_slice(&[-1.0f32, 2.0, -3.0, 4.0]).view([1, 1, 2, 2]);

        let store = ParameterStore::new(Device::Cpu);
        let v1 = block(&store, BlockVariant::BasicV1, 1, 1, 1, false).unwrap();
        zero_all(&store);
        let ys = v1.forward_t(&xs, true);
        assert!((ys.double_value(&[0, 0, 0, 0]) + 0.2).abs() < 1e-6);
        assert!((ys.double_value(&[0, 0, 1, 1]) - 4.0).abs() < 1e-6);

        let store = ParameterStore::new(Device::Cpu);
        let v2 = block(&store, BlockVariant::BasicV2, 1, 1, 1, false).unwrap();
        zero_all(&store);
        let ys = v2.forward_t(&xs, true);
        assert!((ys.double_value(&[0, 0, 0, 0]) + 1.0).abs() < 1e-6);
        assert!((ys.double_value(&[0, 0, 1, 0]) + 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_bottleneck_activation_placement() {
        // One filter expands to four channels, so the identity shortcut fits.
        let xs = Tensor::from_slice(&[-1.0f32, 2.0, -3.0, 4.0]).view([1, 4, 1, 1]);

        let store = ParameterStore::new(Device::Cpu);
        let v1 = block(&store, BlockVariant::BottleneckV1, 4, 1, 1, false).unwrap();
        zero_all(&store);
        let ys = v1.forward_t(&xs, false);
        assert!((ys.double_value(&[0, 0, 0, 0]) + 0.2).abs() < 1e-6);
        assert!((ys.double_value(&[0, 1, 0, 0]) - 2.0).abs() < 1e-6);
        assert!((ys.double_value(&[0, 2, 0, 0]) + 0.6).abs() < 1e-6);

        let store = ParameterStore::new(Device::Cpu);
        let v2 = block(&store, BlockVariant::BottleneckV2, 4, 1, 1, false).unwrap();
        zero_all(&store);
        let ys = v2.forward_t(&xs, false);
        assert!((ys.double_value(&[0, 0, 0, 0]) + 1.0).abs() < 1e-6);
        assert!((ys.double_value(&[0, 2, 0, 0]) + 3.0).abs() < 1e-6);
        assert!((ys.double_value(&[0, 3, 0, 0]) - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_v2_projects_the_activated_input() {
        let xs = Tensor::from_slice(&[-1.0f32, 2.0, -3.0, 4.0]).view([1, 1, 2, 2]);
        let store = ParameterStore::new(Device::Cpu);
        let b = block(&store, BlockVariant::BasicV2, 1, 1, 1, true).unwrap();
        tch::no_grad(|| {
            for (name, mut t) in store.var_store().variables() {
                let value = if name.contains("shortcut") { 1.0 } else { 0.0 };
                let _ = t.fill_(value);
            }
        });
        let ys = b.forward_t(&xs, false);
        // shortcut = 1x1 identity applied to leaky(x)
        assert!((ys.double_value(&[0, 0, 0, 0]) + 0.2).abs() < 1e-6);
        assert!((ys.double_value(&[0, 0, 1, 0]) + 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_train_flag_does_not_change_output() {
        let store = ParameterStore::new(Device::Cpu);
        let b = block(&store, BlockVariant::BottleneckV2, 4, 2, 1, true).unwrap();
        let xs = Tensor::randn([1, 4, 5, 5], (Kind::Float, Device::Cpu));
        let diff = (b.forward_t(&xs, true) - b.forward_t(&xs, false)).abs().max();
        assert_eq!(diff.double_value(&[]), 0.0);
    }
}
