//! Primitive layers shared by every block and both networks.

use tch::nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use tch::{nn, Tensor};

use crate::error::Result;
use crate::scope::Scope;

/// Variance-scaling initializer: normal, fan-in, unit gain.
pub fn variance_scaling() -> nn::Init {
    nn::Init::Kaiming {
        dist: NormalOrUniform::Normal,
        fan: FanInOut::FanIn,
        non_linearity: NonLinearity::Linear,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyRelu {
    pub slope: f64,
}

impl nn::Module for LeakyRelu {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.maximum(&(xs * self.slope))
    }
}

/// Padding `(before, after)` giving `ceil(size / stride)` outputs, with the odd
/// element on the trailing side.
pub fn same_padding(size: i64, kernel_size: i64, stride: i64) -> (i64, i64) {
    let out = same_output(size, stride);
    let total = ((out - 1) * stride + kernel_size - size).max(0);
    (total / 2, total - total / 2)
}

pub fn same_output(size: i64, stride: i64) -> i64 {
    (size + stride - 1) / stride
}

/// 2-D convolution with "same" padding, computed from the input size at call time.
#[derive(Debug)]
pub struct SameConv2d {
    ws: Tensor,
    bs: Option<Tensor>,
    kernel_size: i64,
    stride: i64,
}

pub fn same_conv2d(
    scope: &Scope,
    c_in: i64,
    c_out: i64,
    kernel_size: i64,
    stride: i64,
    bias: bool,
) -> Result<SameConv2d> {
    let ws = scope.param("weight", &[c_out, c_in, kernel_size, kernel_size], variance_scaling())?;
    let bs = if bias { Some(scope.param("bias", &[c_out], nn::Init::Const(0.))?) } else { None };
    Ok(SameConv2d { ws, bs, kernel_size, stride })
}

impl nn::Module for SameConv2d {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (top, bottom) = same_padding(size[2], self.kernel_size, self.stride);
        let (left, right) = same_padding(size[3], self.kernel_size, self.stride);
        let padded = if top == 0 && bottom == 0 && left == 0 && right == 0 {
            xs.shallow_clone()
        } else {
            xs.zero_pad2d(left, right, top, bottom)
        };
        padded.conv2d(&self.ws, self.bs.as_ref(), [self.stride, self.stride], [0, 0], [1, 1], 1)
    }
}

/// Fully-connected projection.
#[derive(Debug)]
pub struct Dense {
    ws: Tensor,
    bs: Tensor,
}

pub fn dense(scope: &Scope, in_dim: i64, out_dim: i64) -> Result<Dense> {
    let ws = scope.param("weight", &[out_dim, in_dim], nn::init::DEFAULT_KAIMING_UNIFORM)?;
    let bs = scope.param("bias", &[out_dim], nn::Init::Const(0.))?;
    Ok(Dense { ws, bs })
}

impl nn::Module for Dense {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.linear(&self.ws, Some(&self.bs))
    }
}

/// Nearest-neighbour upsampling of an NCHW tensor.
pub fn upsample_nearest(xs: &Tensor, factor: i64) -> Tensor {
    let size = xs.size();
    xs.upsample_nearest2d([size[2] * factor, size[3] * factor], None::<f64>, None::<f64>)
}

/// 2x2 average pooling with stride 2 and "same" padding; padded cells are not averaged.
pub fn avg_pool_half(xs: &Tensor) -> Tensor {
    xs.avg_pool2d([2, 2], [2, 2], [0, 0], true, false, None::<i64>)
}

/// Mean over the spatial axes of an NCHW tensor, giving `(batch, channels)`.
pub fn global_avg_pool(xs: &Tensor) -> Tensor {
    xs.adaptive_avg_pool2d([1, 1]).flatten(1, -1)
}

/// Shape `(channels, height, width)` after a named construction step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerShape {
    pub name: String,
    pub channels: i64,
    pub height: i64,
    pub width: i64,
}

impl LayerShape {
    pub fn new(name: impl Into<String>, channels: i64, height: i64, width: i64) -> Self {
        Self { name: name.into(), channels, height, width }
    }
}

impl std::fmt::Display for LayerShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}x{}x{}", self.name, self.channels, self.height, self.width)
    }
}
