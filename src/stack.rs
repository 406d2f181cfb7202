//! Stage assembly: a run of residual units where only the first one may
//! change the resolution or the channel depth.

use tch::{nn, Tensor};

use crate::block::{BlockConfig, BlockVariant, ResidualBlock};
use crate::config::StageConfig;
use crate::error::Result;
use crate::layers::LeakyRelu;
use crate::scope::Scope;

#[derive(Debug)]
pub struct BlockStack {
    units: Vec<ResidualBlock>,
}

impl BlockStack {
    pub fn new(
        scope: &Scope,
        variant: BlockVariant,
        in_channels: i64,
        filters: i64,
        stage: &StageConfig,
        act: LeakyRelu,
    ) -> Result<Self> {
        stage.validate()?;
        let out_channels = variant.out_channels(filters)?;
        let first = BlockConfig {
            filters,
            stride: stage.stride,
            needs_projection: stage.stride != 1 || in_channels != out_channels,
        };
        let mut units = vec![ResidualBlock::new(&scope.sub("unit_0")?, variant, in_channels, first, act)?];
        let rest = BlockConfig { filters, stride: 1, needs_projection: false };
        for i in 1..stage.unit_count {
            units.push(ResidualBlock::new(&scope.sub(&format!("unit_{i}"))?, variant, out_channels, rest, act)?);
        }
        Ok(Self { units })
    }

    pub fn units(&self) -> &[ResidualBlock] {
        &self.units
    }

    pub fn out_channels(&self) -> i64 {
        self.units.last().map_or(0, |unit| unit.out_channels())
    }

    pub fn output_size(&self, height: i64, width: i64) -> (i64, i64) {
        self.units.iter().fold((height, width), |(h, w), unit| unit.output_size(h, w))
    }
}

impl nn::ModuleT for BlockStack {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.units.iter().fold(xs.shallow_clone(), |ys, unit| ys.apply_t(unit, train))
    }
}
