use std::cell::Cell;
use std::path::Path;

use candle_core::{Result, Tensor, Var};
use candle_nn::{
    batch_norm, conv2d_no_bias, ops::leaky_relu, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    Module, ModuleT, VarBuilder, VarMap,
};

use crate::config::ModelConfig;
use crate::generator::named_vars;

const LEAKY_SLOPE: f64 = 0.2;

struct DownBlock {
    conv: Conv2d,
    bn: BatchNorm,
}

impl DownBlock {
    fn new(in_c: usize, out_c: usize, cfg: Conv2dConfig, vb: VarBuilder) -> Result<Self> {
        let conv = conv2d_no_bias(in_c, out_c, 4, cfg, vb.pp("conv"))?;
        let bn = batch_norm(out_c, BatchNormConfig::default(), vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        leaky_relu(&self.bn.forward_t(&self.conv.forward(xs)?, train)?, LEAKY_SLOPE)
    }
}

/// Maps a `(batch, channels, image_size, image_size)` image to a `(batch,)`
/// least-squares realism score. The score is unbounded, not a probability.
pub struct Critic {
    config: ModelConfig,
    varmap: VarMap,
    input: Conv2d,
    blocks: Vec<DownBlock>,
    output: Conv2d,
    trainable: Cell<bool>,
}

impl Critic {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let down_cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let score_cfg = Conv2dConfig {
            padding: 0,
            stride: 1,
            ..Default::default()
        };

        // No batch norm on the first stage, per DCGAN convention.
        let input = conv2d_no_bias(
            config.channels,
            config.critic_features,
            4,
            down_cfg,
            vb.pp("input").pp("conv"),
        )?;

        let mut mult = 1;
        let mut blocks = Vec::with_capacity(config.stages());
        for stage in 0..config.stages() {
            blocks.push(DownBlock::new(
                config.critic_features * mult,
                config.critic_features * mult * 2,
                down_cfg,
                vb.pp(format!("down{stage}")),
            )?);
            mult *= 2;
        }

        let output = conv2d_no_bias(
            config.critic_features * mult,
            1,
            4,
            score_cfg,
            vb.pp("score").pp("conv"),
        )?;

        Ok(Self {
            config,
            varmap,
            input,
            blocks,
            output,
            trainable: Cell::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let mut hidden = leaky_relu(&self.input.forward(images)?, LEAKY_SLOPE)?;
        for block in &self.blocks {
            hidden = block.forward_t(&hidden, train)?;
        }
        // (batch, 1, 1, 1) -> (batch,)
        self.output.forward(&hidden)?.flatten_all()
    }

    pub fn parameters(&self) -> Vec<(String, Var)> {
        named_vars(&self.varmap)
    }

    pub fn set_trainable(&self, trainable: bool) {
        self.trainable.set(trainable);
    }

    pub fn trainable(&self) -> bool {
        self.trainable.get()
    }

    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.varmap.save(path)
    }

    pub fn load_state<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.varmap.load(path)
    }

    pub(crate) fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}
