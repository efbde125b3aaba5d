use std::cell::Cell;
use std::path::Path;

use candle_core::{Result, Tensor, Var};
use candle_nn::{
    batch_norm, conv_transpose2d_no_bias, BatchNorm, BatchNormConfig, ConvTranspose2d,
    ConvTranspose2dConfig, Module, ModuleT, VarBuilder, VarMap,
};

use crate::config::ModelConfig;

struct UpBlock {
    conv: ConvTranspose2d,
    bn: BatchNorm,
}

impl UpBlock {
    fn new(in_c: usize, out_c: usize, cfg: ConvTranspose2dConfig, vb: VarBuilder) -> Result<Self> {
        let conv = conv_transpose2d_no_bias(in_c, out_c, 4, cfg, vb.pp("conv"))?;
        let bn = batch_norm(out_c, BatchNormConfig::default(), vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.bn.forward_t(&self.conv.forward(xs)?, train)?.relu()
    }
}

/// Maps a `(batch, latent_dim, 1, 1)` noise tensor to a `(batch, channels,
/// image_size, image_size)` image in `[-1, 1]`.
pub struct Generator {
    config: ModelConfig,
    varmap: VarMap,
    project: UpBlock,
    blocks: Vec<UpBlock>,
    output: ConvTranspose2d,
    trainable: Cell<bool>,
}

impl Generator {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let project_cfg = ConvTranspose2dConfig {
            padding: 0,
            stride: 1,
            ..Default::default()
        };
        let up_cfg = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let mut mult = config.base_multiplier();
        let project = UpBlock::new(
            config.latent_dim,
            config.gen_features * mult,
            project_cfg,
            vb.pp("project"),
        )?;

        let mut blocks = Vec::with_capacity(config.stages());
        for stage in 0..config.stages() {
            blocks.push(UpBlock::new(
                config.gen_features * mult,
                config.gen_features * mult / 2,
                up_cfg,
                vb.pp(format!("up{stage}")),
            )?);
            mult /= 2;
        }

        let output = conv_transpose2d_no_bias(
            config.gen_features,
            config.channels,
            4,
            up_cfg,
            vb.pp("output").pp("conv"),
        )?;

        Ok(Self {
            config,
            varmap,
            project,
            blocks,
            output,
            trainable: Cell::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn forward_t(&self, noise: &Tensor, train: bool) -> Result<Tensor> {
        let mut hidden = self.project.forward_t(noise, train)?;
        for block in &self.blocks {
            hidden = block.forward_t(&hidden, train)?;
        }
        self.output.forward(&hidden)?.tanh()
    }

    /// Named parameter tensors, sorted for deterministic iteration order.
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

pub(crate) fn named_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap.data().lock().unwrap();
    let mut params: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}
