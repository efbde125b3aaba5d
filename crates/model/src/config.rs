use candle_core::{DType, Device, Error, Result};

/// Shared hyperparameters for the generator/critic pair.
///
/// Both networks are assembled from the same pyramid: the generator projects
/// the latent vector to a 4x4 base and doubles the spatial size per stage,
/// the critic runs the mirror image down to a scalar score.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Dimensionality of the latent noise vector.
    pub latent_dim: usize,
    /// Feature-map width of the generator's last upsampling stage.
    pub gen_features: usize,
    /// Feature-map width of the critic's first downsampling stage.
    pub critic_features: usize,
    /// Image channels (3 for RGB).
    pub channels: usize,
    /// Output resolution; must be a power of two, at least 16.
    pub image_size: usize,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.latent_dim == 0 {
            return Err(Error::Msg("latent_dim must be greater than zero".into()));
        }
        if self.gen_features == 0 || self.critic_features == 0 {
            return Err(Error::Msg(
                "feature widths must be greater than zero".into(),
            ));
        }
        if self.channels == 0 {
            return Err(Error::Msg("channels must be greater than zero".into()));
        }
        if !self.image_size.is_power_of_two() || self.image_size < 16 {
            return Err(Error::Msg(format!(
                "image_size must be a power of two >= 16 (got {})",
                self.image_size
            )));
        }
        Ok(())
    }

    /// Number of stride-2 stages between the 4x4 base and the half-resolution
    /// feature map. 64px images get 3, 16px images get 1.
    pub fn stages(&self) -> usize {
        (self.image_size.trailing_zeros() as usize).saturating_sub(3)
    }

    /// Channel multiplier at the 4x4 end of the pyramid.
    pub fn base_multiplier(&self) -> usize {
        1 << self.stages()
    }
}
