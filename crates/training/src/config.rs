use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSection,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Aggregated validation: every violation is reported, and all of them
    /// before any training step runs.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.latent_dim == 0 {
            errors.push("model.latent_dim must be greater than 0".to_string());
        }
        if self.model.gen_features == 0 {
            errors.push("model.gen_features must be greater than 0".to_string());
        }
        if self.model.critic_features == 0 {
            errors.push("model.critic_features must be greater than 0".to_string());
        }
        if self.model.channels == 0 {
            errors.push("model.channels must be greater than 0".to_string());
        }
        if !self.model.image_size.is_power_of_two() || self.model.image_size < 16 {
            errors.push(format!(
                "model.image_size must be a power of two >= 16 (got {})",
                self.model.image_size
            ));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if !(0.0 < self.optimizer.rho && self.optimizer.rho < 1.0) {
            errors.push("optimizer.rho must be in (0, 1)".to_string());
        }
        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if self.schedule.max_iterations == 0 {
            errors.push("schedule.max_iterations must be greater than 0".to_string());
        }
        if self.schedule.warmup_threshold >= self.schedule.max_iterations {
            errors.push(
                "schedule.warmup_threshold must be below schedule.max_iterations \
                 (the alpha ramp denominator would be zero)"
                    .to_string(),
            );
        }
        if self.schedule.max_alpha < 0.0 {
            errors.push("schedule.max_alpha must be >= 0".to_string());
        }
        if self.schedule.crit_iters == 0 {
            errors.push("schedule.crit_iters must be greater than 0".to_string());
        }
        if self.schedule.gen_iters == 0 {
            errors.push("schedule.gen_iters must be greater than 0".to_string());
        }

        if self.runtime.log_interval == 0 {
            errors.push("runtime.log_interval must be greater than 0".to_string());
        }
        if self.runtime.snapshot_interval == 0 {
            errors.push("runtime.snapshot_interval must be greater than 0".to_string());
        }
        if self.runtime.snapshot_samples == 0 {
            errors.push("runtime.snapshot_samples must be greater than 0".to_string());
        }

        if let Some(checkpoint) = &self.runtime.checkpoint {
            if checkpoint.directory.as_os_str().is_empty() {
                errors.push("runtime.checkpoint.directory must not be empty".to_string());
            }
            if checkpoint.interval == 0 {
                errors.push("runtime.checkpoint.interval must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.max_keep {
                errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(root) = self.data.root.as_mut() {
            absolutize_in_place(root, base);
        }
        if let Some(checkpoint) = self.runtime.checkpoint.as_mut() {
            absolutize_in_place(&mut checkpoint.directory, base);
        }
        if let Some(dir) = self.runtime.snapshot_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
        if let Some(dir) = self.runtime.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }

    /// Network hyperparameters resolved against a concrete device.
    pub fn model_config(&self, device: Device) -> model::ModelConfig {
        model::ModelConfig {
            latent_dim: self.model.latent_dim,
            gen_features: self.model.gen_features,
            critic_features: self.model.critic_features,
            channels: self.model.channels,
            image_size: self.model.image_size,
            dtype: DType::F32,
            device,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,
    #[serde(default = "default_features")]
    pub gen_features: usize,
    #[serde(default = "default_features")]
    pub critic_features: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            latent_dim: default_latent_dim(),
            gen_features: default_features(),
            critic_features: default_features(),
            channels: default_channels(),
            image_size: default_image_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory of training images, scanned recursively. Required for the
    /// CLI path; test harnesses may inject a batch source instead.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Smoothing constant of the squared-gradient running average.
    #[serde(default = "default_rho")]
    pub rho: f64,
    #[serde(default = "default_rms_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            rho: default_rho(),
            epsilon: default_rms_eps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_warmup_threshold")]
    pub warmup_threshold: usize,
    #[serde(default = "default_max_alpha")]
    pub max_alpha: f64,
    #[serde(default = "default_crit_iters")]
    pub crit_iters: usize,
    #[serde(default = "default_gen_iters")]
    pub gen_iters: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            warmup_threshold: default_warmup_threshold(),
            max_alpha: default_max_alpha(),
            crit_iters: default_crit_iters(),
            gen_iters: default_gen_iters(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: usize,
    /// Number of fixed latent vectors rendered into each snapshot grid.
    #[serde(default = "default_snapshot_samples")]
    pub snapshot_samples: usize,
    /// When set, each snapshot grid is also exported as a PNG here.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            log_interval: default_log_interval(),
            snapshot_interval: default_snapshot_interval(),
            snapshot_samples: default_snapshot_samples(),
            snapshot_dir: None,
            checkpoint: None,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_interval")]
    pub interval: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_latent_dim() -> usize {
    100
}

fn default_features() -> usize {
    64
}

fn default_channels() -> usize {
    3
}

fn default_image_size() -> usize {
    64
}

fn default_batch_size() -> usize {
    128
}

fn default_learning_rate() -> f64 {
    4e-4
}

fn default_rho() -> f64 {
    0.99
}

fn default_rms_eps() -> f64 {
    1e-8
}

fn default_max_iterations() -> usize {
    100_000
}

fn default_warmup_threshold() -> usize {
    10_000
}

fn default_max_alpha() -> f64 {
    0.5
}

fn default_crit_iters() -> usize {
    1
}

fn default_gen_iters() -> usize {
    2
}

fn default_seed() -> u64 {
    123
}

fn default_log_interval() -> usize {
    50
}

fn default_snapshot_interval() -> usize {
    1_000
}

fn default_snapshot_samples() -> usize {
    64
}

fn default_checkpoint_interval() -> usize {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_tensorboard_flush() -> usize {
    16
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    /// A checkpoint exists but could not be loaded or is internally
    /// inconsistent. Never downgraded to a fresh start.
    Resume(String),
    /// A non-finite loss surfaced during an iteration.
    Numerical(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn resume(message: impl Into<String>) -> Self {
        Self::Resume(message.into())
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        Self::Numerical(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Resume(msg) => write!(f, "checkpoint resume failed: {}", msg),
            TrainingError::Numerical(msg) => write!(f, "numerical anomaly: {}", msg),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TrainingConfig {
        TrainingConfig {
            model: ModelSection::default(),
            data: DataConfig {
                root: Some(PathBuf::from("/tmp/images")),
                batch_size: 16,
            },
            optimizer: OptimizerConfig::default(),
            schedule: ScheduleConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }

    #[test]
    fn default_configuration_is_valid() {
        let config = base_config();
        assert_eq!(config.model.latent_dim, 100);
        assert_eq!(config.model.image_size, 64);
        assert_eq!(config.schedule.max_iterations, 100_000);
        assert_eq!(config.schedule.warmup_threshold, 10_000);
        assert_eq!(config.schedule.crit_iters, 1);
        assert_eq!(config.schedule.gen_iters, 2);
        assert_eq!(config.runtime.snapshot_interval, 1_000);
        assert_eq!(config.runtime.log_interval, 50);
        config.validate().unwrap();
    }

    #[test]
    fn degenerate_alpha_denominator_is_a_configuration_error() {
        let mut config = base_config();
        config.schedule.warmup_threshold = config.schedule.max_iterations;
        let err = config.validate().unwrap_err();
        match err {
            TrainingError::Validation(messages) => {
                assert!(messages.iter().any(|m| m.contains("warmup_threshold")));
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn validation_aggregates_every_violation() {
        let mut config = base_config();
        config.data.batch_size = 0;
        config.schedule.crit_iters = 0;
        config.runtime.log_interval = 0;
        match config.validate().unwrap_err() {
            TrainingError::Validation(messages) => assert!(messages.len() >= 3),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn zero_max_keep_is_rejected() {
        let mut config = base_config();
        config.runtime.checkpoint = Some(CheckpointConfig {
            directory: PathBuf::from("/tmp/ckpt"),
            interval: 100,
            max_keep: Some(0),
        });
        assert!(config.validate().is_err());
    }
}
