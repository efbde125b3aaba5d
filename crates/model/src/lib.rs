pub mod config;
pub mod critic;
pub mod generator;
pub mod init;

pub use config::ModelConfig;
pub use critic::Critic;
pub use generator::Generator;
pub use init::apply_dcgan_init;
