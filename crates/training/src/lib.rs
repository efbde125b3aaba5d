pub mod checkpoint;
pub mod config;
pub mod data;
pub mod grid;
pub mod history;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod schedule;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use data::{BatchSource, BlockingBatchSource, ImageBatch, ImageFolderSource, InMemorySource};
pub use history::{History, HistoryRecord};
pub use optimizer::{RmsProp, RmsPropConfig};
pub use schedule::{alpha, AlphaSchedule};
pub use trainer::Trainer;
