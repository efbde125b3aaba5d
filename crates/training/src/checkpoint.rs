use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use model::{Critic, Generator};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    history::{History, HistoryRecord},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
/// Bounded retry budget for one checkpoint event. Exhausting it abandons the
/// event without touching the previous successful checkpoint.
pub const SAVE_ATTEMPTS: usize = 3;

const GENERATOR_FILENAME: &str = "generator.safetensors";
const CRITIC_FILENAME: &str = "critic.safetensors";
const HISTORY_FILENAME: &str = "history.json";
const SNAPSHOTS_FILENAME: &str = "snapshots.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";
const SNAPSHOTS_TENSOR_KEY: &str = "snapshots";
const DIR_PREFIX: &str = "iter_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    /// Last completed iteration covered by this bundle.
    pub iteration: usize,
    pub generator: FileRecord,
    pub critic: FileRecord,
    pub history: FileRecord,
    pub snapshots: Option<FileRecord>,
}

#[derive(Clone, Copy)]
pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub generator: &'a Generator,
    pub critic: &'a Critic,
    pub history: &'a History,
    pub iteration: usize,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub history: History,
    pub generator_weights: PathBuf,
    pub critic_weights: PathBuf,
}

/// Persists one checkpoint bundle. The bundle is assembled under a hidden
/// temp directory and renamed into place only once complete, so a failure
/// mid-write never corrupts the previous checkpoint.
pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let dir_name = directory_name(request.iteration);
    let final_dir = request.base_dir.join(&dir_name);
    let staging_dir = request.base_dir.join(format!(".tmp-{dir_name}"));
    if staging_dir.exists() {
        fs::remove_dir_all(&staging_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to clear staging directory {}: {err}",
                staging_dir.display()
            ))
        })?;
    }
    fs::create_dir(&staging_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create staging directory {}: {err}",
            staging_dir.display()
        ))
    })?;

    let generator_path = staging_dir.join(GENERATOR_FILENAME);
    request.generator.save_state(&generator_path).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize generator weights: {err}"))
    })?;
    let generator_record = file_record(&generator_path)?;

    let critic_path = staging_dir.join(CRITIC_FILENAME);
    request.critic.save_state(&critic_path).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize critic weights: {err}"))
    })?;
    let critic_record = file_record(&critic_path)?;

    let history_path = staging_dir.join(HISTORY_FILENAME);
    write_json(&history_path, &request.history.to_record(request.iteration))?;
    let history_record = file_record(&history_path)?;

    let snapshots_record = if request.history.snapshots().is_empty() {
        None
    } else {
        let snapshots_path = staging_dir.join(SNAPSHOTS_FILENAME);
        let stacked = Tensor::stack(request.history.snapshots(), 0).map_err(|err| {
            TrainingError::runtime(format!("failed to stack snapshot grids: {err}"))
        })?;
        let tensors = HashMap::from([(SNAPSHOTS_TENSOR_KEY.to_string(), stacked)]);
        candle_core::safetensors::save(&tensors, &snapshots_path).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize snapshot grids: {err}"))
        })?;
        Some(file_record(&snapshots_path)?)
    };

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        iteration: request.iteration,
        generator: generator_record,
        critic: critic_record,
        history: history_record,
        snapshots: snapshots_record,
    };
    write_json(&staging_dir.join(MANIFEST_FILENAME), &manifest)?;

    if final_dir.exists() {
        fs::remove_dir_all(&final_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to replace checkpoint {}: {err}",
                final_dir.display()
            ))
        })?;
    }
    fs::rename(&staging_dir, &final_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to commit checkpoint {}: {err}",
            final_dir.display()
        ))
    })?;

    prune_checkpoints(request.base_dir, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: final_dir,
        manifest,
    })
}

/// Retries [`save_checkpoint`] up to `attempts` times for transient I/O
/// failures. Returns the last error once the budget is exhausted.
pub fn save_checkpoint_with_retries(
    request: SaveRequest<'_>,
    attempts: usize,
) -> Result<CheckpointDescriptor, TrainingError> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match save_checkpoint(request) {
            Ok(descriptor) => return Ok(descriptor),
            Err(err) => {
                eprintln!(
                    "checkpoint attempt {attempt}/{attempts} at iteration {} failed: {err}",
                    request.iteration
                );
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| TrainingError::runtime("checkpoint save failed")))
}

/// Most recent checkpoint in `base_dir`, identified by the iteration counter
/// embedded in the directory name.
pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let entries = checkpoint_directories(base_dir)?;
    let Some((_, path)) = entries.into_iter().max_by_key(|(iteration, _)| *iteration) else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

/// Loads and validates one checkpoint bundle. Every failure is a
/// [`TrainingError::Resume`]: a present-but-broken checkpoint must surface to
/// the operator, never silently fall back to a fresh start.
pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::resume(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }

    let generator_weights = directory.join(&manifest.generator.filename);
    validate_file(&generator_weights, &manifest.generator.sha256)?;

    let critic_weights = directory.join(&manifest.critic.filename);
    validate_file(&critic_weights, &manifest.critic.sha256)?;

    let history_path = directory.join(&manifest.history.filename);
    validate_file(&history_path, &manifest.history.sha256)?;
    let record: HistoryRecord = read_json(&history_path)?;

    let snapshots = if let Some(snapshot_record) = manifest.snapshots.as_ref() {
        let snapshots_path = directory.join(&snapshot_record.filename);
        validate_file(&snapshots_path, &snapshot_record.sha256)?;
        load_snapshot_grids(&snapshots_path)?
    } else {
        Vec::new()
    };

    let history = History::from_record(record, snapshots)?;

    Ok(LoadOutcome {
        manifest,
        history,
        generator_weights,
        critic_weights,
    })
}

fn load_snapshot_grids(path: &Path) -> Result<Vec<Tensor>, TrainingError> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|err| {
        TrainingError::resume(format!("failed to load snapshots {}: {err}", path.display()))
    })?;
    let stacked = tensors.get(SNAPSHOTS_TENSOR_KEY).ok_or_else(|| {
        TrainingError::resume(format!(
            "snapshot bundle {} is missing the '{}' tensor",
            path.display(),
            SNAPSHOTS_TENSOR_KEY
        ))
    })?;
    let count = stacked.dims().first().copied().unwrap_or(0);
    let mut grids = Vec::with_capacity(count);
    for index in 0..count {
        let grid = stacked.get(index).map_err(|err| {
            TrainingError::resume(format!("failed to unpack snapshot {index}: {err}"))
        })?;
        grids.push(grid);
    }
    Ok(grids)
}

fn directory_name(iteration: usize) -> String {
    format!("{DIR_PREFIX}{iteration:09}")
}

fn checkpoint_directories(base: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        TrainingError::resume(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::resume(format!("failed to read checkpoint entry: {err}"))
        })?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(counter) = name.strip_prefix(DIR_PREFIX) else {
            continue;
        };
        if let Ok(iteration) = counter.parse::<usize>() {
            dirs.push((iteration, entry.path()));
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::resume(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::resume(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path)
        .map_err(|err| TrainingError::resume(format!("failed to open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::resume(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file_for_save(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn sha256_file_for_save(path: &Path) -> Result<String, TrainingError> {
    sha256_file(path).map_err(|err| TrainingError::runtime(err.to_string()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path)
        .map_err(|err| TrainingError::resume(format!("failed to open {}: {err}", path.display())))?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::resume(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<(), TrainingError> {
    let Some(limit) = max_keep else {
        return Ok(());
    };
    if limit == 0 {
        return Ok(());
    }
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort_by_key(|(iteration, _)| *iteration);
    while dirs.len() > limit {
        let (_, victim) = dirs.remove(0);
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(())
}
