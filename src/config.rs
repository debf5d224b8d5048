use crate::manifest::MANIFEST_FILE;
use crate::model::ModelLevel;
use crate::EmbedError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Clone)]
#[command(name = "slide_embed")]
#[command(about = "Resumable tile and slide feature extraction for whole-slide images", long_about = None)]
pub struct Args {
    /// JSON run configuration
    #[arg(long)]
    pub config_file: PathBuf,

    /// Subdirectory of `output_dir` holding this run's manifest, coordinates and features
    #[arg(long)]
    pub run_id: String,

    /// Number of ranks to run in this process
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub tiling: TilingConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub speed: SpeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self { backend: default_backend() }
    }
}

fn default_backend() -> String {
    "raw".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// When set, the built model must be of this level.
    #[serde(default)]
    pub level: Option<ModelLevel>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub tile_size: u32,
    /// Side of the regions fed to region-level models.
    #[serde(default)]
    pub region_size: Option<u32>,
    #[serde(default = "default_channels")]
    pub channels: usize,
}

fn default_batch_size() -> usize {
    32
}

fn default_channels() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers_embedding: usize,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self { num_workers_embedding: default_num_workers() }
    }
}

fn default_num_workers() -> usize {
    8
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, EmbedError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EmbedError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| EmbedError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EmbedError> {
        if self.model.batch_size == 0 {
            return Err(EmbedError::Config("model.batch_size must be at least 1".to_string()));
        }
        if self.model.tile_size == 0 {
            return Err(EmbedError::Config("model.tile_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Directory layout of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub output_dir: PathBuf,
}

impl RunPaths {
    pub fn new(config: &Config, run_id: &str) -> Result<Self, EmbedError> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) {
            return Err(EmbedError::Config(format!("invalid run id '{}'", run_id)));
        }
        Ok(Self { output_dir: config.output_dir.join(run_id) })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE)
    }

    pub fn coordinates_dir(&self) -> PathBuf {
        self.output_dir.join("coordinates")
    }

    pub fn features_dir(&self) -> PathBuf {
        self.output_dir.join("features")
    }
}

/// Loader threads per rank: the configured count, capped by the CPUs actually available.
pub fn loader_workers(configured: usize) -> usize {
    let slurm = std::env::var("SLURM_JOB_CPUS_PER_NODE").ok();
    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    resolve_workers(configured, available, slurm.as_deref())
}

fn resolve_workers(configured: usize, available: usize, slurm: Option<&str>) -> usize {
    // SLURM may report "16(x2)" for heterogeneous allocations
    let slurm_cpus = slurm
        .and_then(|s| s.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|s| s.parse::<usize>().ok());
    let mut workers = configured.min(available);
    if let Some(cpus) = slurm_cpus {
        workers = workers.min(cpus);
    }
    workers
}
