use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, Context, Result};
use covenant_resolver_store_sqlite::StoreOptions;
use serde::Deserialize;

const DEFAULT_DB: &str = "./covenant_resolver.sqlite3";
const DEFAULT_REPORT_DIR: &str = "./data/analysis";
const DEFAULT_INSERT_BATCH_SIZE: usize = 5_000;

/// Optional YAML settings file. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub db: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub insert_batch_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&body).with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Values given on the command line (or through their environment variables).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub db: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db: PathBuf,
    pub report_dir: PathBuf,
    pub store: StoreOptions,
}

impl Settings {
    /// Flags win over the file, the file wins over built-in defaults.
    pub fn resolve(overrides: Overrides, file: FileConfig) -> Result<Self> {
        let workers = overrides
            .workers
            .or(file.workers)
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get));
        if workers == 0 {
            return Err(anyhow!("workers must be at least 1"));
        }
        let insert_batch_size = file.insert_batch_size.unwrap_or(DEFAULT_INSERT_BATCH_SIZE);
        if insert_batch_size == 0 {
            return Err(anyhow!("insert_batch_size must be at least 1"));
        }

        Ok(Self {
            db: overrides.db.or(file.db).unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
            report_dir: overrides
                .report_dir
                .or(file.report_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR)),
            store: StoreOptions { workers, insert_batch_size },
        })
    }
}
