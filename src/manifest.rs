use crate::EmbedError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MANIFEST_FILE: &str = "process_list.json";

const KEY_COLUMN: &str = "slide_path";
const UPSTREAM_KEY_COLUMN: &str = "wsi_path";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Success,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Success => write!(f, "success"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    #[serde(alias = "wsi_path")]
    pub slide_path: String,
    #[serde(default, deserialize_with = "status_or_pending")]
    pub tiling_status: Status,
    #[serde(default, deserialize_with = "status_or_pending")]
    pub feature_status: Status,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    /// Columns owned by other stages, written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManifestRow {
    pub fn new(slide_path: impl Into<String>, tiling_status: Status) -> Self {
        Self {
            slide_path: slide_path.into(),
            tiling_status,
            feature_status: Status::Pending,
            error: None,
            traceback: None,
            extra: Map::new(),
        }
    }

    pub fn needs_features(&self) -> bool {
        self.tiling_status == Status::Success && self.feature_status != Status::Success
    }

    fn to_table_row(&self, key_column: &str) -> Result<Value, EmbedError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(row) = value.as_object_mut().filter(|_| key_column != KEY_COLUMN) {
            if let Some(path) = row.remove(KEY_COLUMN) {
                row.insert(key_column.to_string(), path);
            }
        }
        Ok(value)
    }
}

// Upstream writes null or "" for rows nobody has touched yet.
fn status_or_pending<'de, D>(deserializer: D) -> Result<Status, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") | Some("pending") => Ok(Status::Pending),
        Some("success") => Ok(Status::Success),
        Some("failed") => Ok(Status::Failed),
        Some(other) => Err(serde::de::Error::custom(format!("unknown status '{}'", other))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    Writer,
    ReadOnly,
}

/// Durable slide -> status table. Rewritten in full after every recorded result.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    rows: Vec<ManifestRow>,
    by_path: FxHashMap<String, usize>,
    mode: LedgerMode,
    /// Name the slide path column had on disk; rewrites keep it.
    key_column: &'static str,
}

impl Ledger {
    pub fn load(path: &Path, mode: LedgerMode) -> Result<Self, EmbedError> {
        if !path.is_file() {
            return Err(EmbedError::ManifestIntegrity(format!(
                "process list {} not found; ensure tiling has been run",
                path.display()
            )));
        }
        let bytes = fs::read(path).map_err(|e| {
            EmbedError::ManifestIntegrity(format!("cannot read {}: {}", path.display(), e))
        })?;
        let malformed =
            |e: serde_json::Error| EmbedError::ManifestIntegrity(format!("malformed {}: {}", path.display(), e));
        let table: Vec<Value> = serde_json::from_slice(&bytes).map_err(malformed)?;
        let upstream_keys = table.first().is_some_and(|row| row.get(UPSTREAM_KEY_COLUMN).is_some());
        let rows = table
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<ManifestRow>, _>>()
            .map_err(malformed)?;
        let mut ledger = Self::from_rows(path.to_path_buf(), rows, mode)?;
        if upstream_keys {
            ledger.key_column = UPSTREAM_KEY_COLUMN;
        }
        Ok(ledger)
    }

    pub fn from_rows(path: PathBuf, rows: Vec<ManifestRow>, mode: LedgerMode) -> Result<Self, EmbedError> {
        let mut by_path = FxHashMap::default();
        for (i, row) in rows.iter().enumerate() {
            if row.slide_path.is_empty() {
                return Err(EmbedError::ManifestIntegrity(format!("row {} has an empty slide path", i)));
            }
            if by_path.insert(row.slide_path.clone(), i).is_some() {
                return Err(EmbedError::ManifestIntegrity(format!(
                    "slide {} appears more than once",
                    row.slide_path
                )));
            }
        }
        Ok(Self { path, rows, by_path, mode, key_column: KEY_COLUMN })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[ManifestRow] {
        &self.rows
    }

    pub fn row(&self, slide_path: &str) -> Option<&ManifestRow> {
        self.by_path.get(slide_path).map(|&i| &self.rows[i])
    }

    pub fn select_pending(&self) -> Vec<ManifestRow> {
        self.rows.iter().filter(|r| r.needs_features()).cloned().collect()
    }

    pub fn all_features_done(&self) -> bool {
        self.rows.iter().all(|r| r.feature_status == Status::Success)
    }

    pub fn failed_rows(&self) -> Vec<&ManifestRow> {
        self.rows.iter().filter(|r| r.feature_status == Status::Failed).collect()
    }

    /// Update one row and rewrite the whole table before returning.
    pub fn record_result(
        &mut self,
        slide_path: &str,
        status: Status,
        error: Option<String>,
        traceback: Option<String>,
    ) -> Result<(), EmbedError> {
        if self.mode == LedgerMode::ReadOnly {
            return Err(EmbedError::Ledger(format!(
                "read-only ledger cannot record {} for {}",
                status, slide_path
            )));
        }
        let &i = self
            .by_path
            .get(slide_path)
            .ok_or_else(|| EmbedError::Ledger(format!("slide {} is not in the manifest", slide_path)))?;

        let row = &mut self.rows[i];
        row.feature_status = status;
        if error.is_some() || status == Status::Success {
            row.error = error;
            row.traceback = traceback;
        }

        self.persist()
            .map_err(|e| EmbedError::Ledger(format!("rewriting {} failed: {}", self.path.display(), e)))
    }

    fn persist(&self) -> Result<(), EmbedError> {
        let table = self
            .rows
            .iter()
            .map(|row| row.to_table_row(self.key_column))
            .collect::<Result<Vec<_>, _>>()?;
        let temp_path = self.path.with_extension("json.tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &table)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), rows = self.rows.len(), "manifest rewritten");
        Ok(())
    }

    pub fn summary(&self) -> RunSummary {
        let total_slides = self.rows.len();
        let slides_with_tiles = self
            .rows
            .iter()
            .filter(|r| r.tiling_status == Status::Success)
            .count();
        let failed = self
            .rows
            .iter()
            .filter(|r| r.feature_status != Status::Success)
            .count();
        RunSummary {
            slides_with_tiles,
            total_slides,
            failed,
            completed: total_slides - failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub slides_with_tiles: usize,
    pub total_slides: usize,
    pub failed: usize,
    pub completed: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=+=".repeat(10);
        writeln!(f, "{}", rule)?;
        writeln!(
            f,
            "Total number of slides with tiles: {}/{}",
            self.slides_with_tiles, self.total_slides
        )?;
        writeln!(f, "Failed feature extraction: {}", self.failed)?;
        writeln!(f, "Completed feature extraction: {}", self.completed)?;
        write!(f, "{}", rule)
    }
}
