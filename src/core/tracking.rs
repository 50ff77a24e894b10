//! Export ledger
//!
//! A JSON file in the storage root that records:
//! - Cumulative totals across all poll cycles
//! - The most recent cycles (start/end, outcome, error text)
//! - Every committed file (remote path, size, local path, time)
//!
//! The ledger is informational. The camera itself is the source of truth for
//! what still needs exporting, so a lost or corrupt ledger only loses history.

use crate::core::config::TrackingConfig;
use crate::core::error::{ExportError, Result};
use crate::device::traits::FileDescriptor;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Ledger file format version
const LEDGER_VERSION: u32 = 1;

/// Cycles kept in the ledger
pub const MAX_CYCLE_RECORDS: usize = 100;

/// Ledger contents as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerState {
    /// Version of the ledger format
    pub version: u32,

    /// Cumulative totals
    pub totals: LedgerTotals,

    /// Most recent cycles, oldest first
    #[serde(default)]
    pub cycles: Vec<CycleRecord>,

    /// Files committed (removed from the camera after a verified copy)
    #[serde(default)]
    pub committed: Vec<CommittedFile>,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            totals: LedgerTotals::default(),
            cycles: Vec::new(),
            committed: Vec::new(),
        }
    }
}

/// Cumulative statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub files_committed: u64,
    pub files_rolled_back: u64,
    pub bytes_committed: u64,
}

/// Record of one poll cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub committed: u64,
    pub rolled_back: u64,
    pub bytes: u64,
    /// Error chain when the cycle aborted
    pub error: Option<String>,
}

impl CycleRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// One committed file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedFile {
    pub remote_path: String,
    pub size: u64,
    pub local_path: PathBuf,
    pub committed_at: DateTime<Utc>,
}

/// Tracker that owns the ledger file
pub struct ExportLedger {
    /// Path to the ledger file
    path: PathBuf,

    state: LedgerState,

    /// Cycle in progress, if any
    current: Option<CycleRecord>,

    /// Whether the state has been modified since the last save
    dirty: bool,
}

impl ExportLedger {
    /// Create a ledger for `storage_root`; nothing is read until `load_or_create`
    pub fn new(config: &TrackingConfig, storage_root: &Path) -> Self {
        Self {
            path: storage_root.join(&config.tracking_filename),
            state: LedgerState::default(),
            current: None,
            dirty: false,
        }
    }

    /// Read a ledger file
    pub fn load(path: &Path) -> Result<LedgerState> {
        const OP: &str = "ExportLedger::load";

        let file = File::open(path).map_err(|e| ExportError::filesystem(OP, "open", path, e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            ExportError::filesystem(
                OP,
                "parse",
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    /// Load the existing ledger, or start a fresh one if missing or unreadable
    pub fn load_or_create(&mut self) {
        if !self.path.exists() {
            debug!("Creating new export ledger at {}", self.path.display());
            self.state = LedgerState::default();
            self.dirty = true;
            return;
        }

        match Self::load(&self.path) {
            Ok(state) => {
                debug!(
                    "Loaded export ledger ({} files committed so far)",
                    state.totals.files_committed
                );
                self.state = state;
            }
            Err(e) => {
                warn!("Failed to load export ledger: {}. Starting a new one.", e);
                self.state = LedgerState::default();
                self.dirty = true;
            }
        }
    }

    /// Write the ledger if it changed
    pub fn save(&mut self) -> Result<()> {
        const OP: &str = "ExportLedger::save";

        if !self.dirty {
            trace!("Ledger not modified, skipping save");
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ExportError::filesystem(OP, "create directory", parent, e))?;
        }

        let file = File::create(&self.path)
            .map_err(|e| ExportError::filesystem(OP, "create", &self.path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.state).map_err(|e| {
            ExportError::filesystem(
                OP,
                "write",
                &self.path,
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })?;

        debug!("Saved export ledger to {}", self.path.display());
        self.dirty = false;
        Ok(())
    }

    pub fn start_cycle(&mut self) {
        let now = Utc::now();
        self.current = Some(CycleRecord {
            started_at: now,
            ended_at: now,
            committed: 0,
            rolled_back: 0,
            bytes: 0,
            error: None,
        });
        self.dirty = true;
    }

    pub fn record_committed(&mut self, file: &FileDescriptor, local_path: &Path) {
        if let Some(cycle) = self.current.as_mut() {
            cycle.committed += 1;
            cycle.bytes += file.declared_size;
        }

        self.state.totals.files_committed += 1;
        self.state.totals.bytes_committed += file.declared_size;
        self.state.committed.push(CommittedFile {
            remote_path: file.remote_path(),
            size: file.declared_size,
            local_path: local_path.to_path_buf(),
            committed_at: Utc::now(),
        });
        self.dirty = true;
    }

    pub fn record_rolled_back(&mut self) {
        if let Some(cycle) = self.current.as_mut() {
            cycle.rolled_back += 1;
        }
        self.state.totals.files_rolled_back += 1;
        self.dirty = true;
    }

    /// Close the current cycle and save
    pub fn finish_cycle(&mut self, error: Option<&ExportError>) {
        if let Some(mut cycle) = self.current.take() {
            cycle.ended_at = Utc::now();
            cycle.error = error.map(ExportError::chain);

            self.state.totals.cycles += 1;
            if cycle.error.is_some() {
                self.state.totals.failed_cycles += 1;
            }

            self.state.cycles.push(cycle);
            if self.state.cycles.len() > MAX_CYCLE_RECORDS {
                let excess = self.state.cycles.len() - MAX_CYCLE_RECORDS;
                self.state.cycles.drain(..excess);
            }
            self.dirty = true;
        }

        if let Err(e) = self.save() {
            warn!("Failed to save export ledger: {}", e);
        }
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExportLedger {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.save() {
                warn!("Failed to save export ledger on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn descriptor(name: &str, size: u64) -> FileDescriptor {
        let time = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        FileDescriptor::new(name, "100MEDIA", time, size)
    }

    #[test]
    fn test_cycle_accounting() {
        let temp_dir = TempDir::new().unwrap();
        let mut ledger = ExportLedger::new(&TrackingConfig::default(), temp_dir.path());
        ledger.load_or_create();

        ledger.start_cycle();
        ledger.record_committed(&descriptor("A.MP4", 1000), &temp_dir.path().join("A.MP4"));
        ledger.record_committed(&descriptor("B.MP4", 2000), &temp_dir.path().join("B.MP4"));
        ledger.record_rolled_back();
        ledger.finish_cycle(None);

        let state = ledger.state();
        assert_eq!(state.totals.cycles, 1);
        assert_eq!(state.totals.files_committed, 2);
        assert_eq!(state.totals.bytes_committed, 3000);
        assert_eq!(state.totals.files_rolled_back, 1);
        assert_eq!(state.cycles[0].committed, 2);
        assert!(state.cycles[0].succeeded());
        assert_eq!(state.committed[1].remote_path, "100MEDIA/B.MP4");
    }

    #[test]
    fn test_failed_cycle_records_error_chain() {
        let temp_dir = TempDir::new().unwrap();
        let mut ledger = ExportLedger::new(&TrackingConfig::default(), temp_dir.path());

        ledger.start_cycle();
        let err = ExportError::protocol("ControlSession::read_reply", "msg_id 257 rejected with rval -3");
        ledger.finish_cycle(Some(&err));

        assert_eq!(ledger.state().totals.failed_cycles, 1);
        let recorded = ledger.state().cycles[0].error.clone().unwrap();
        assert!(recorded.contains("rejected"));
    }

    #[test]
    fn test_persisted_and_reloaded() {
        let temp_dir = TempDir::new().unwrap();
        let config = TrackingConfig::default();
        {
            let mut ledger = ExportLedger::new(&config, temp_dir.path());
            ledger.load_or_create();
            ledger.start_cycle();
            ledger.record_committed(&descriptor("A.MP4", 10), &temp_dir.path().join("A.MP4"));
            ledger.finish_cycle(None);
        }

        let path = temp_dir.path().join(&config.tracking_filename);
        let state = ExportLedger::load(&path).unwrap();
        assert_eq!(state.totals.files_committed, 1);

        let mut ledger = ExportLedger::new(&config, temp_dir.path());
        ledger.load_or_create();
        assert_eq!(ledger.state().committed.len(), 1);
    }

    #[test]
    fn test_cycle_history_is_capped() {
        let temp_dir = TempDir::new().unwrap();
        let mut ledger = ExportLedger::new(&TrackingConfig::default(), temp_dir.path());

        for _ in 0..(MAX_CYCLE_RECORDS + 5) {
            ledger.start_cycle();
            ledger.finish_cycle(None);
        }
        assert_eq!(ledger.state().cycles.len(), MAX_CYCLE_RECORDS);
        assert_eq!(ledger.state().totals.cycles, (MAX_CYCLE_RECORDS + 5) as u64);
    }

    #[test]
    fn test_corrupt_ledger_starts_fresh() {
        let temp_dir = TempDir::new().unwrap();
        let config = TrackingConfig::default();
        fs::write(temp_dir.path().join(&config.tracking_filename), "{ not json").unwrap();

        let mut ledger = ExportLedger::new(&config, temp_dir.path());
        ledger.load_or_create();
        assert_eq!(ledger.state().totals, LedgerTotals::default());
        assert!(ExportLedger::load(ledger.path()).is_err());
    }
}
