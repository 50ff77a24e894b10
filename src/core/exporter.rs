//! Export pipeline: copy, verify, then commit or roll back
//!
//! One poll cycle opens a device session, walks the camera's files one at a
//! time and, for each, copies it to local storage and compares the byte
//! count with the size the camera declared:
//!
//! - equal: the camera's copy is deleted (commit)
//! - different: the local copy is deleted and the camera's copy is left for
//!   a later cycle (rollback)
//!
//! A file is therefore removed from the camera only after a full local copy
//! exists. The poll loop repeats cycles until cancelled, waiting longer after
//! a successful cycle than after a failed one.
//!
//! # Example
//!
//! ```rust,no_run
//! use cam_export::core::config::Config;
//! use cam_export::core::exporter::{ExportOrchestrator, ExporterConfig};
//! use cam_export::core::sink::LocalSink;
//! use cam_export::device::DeviceFacade;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let config = Config::default();
//! let mut exporter = ExportOrchestrator::new(
//!     DeviceFacade::new(config.clone()),
//!     LocalSink::new(config.storage.clone()),
//!     ExporterConfig::from_config(&config),
//! );
//! exporter.run(CancellationToken::new()).await;
//! # }
//! ```

use crate::core::config::Config;
use crate::core::error::{ExportError, OpContext, Result};
use crate::core::sink::{MediaSink, SinkWriter};
use crate::core::tracking::ExportLedger;
use crate::device::traits::{FileDescriptor, MediaSource};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Configuration
// =============================================================================

/// Callback receiving pipeline events
pub type ProgressCallback = Arc<dyn Fn(ExportEvent) + Send + Sync>;

/// Configuration for the export loop
pub struct ExporterConfig {
    /// Wait after a failed cycle
    pub survey_interval: Duration,
    /// Wait after a successful cycle
    pub idle_interval: Duration,
    /// Callback for progress updates
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ExporterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterConfig")
            .field("survey_interval", &self.survey_interval)
            .field("idle_interval", &self.idle_interval)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl Clone for ExporterConfig {
    fn clone(&self) -> Self {
        Self {
            survey_interval: self.survey_interval,
            idle_interval: self.idle_interval,
            progress_callback: self.progress_callback.clone(),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            survey_interval: Duration::from_secs(60),
            idle_interval: Duration::from_secs(300),
            progress_callback: None,
        }
    }
}

impl ExporterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            survey_interval: config.export.survey_interval(),
            idle_interval: config.export.idle_interval(),
            progress_callback: None,
        }
    }

    pub fn survey_interval(mut self, value: Duration) -> Self {
        self.survey_interval = value;
        self
    }

    pub fn idle_interval(mut self, value: Duration) -> Self {
        self.idle_interval = value;
        self
    }

    /// Set progress callback
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ExportEvent) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }
}

// =============================================================================
// Events and reports
// =============================================================================

/// Pipeline events delivered to the progress callback
#[derive(Debug, Clone)]
pub enum ExportEvent {
    CycleStarted { cycle: u64 },
    FileStarted { file: FileDescriptor, index: usize },
    FileCommitted { file: FileDescriptor, local_path: PathBuf },
    FileRolledBack { file: FileDescriptor, transferred: u64 },
    CycleFinished { cycle: u64, report: CycleReport },
    CycleFailed { cycle: u64, error: String },
    Waiting { delay: Duration },
}

/// Outcome of one successful poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Files produced by enumeration
    pub files_found: usize,
    /// Files copied and removed from the camera
    pub committed: usize,
    /// Files whose local copy was discarded
    pub rolled_back: usize,
    /// Bytes of committed files
    pub bytes_committed: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn megabytes_committed(&self) -> f64 {
        self.bytes_committed as f64 / (1024.0 * 1024.0)
    }
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Found: {}, Committed: {}, Rolled back: {}, Size: {:.2} MB, Duration: {:.2}s",
            self.files_found,
            self.committed,
            self.rolled_back,
            self.megabytes_committed(),
            self.duration_ms as f64 / 1000.0
        )
    }
}

/// Result of the integrity decision for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Full copy stored at `local_path`; camera file removed
    Committed { bytes: u64, local_path: PathBuf },
    /// Short or long copy; local file removed
    RolledBack { transferred: u64 },
}

/// Writer adapter remembering whether an I/O error came from the local side
struct WriteSide<'a> {
    inner: &'a mut dyn SinkWriter,
    failed: bool,
}

impl<'a> WriteSide<'a> {
    fn new(inner: &'a mut dyn SinkWriter) -> Self {
        Self { inner, failed: false }
    }

    fn track<T>(&mut self, poll: Poll<std::io::Result<T>>) -> Poll<std::io::Result<T>> {
        if let Poll::Ready(Err(_)) = &poll {
            self.failed = true;
        }
        poll
    }
}

impl AsyncWrite for WriteSide<'_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        this.track(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut *this.inner).poll_flush(cx);
        this.track(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut *this.inner).poll_shutdown(cx);
        this.track(poll)
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Poll loop over a media source and a sink
pub struct ExportOrchestrator<S: MediaSource, K: MediaSink> {
    source: S,
    sink: K,
    config: ExporterConfig,
    ledger: Option<ExportLedger>,
    cycles: u64,
}

impl<S: MediaSource, K: MediaSink> ExportOrchestrator<S, K> {
    pub fn new(source: S, sink: K, config: ExporterConfig) -> Self {
        Self {
            source,
            sink,
            config,
            ledger: None,
            cycles: 0,
        }
    }

    /// Record cycles and committed files in `ledger`
    pub fn with_ledger(mut self, mut ledger: ExportLedger) -> Self {
        ledger.load_or_create();
        self.ledger = Some(ledger);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles
    }

    fn report_progress(&self, event: ExportEvent) {
        if let Some(callback) = &self.config.progress_callback {
            callback(event);
        }
    }

    /// Run poll cycles until `cancel` fires
    ///
    /// Cancellation is checked before each cycle and cuts the wait between
    /// cycles short; a transfer already in progress is allowed to finish.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!("Export loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let delay = match self.run_cycle(&cancel).await {
                Ok(report) => {
                    info!("Cycle {} complete: {}", self.cycles, report);
                    self.config.idle_interval
                }
                Err(e) => {
                    error!("Cycle {} failed: {}", self.cycles, e.chain());
                    self.config.survey_interval
                }
            };

            if cancel.is_cancelled() {
                break;
            }

            debug!("Next cycle in {:?}", delay);
            self.report_progress(ExportEvent::Waiting { delay });

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!("Export loop stopped after {} cycle(s)", self.cycles);
    }

    /// Run exactly one poll cycle
    ///
    /// The device session lives under a child of `cancel` that is cancelled
    /// when the cycle returns, so every channel is torn down each cycle.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport> {
        self.cycles += 1;
        let cycle = self.cycles;
        let session = cancel.child_token();

        if let Some(ledger) = self.ledger.as_mut() {
            ledger.start_cycle();
        }
        self.report_progress(ExportEvent::CycleStarted { cycle });

        let result = self.cycle(&session).await;

        session.cancel();
        self.source.session_end().await;

        if let Some(ledger) = self.ledger.as_mut() {
            ledger.finish_cycle(result.as_ref().err());
        }

        match &result {
            Ok(report) => self.report_progress(ExportEvent::CycleFinished {
                cycle,
                report: report.clone(),
            }),
            Err(e) => self.report_progress(ExportEvent::CycleFailed {
                cycle,
                error: e.chain(),
            }),
        }

        result
    }

    async fn cycle(&mut self, session: &CancellationToken) -> Result<CycleReport> {
        const OP: &str = "ExportOrchestrator::cycle";
        let started = Instant::now();

        self.source
            .session_start(session.clone())
            .await
            .op_context(OP, "device session start")?;
        self.sink
            .session_start()
            .await
            .op_context(OP, "storage session start")?;

        let mut stream = self
            .source
            .files(session.clone())
            .await
            .op_context(OP, "get files")?;

        let mut report = CycleReport::default();

        while let Some(file) = stream.next_file().await.op_context(OP, "get files")? {
            report.files_found += 1;
            debug!("Transferring {}", file);
            self.report_progress(ExportEvent::FileStarted {
                file: file.clone(),
                index: report.files_found,
            });

            let outcome = self
                .transfer(&file)
                .await
                .op_context(OP, format!("transfer {}", file.remote_path()))?;

            match outcome {
                TransferOutcome::Committed { bytes, local_path } => {
                    info!("Exported {} -> {}", file, local_path.display());
                    report.committed += 1;
                    report.bytes_committed += bytes;
                    if let Some(ledger) = self.ledger.as_mut() {
                        ledger.record_committed(&file, &local_path);
                    }
                    self.report_progress(ExportEvent::FileCommitted { file, local_path });
                }
                TransferOutcome::RolledBack { transferred } => {
                    report.rolled_back += 1;
                    if let Some(ledger) = self.ledger.as_mut() {
                        ledger.record_rolled_back();
                    }
                    self.report_progress(ExportEvent::FileRolledBack { file, transferred });
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Copy one file and apply the integrity decision
    pub async fn transfer(&mut self, file: &FileDescriptor) -> Result<TransferOutcome> {
        const OP: &str = "ExportOrchestrator::transfer";

        let mut writer = self
            .sink
            .writer(file)
            .await
            .op_context(OP, "get writer")?;

        let transferred = match self.copy_and_close(file, &mut writer).await {
            Ok(n) => n,
            Err(e) => {
                drop(writer);
                self.discard_partial(file).await;
                return Err(e);
            }
        };
        drop(writer);

        if transferred == file.declared_size {
            let local_path = self
                .sink
                .commit(file)
                .await
                .op_context(OP, "commit destination")?;
            self.source
                .delete(file)
                .await
                .op_context(OP, "delete source")?;
            Ok(TransferOutcome::Committed {
                bytes: transferred,
                local_path,
            })
        } else {
            warn!(
                "Size mismatch for {}: declared {} bytes, transferred {}; keeping the camera copy",
                file.remote_path(),
                file.declared_size,
                transferred
            );
            self.sink
                .delete(file)
                .await
                .op_context(OP, "delete destination")?;
            Ok(TransferOutcome::RolledBack { transferred })
        }
    }

    async fn copy_and_close(&mut self, file: &FileDescriptor, writer: &mut Box<dyn SinkWriter>) -> Result<u64> {
        const OP: &str = "ExportOrchestrator::copy";

        let mut reader = self
            .source
            .reader(file)
            .await
            .op_context(OP, "get reader")?;

        let mut destination = WriteSide::new(writer.as_mut());
        let copied = match tokio::io::copy(&mut reader, &mut destination).await {
            Ok(n) => n,
            Err(e) if destination.failed => {
                return Err(ExportError::filesystem(OP, "write", writer.path(), e));
            }
            Err(e) => return Err(ExportError::connection(OP, format!("copy {}", file.remote_path()), e)),
        };

        reader.close().await.op_context(OP, "close reader")?;
        writer.close().await.op_context(OP, "close writer")?;
        Ok(copied)
    }

    /// Remove whatever a failed transfer left locally
    async fn discard_partial(&mut self, file: &FileDescriptor) {
        match self.sink.delete(file).await {
            Ok(()) => debug!("Removed partial copy of {}", file.remote_path()),
            Err(e) => warn!(
                "Could not remove partial copy of {}: {}",
                file.remote_path(),
                e.chain()
            ),
        }
    }

    /// Open a session, enumerate every remote file and tear down again
    ///
    /// Nothing is copied or deleted.
    pub async fn survey(&mut self, cancel: &CancellationToken) -> Result<Vec<FileDescriptor>> {
        const OP: &str = "ExportOrchestrator::survey";
        let session = cancel.child_token();

        let result = async {
            self.source
                .session_start(session.clone())
                .await
                .op_context(OP, "device session start")?;
            let mut stream = self
                .source
                .files(session.clone())
                .await
                .op_context(OP, "get files")?;

            let mut files = Vec::new();
            while let Some(file) = stream.next_file().await.op_context(OP, "get files")? {
                files.push(file);
            }
            Ok::<_, ExportError>(files)
        }
        .await;

        session.cancel();
        self.source.session_end().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{StorageConfig, TrackingConfig};
    use crate::core::sink::LocalSink;
    use crate::testdb::mock_media::MockMediaSource;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn sink_in(dir: &TempDir) -> LocalSink {
        LocalSink::new(StorageConfig {
            directory: dir.path().to_path_buf(),
            preserve_structure: false,
            min_free_bytes: 0,
        })
    }

    fn quick_config() -> ExporterConfig {
        ExporterConfig::default()
            .survey_interval(Duration::from_millis(50))
            .idle_interval(Duration::from_millis(50))
    }

    fn local_files(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_full_copy_commits() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("DCIM", "A.MP4", vec![5u8; 4096]);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let report = exporter.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.committed, 1);
        assert_eq!(report.bytes_committed, 4096);
        assert!(!source.has_file("DCIM/A.MP4"));
        let local = std::fs::read(temp_dir.path().join("A.MP4")).unwrap();
        assert_eq!(local.len(), 4096);
        assert_eq!(source.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn test_stale_size_rolls_back_and_continues() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_stale_file("DCIM", "A.MP4", vec![1u8; 4090], 4096);
        source.add_file("DCIM", "B.MP4", vec![2u8; 100]);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let report = exporter.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.rolled_back, 1);
        assert_eq!(report.committed, 1);
        assert!(source.has_file("DCIM/A.MP4"));
        assert_eq!(source.content_of("DCIM/A.MP4").unwrap().len(), 4090);
        assert!(!source.has_file("DCIM/B.MP4"));
        assert_eq!(local_files(&temp_dir), vec!["B.MP4"]);
    }

    #[tokio::test]
    async fn test_read_error_aborts_cycle_and_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_failing_file("DCIM", "A.MP4", vec![3u8; 4096], 2000);
        source.add_file("DCIM", "B.MP4", vec![4u8; 10]);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let err = exporter.run_cycle(&CancellationToken::new()).await.unwrap_err();

        assert!(err.chain().contains("transfer DCIM/A.MP4"));
        assert!(source.has_file("DCIM/A.MP4"));
        // Later files are not attempted once the cycle aborts
        assert!(source.has_file("DCIM/B.MP4"));
        assert!(local_files(&temp_dir).is_empty());
        assert_eq!(source.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_aborts_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file_failing_close("DCIM", "A.MP4", vec![3u8; 64]);
        source.add_file("DCIM", "B.MP4", vec![4u8; 10]);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let err = exporter.run_cycle(&CancellationToken::new()).await.unwrap_err();

        assert!(err.chain().contains("close reader"));
        assert!(source.has_file("DCIM/A.MP4"));
        assert!(source.has_file("DCIM/B.MP4"));
        assert!(local_files(&temp_dir).is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_failure_starts_from_scratch() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_failing_file("DCIM", "A.MP4", vec![3u8; 4096], 2000);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        assert!(exporter.run_cycle(&CancellationToken::new()).await.is_err());

        source.heal("DCIM/A.MP4");
        let report = exporter.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(std::fs::read(temp_dir.path().join("A.MP4")).unwrap(), vec![3u8; 4096]);
    }

    #[tokio::test]
    async fn test_session_failure_touches_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("DCIM", "A.MP4", vec![5u8; 10]);
        source.fail_session_start(true);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let err = exporter.run_cycle(&CancellationToken::new()).await.unwrap_err();

        assert!(err.chain().contains("device session start"));
        assert_eq!(source.listings_requested(), 0);
        assert_eq!(source.readers_opened(), 0);
        assert!(source.has_file("DCIM/A.MP4"));
        assert!(local_files(&temp_dir).is_empty());
        // Channels that did open are still torn down
        assert_eq!(source.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn test_sink_precondition_failure_aborts() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("DCIM", "A.MP4", vec![5u8; 10]);

        // A regular file where the storage root should be
        let blocked = temp_dir.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();
        let sink = LocalSink::new(StorageConfig {
            directory: blocked,
            preserve_structure: false,
            min_free_bytes: 0,
        });

        let mut exporter = ExportOrchestrator::new(source.clone(), sink, quick_config());
        let err = exporter.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(err.chain().contains("storage session start"));
        assert!(err.is_filesystem());
        assert_eq!(source.listings_requested(), 0);
    }

    #[tokio::test]
    async fn test_source_delete_failure_aborts() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("DCIM", "A.MP4", vec![5u8; 10]);
        source.fail_delete(true);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let err = exporter.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(err.chain().contains("delete source"));
        // The full local copy is kept; the next cycle stores a second one beside it
        assert_eq!(local_files(&temp_dir), vec!["A.MP4"]);
        assert!(source.has_file("DCIM/A.MP4"));

        source.fail_delete(false);
        exporter.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(local_files(&temp_dir), vec!["A (1).MP4", "A.MP4"]);
        assert!(!source.has_file("DCIM/A.MP4"));
    }

    #[tokio::test]
    async fn test_same_name_in_later_folder_keeps_exported_clip() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("100MEDIA", "YDXJ0001.MP4", vec![1u8; 4096]);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        exporter.run_cycle(&CancellationToken::new()).await.unwrap();
        assert!(!source.has_file("100MEDIA/YDXJ0001.MP4"));

        // Counter reset or a second media folder reuses the name
        source.add_file("101MEDIA", "YDXJ0001.MP4", vec![2u8; 100]);
        let report = exporter.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.committed, 1);

        assert_eq!(
            std::fs::read(temp_dir.path().join("YDXJ0001.MP4")).unwrap(),
            vec![1u8; 4096]
        );
        assert_eq!(
            std::fs::read(temp_dir.path().join("YDXJ0001 (1).MP4")).unwrap(),
            vec![2u8; 100]
        );
    }

    #[tokio::test]
    async fn test_transfer_reports_where_the_copy_landed() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("DCIM", "A.MP4", vec![9u8; 32]);
        std::fs::write(temp_dir.path().join("A.MP4"), b"older").unwrap();

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let file = FileDescriptor::new("A.MP4", "DCIM", chrono::NaiveDateTime::MIN, 32);
        let outcome = exporter.transfer(&file).await.unwrap();

        assert_eq!(
            outcome,
            TransferOutcome::Committed {
                bytes: 32,
                local_path: temp_dir.path().join("A (1).MP4"),
            }
        );
        assert_eq!(std::fs::read(temp_dir.path().join("A.MP4")).unwrap(), b"older");
    }

    /// Sink whose writes fail as if the disk were full
    struct FullDisk {
        path: PathBuf,
        deletes: Arc<Mutex<usize>>,
    }

    struct FullDiskWriter {
        path: PathBuf,
    }

    impl AsyncWrite for FullDiskWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut TaskContext<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait::async_trait]
    impl SinkWriter for FullDiskWriter {
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn path(&self) -> &std::path::Path {
            &self.path
        }
    }

    #[async_trait::async_trait]
    impl MediaSink for FullDisk {
        async fn session_start(&mut self) -> Result<()> {
            Ok(())
        }

        async fn writer(&mut self, _file: &FileDescriptor) -> Result<Box<dyn SinkWriter>> {
            Ok(Box::new(FullDiskWriter {
                path: self.path.clone(),
            }))
        }

        async fn commit(&mut self, _file: &FileDescriptor) -> Result<PathBuf> {
            Ok(self.path.clone())
        }

        async fn delete(&mut self, _file: &FileDescriptor) -> Result<()> {
            *self.deletes.lock().unwrap() += 1;
            Ok(())
        }

        fn local_path(&self, _file: &FileDescriptor) -> PathBuf {
            self.path.clone()
        }
    }

    #[tokio::test]
    async fn test_local_write_failure_is_a_filesystem_error() {
        let source = MockMediaSource::new();
        source.add_file("DCIM", "A.MP4", vec![1u8; 64]);
        let deletes = Arc::new(Mutex::new(0));
        let sink = FullDisk {
            path: PathBuf::from("/full/A.MP4"),
            deletes: Arc::clone(&deletes),
        };

        let mut exporter = ExportOrchestrator::new(source.clone(), sink, quick_config());
        let err = exporter.run_cycle(&CancellationToken::new()).await.unwrap_err();

        assert!(err.is_filesystem());
        assert!(!err.is_connection());
        assert!(err.chain().contains("no space left on device"));
        assert!(source.has_file("DCIM/A.MP4"));
        assert_eq!(*deletes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_source_read_failure_is_a_connection_error() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_failing_file("DCIM", "A.MP4", vec![3u8; 4096], 2000);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let err = exporter.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_connection());
        assert!(!err.is_filesystem());
    }

    #[tokio::test]
    async fn test_cancel_during_idle_wait_exits() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        let config = ExporterConfig::default()
            .survey_interval(Duration::from_secs(3600))
            .idle_interval(Duration::from_secs(3600));

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), config);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                exporter.run(cancel).await;
                exporter.cycles_run()
            }
        });

        for _ in 0..100 {
            if source.sessions_ended() == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        let cycles = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(cycles, 1);
        assert_eq!(source.sessions_started(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());

        let cancel = CancellationToken::new();
        cancel.cancel();
        exporter.run(cancel).await;
        assert_eq!(source.sessions_started(), 0);
    }

    #[tokio::test]
    async fn test_loop_retries_after_failure() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("DCIM", "A.MP4", vec![5u8; 10]);
        source.fail_session_start(true);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let cancel = CancellationToken::new();
        let watcher = source.clone();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            while watcher.sessions_started() < 2 {
                sleep(Duration::from_millis(10)).await;
            }
            watcher.fail_session_start(false);
            while watcher.has_file("DCIM/A.MP4") {
                sleep(Duration::from_millis(10)).await;
            }
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), exporter.run(cancel))
            .await
            .expect("loop did not stop");
        assert!(temp_dir.path().join("A.MP4").exists());
        assert!(exporter.cycles_run() >= 3);
    }

    #[tokio::test]
    async fn test_events_and_ledger() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("DCIM", "A.MP4", vec![5u8; 10]);
        source.add_stale_file("DCIM", "B.MP4", vec![5u8; 5], 10);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let config = quick_config().with_progress(move |event| {
            let label = match event {
                ExportEvent::CycleStarted { .. } => "started",
                ExportEvent::FileStarted { .. } => "file",
                ExportEvent::FileCommitted { .. } => "committed",
                ExportEvent::FileRolledBack { .. } => "rolled_back",
                ExportEvent::CycleFinished { .. } => "finished",
                ExportEvent::CycleFailed { .. } => "failed",
                ExportEvent::Waiting { .. } => "waiting",
            };
            sink_events.lock().unwrap().push(label);
        });

        let ledger = ExportLedger::new(&TrackingConfig::default(), temp_dir.path());
        let mut exporter =
            ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), config).with_ledger(ledger);
        exporter.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["started", "file", "committed", "file", "rolled_back", "finished"]
        );

        let ledger_path = temp_dir.path().join(TrackingConfig::default().tracking_filename);
        let state = ExportLedger::load(&ledger_path).unwrap();
        assert_eq!(state.totals.files_committed, 1);
        assert_eq!(state.totals.files_rolled_back, 1);
        assert_eq!(state.cycles.len(), 1);
    }

    #[tokio::test]
    async fn test_survey_lists_without_touching() {
        let temp_dir = TempDir::new().unwrap();
        let source = MockMediaSource::new();
        source.add_file("100MEDIA", "A.MP4", vec![5u8; 10]);
        source.add_file("101MEDIA", "B.MP4", vec![5u8; 20]);

        let mut exporter = ExportOrchestrator::new(source.clone(), sink_in(&temp_dir), quick_config());
        let files = exporter.survey(&CancellationToken::new()).await.unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(source.readers_opened(), 0);
        assert!(source.has_file("100MEDIA/A.MP4"));
        assert_eq!(source.sessions_ended(), 1);
    }

    #[test]
    fn test_report_display() {
        let report = CycleReport {
            files_found: 3,
            committed: 2,
            rolled_back: 1,
            bytes_committed: 2 * 1024 * 1024,
            duration_ms: 1500,
        };
        assert_eq!(
            report.to_string(),
            "Found: 3, Committed: 2, Rolled back: 1, Size: 2.00 MB, Duration: 1.50s"
        );
    }
}
