//! In-memory media source for testing without a camera
//!
//! `MockMediaSource` implements [`MediaSource`] over a shared file table.
//! Clones share state, so a test can hand one clone to the exporter and
//! inspect the other afterwards. Faults are injected per file (stale size,
//! read error part-way, failing close) or per source (session start, delete).

use crate::core::error::{ExportError, Result};
use crate::device::traits::{FileDescriptor, FileStream, MediaSource, SourceReader};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

/// One file held by the mock source
#[derive(Debug, Clone)]
pub struct MockMediaFile {
    pub descriptor: FileDescriptor,
    pub content: Vec<u8>,
    /// Fail the read once this many bytes were delivered
    pub fail_after: Option<usize>,
    /// Report a failed transfer on close
    pub fail_close: bool,
}

#[derive(Debug, Default)]
struct MockMediaState {
    files: Vec<MockMediaFile>,
    fail_session_start: bool,
    fail_delete: bool,
    sessions_started: usize,
    sessions_ended: usize,
    listings_requested: usize,
    readers_opened: usize,
}

fn default_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 15)
        .and_then(|d| d.and_hms_opt(10, 30, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Shared-state mock of the camera
#[derive(Debug, Clone, Default)]
pub struct MockMediaSource {
    state: Arc<RwLock<MockMediaState>>,
}

impl MockMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MockMediaState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MockMediaState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, file: MockMediaFile) {
        self.write().files.push(file);
    }

    /// A healthy file whose declared size matches its content
    pub fn add_file(&self, directory: &str, name: &str, content: Vec<u8>) {
        let size = content.len() as u64;
        self.push(MockMediaFile {
            descriptor: FileDescriptor::new(name, directory, default_time(), size),
            content,
            fail_after: None,
            fail_close: false,
        });
    }

    /// A file whose declared size differs from what can be read
    pub fn add_stale_file(&self, directory: &str, name: &str, content: Vec<u8>, declared_size: u64) {
        self.push(MockMediaFile {
            descriptor: FileDescriptor::new(name, directory, default_time(), declared_size),
            content,
            fail_after: None,
            fail_close: false,
        });
    }

    /// A file whose read fails after `fail_after` bytes
    pub fn add_failing_file(&self, directory: &str, name: &str, content: Vec<u8>, fail_after: usize) {
        let size = content.len() as u64;
        self.push(MockMediaFile {
            descriptor: FileDescriptor::new(name, directory, default_time(), size),
            content,
            fail_after: Some(fail_after),
            fail_close: false,
        });
    }

    /// A file that reads fully but whose close reports failure
    pub fn add_file_failing_close(&self, directory: &str, name: &str, content: Vec<u8>) {
        let size = content.len() as u64;
        self.push(MockMediaFile {
            descriptor: FileDescriptor::new(name, directory, default_time(), size),
            content,
            fail_after: None,
            fail_close: true,
        });
    }

    /// Clear the injected faults of one file
    pub fn heal(&self, remote_path: &str) {
        for file in self.write().files.iter_mut() {
            if file.descriptor.remote_path() == remote_path {
                file.fail_after = None;
                file.fail_close = false;
            }
        }
    }

    pub fn fail_session_start(&self, fail: bool) {
        self.write().fail_session_start = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.write().fail_delete = fail;
    }

    pub fn has_file(&self, remote_path: &str) -> bool {
        self.read()
            .files
            .iter()
            .any(|f| f.descriptor.remote_path() == remote_path)
    }

    pub fn content_of(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.read()
            .files
            .iter()
            .find(|f| f.descriptor.remote_path() == remote_path)
            .map(|f| f.content.clone())
    }

    pub fn remaining(&self) -> Vec<String> {
        self.read()
            .files
            .iter()
            .map(|f| f.descriptor.remote_path())
            .collect()
    }

    pub fn sessions_started(&self) -> usize {
        self.read().sessions_started
    }

    pub fn sessions_ended(&self) -> usize {
        self.read().sessions_ended
    }

    pub fn listings_requested(&self) -> usize {
        self.read().listings_requested
    }

    pub fn readers_opened(&self) -> usize {
        self.read().readers_opened
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn session_start(&mut self, _cancel: CancellationToken) -> Result<()> {
        let mut state = self.write();
        state.sessions_started += 1;
        if state.fail_session_start {
            return Err(ExportError::connection(
                "MockMediaSource::session_start",
                "dial mock camera",
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            ));
        }
        Ok(())
    }

    async fn files(&mut self, cancel: CancellationToken) -> Result<Box<dyn FileStream>> {
        let mut state = self.write();
        state.listings_requested += 1;
        let pending = state.files.iter().map(|f| f.descriptor.clone()).collect();
        Ok(Box::new(MockFileStream { pending, cancel }))
    }

    async fn reader(&mut self, file: &FileDescriptor) -> Result<Box<dyn SourceReader>> {
        const OP: &str = "MockMediaSource::reader";
        let mut state = self.write();
        state.readers_opened += 1;

        let entry = state
            .files
            .iter()
            .find(|f| f.descriptor.remote_path() == file.remote_path())
            .ok_or_else(|| ExportError::protocol(OP, format!("550 {}: no such file", file.remote_path())))?;

        Ok(Box::new(MockReader {
            data: entry.content.clone(),
            position: 0,
            fail_after: entry.fail_after,
            fail_close: entry.fail_close,
        }))
    }

    async fn delete(&mut self, file: &FileDescriptor) -> Result<()> {
        const OP: &str = "MockMediaSource::delete";
        let mut state = self.write();
        if state.fail_delete {
            return Err(ExportError::protocol(OP, "550 permission denied"));
        }

        let before = state.files.len();
        state
            .files
            .retain(|f| f.descriptor.remote_path() != file.remote_path());
        if state.files.len() == before {
            return Err(ExportError::protocol(OP, format!("550 {}: no such file", file.remote_path())));
        }
        Ok(())
    }

    async fn session_end(&mut self) {
        self.write().sessions_ended += 1;
    }
}

/// Snapshot of the file table taken when the listing was requested
struct MockFileStream {
    pending: VecDeque<FileDescriptor>,
    cancel: CancellationToken,
}

#[async_trait]
impl FileStream for MockFileStream {
    async fn next_file(&mut self) -> Result<Option<FileDescriptor>> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(self.pending.pop_front())
    }
}

struct MockReader {
    data: Vec<u8>,
    position: usize,
    fail_after: Option<usize>,
    fail_close: bool,
}

impl AsyncRead for MockReader {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(limit) = this.fail_after {
            if this.position >= limit {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "mock camera dropped the transfer",
                )));
            }
        }

        let end = this
            .fail_after
            .map_or(this.data.len(), |limit| limit.min(this.data.len()));
        let available = end.saturating_sub(this.position);
        let n = available.min(buf.remaining());
        buf.put_slice(&this.data[this.position..this.position + n]);
        this.position += n;
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl SourceReader for MockReader {
    async fn close(&mut self) -> Result<()> {
        if self.fail_close {
            return Err(ExportError::protocol(
                "MockReader::close",
                "transfer not completed: 426 Connection closed; transfer aborted",
            ));
        }
        Ok(())
    }
}
