//! Device abstraction traits for testability
//!
//! The exporter talks to the camera only through [`MediaSource`]. The real
//! implementation is [`DeviceFacade`](super::facade::DeviceFacade), which
//! sequences the three protocol channels; tests plug in
//! [`MockMediaSource`](crate::testdb::MockMediaSource) instead.
//!
//! # Architecture
//!
//! - `MediaSource` - session start, lazy enumeration, read and delete
//! - `FileStream` - cancellable, finite, non-restartable descriptor stream
//! - `SourceReader` - byte stream of one remote file with an explicit close
//! - `FileDescriptor` - identity of one remote file (shared, not a trait)

use crate::core::error::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Remote file identity discovered during enumeration
///
/// Immutable once produced; lives only for one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// File name (e.g. `YDXJ0001.MP4`)
    pub name: String,
    /// Directory relative to the daemon root (e.g. `100MEDIA`)
    pub containing_directory: String,
    /// Modification time as reported by the device (device local time)
    pub modified_time: NaiveDateTime,
    /// Size the device claims for the file
    pub declared_size: u64,
}

impl FileDescriptor {
    pub fn new(
        name: &str,
        containing_directory: &str,
        modified_time: NaiveDateTime,
        declared_size: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            containing_directory: containing_directory.to_string(),
            modified_time,
            declared_size,
        }
    }

    /// Full path understood by the file-transfer daemon
    pub fn remote_path(&self) -> String {
        let dir = self.containing_directory.trim_end_matches('/');
        if dir.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", dir, self.name)
        }
    }

    /// Destination path below `root`
    pub fn local_path(&self, root: &Path, preserve_structure: bool) -> PathBuf {
        if preserve_structure && !self.containing_directory.is_empty() {
            root.join(self.containing_directory.trim_matches('/'))
                .join(&self.name)
        } else {
            root.join(&self.name)
        }
    }
}

impl Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.remote_path(), self.declared_size)
    }
}

/// Lifecycle of one protocol channel
///
/// Monotonic: `Unopened -> Open -> Closed`. A closed channel is never
/// reopened; the next attempt builds a fresh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unopened,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

/// Lazy stream of remote files
///
/// Yields `Ok(None)` once exhausted or once its cancellation token fires.
#[async_trait]
pub trait FileStream: Send {
    async fn next_file(&mut self) -> Result<Option<FileDescriptor>>;
}

/// Read side of one remote file
///
/// `close` must be called after the bytes are consumed; it reports whether
/// the device considered the transfer complete.
#[async_trait]
pub trait SourceReader: AsyncRead + Unpin + Send {
    async fn close(&mut self) -> Result<()>;
}

/// The camera as seen by the exporter
#[async_trait]
pub trait MediaSource: Send {
    /// Open every channel needed for enumeration and transfer.
    ///
    /// `cancel` scopes the session: once it fires, every channel tears down.
    async fn session_start(&mut self, cancel: CancellationToken) -> Result<()>;

    /// Enumerate remote files lazily
    async fn files(&mut self, cancel: CancellationToken) -> Result<Box<dyn FileStream>>;

    /// Open a read stream for one file
    async fn reader(&mut self, file: &FileDescriptor) -> Result<Box<dyn SourceReader>>;

    /// Remove one file from the device
    async fn delete(&mut self, file: &FileDescriptor) -> Result<()>;

    /// Wait for every channel's teardown after the session token fired
    async fn session_end(&mut self);
}
