//! File channel: enumeration, download and removal over the camera's FTP daemon
//!
//! The wire protocol lives in [`ftp`](crate::device::ftp); this module maps
//! the daemon's `NLST`/`LIST` output to [`FileDescriptor`]s and ties the
//! connection's lifetime to the session's cancellation token.

use crate::core::config::FtpConfig;
use crate::core::error::{ExportError, OpContext, Result};
use crate::device::ftp::{FtpConnection, FtpDownload};
use crate::device::net::Teardown;
use crate::device::traits::{ConnectionState, FileDescriptor, FileStream, SourceReader};
use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// What a `LIST` line describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// One parsed `LIST` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: NaiveDateTime,
}

fn split_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();
    for _ in 0..count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

fn parse_month(name: &str) -> Option<u32> {
    let name = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == name)
        .map(|i| i as u32 + 1)
}

/// Resolve the `Mon DD HH:MM` / `Mon DD YYYY` columns of a listing
///
/// Without a year the entry is the most recent such date not after `now`.
/// For `Feb 29` that may be several years back.
pub fn parse_list_time(month: &str, day: &str, time_or_year: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let month = parse_month(month)?;
    let day: u32 = day.parse().ok()?;

    if let Some((hour, minute)) = time_or_year.split_once(':') {
        let hour: u32 = hour.parse().ok()?;
        let minute: u32 = minute.parse().ok()?;

        // Leap years are at most 8 apart
        (0..=8)
            .filter_map(|back| NaiveDate::from_ymd_opt(now.year() - back, month, day))
            .filter_map(|date| date.and_hms_opt(hour, minute, 0))
            .find(|t| *t <= now)
    } else {
        let year: i32 = time_or_year.parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)
    }
}

/// Parse one unix `ls -l` style line
///
/// ```text
/// -rw-r--r--    1 root     root       4096 May  1 12:30 YDXJ0001.MP4
/// ```
///
/// Returns `None` for lines that are not entries (`total 8`, blanks).
pub fn parse_list_line(line: &str, now: NaiveDateTime) -> Option<ListEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (fields, name) = split_fields(line, 8)?;
    if name.is_empty() {
        return None;
    }

    let kind = match fields[0].chars().next()? {
        '-' => EntryKind::File,
        'd' => EntryKind::Directory,
        _ => EntryKind::Other,
    };
    let size: u64 = fields[4].parse().ok()?;
    let modified = parse_list_time(fields[5], fields[6], fields[7], now)?;

    Some(ListEntry {
        name: name.to_string(),
        kind,
        size,
        modified,
    })
}

/// Connection slot shared by the channel, its listings, readers and teardown
type SharedConnection = Arc<Mutex<Option<FtpConnection>>>;

/// Normalise an `NLST` name to a directory relative to the daemon root
fn directory_name(raw: &str) -> Option<String> {
    let name = raw.trim().trim_start_matches("./").trim_end_matches('/');
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// Turn one directory's `LIST` output into descriptors
///
/// Directories, links and unparsable lines are skipped.
pub fn descriptors_from_listing(directory: &str, lines: &[String], now: NaiveDateTime) -> Vec<FileDescriptor> {
    lines
        .iter()
        .filter_map(|line| {
            let entry = parse_list_line(line, now);
            if entry.is_none() {
                trace!("Skipping listing line {:?}", line);
            }
            entry
        })
        .filter(|entry| entry.kind == EntryKind::File && entry.name != "." && entry.name != "..")
        .map(|entry| FileDescriptor::new(&entry.name, directory, entry.modified, entry.size))
        .collect()
}

/// FTP session over the daemon started by the bootstrap channel
#[derive(Debug)]
pub struct FileChannel {
    config: FtpConfig,
    state: ConnectionState,
    conn: SharedConnection,
    teardown: Option<Teardown>,
}

impl FileChannel {
    pub fn new(config: FtpConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Unopened,
            conn: Arc::new(Mutex::new(None)),
            teardown: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn ensure_open(&self, op: &'static str) -> Result<()> {
        if self.state.is_open() {
            Ok(())
        } else {
            Err(ExportError::NotOpen { op })
        }
    }

    /// Connect and log in; `QUIT` is sent once `cancel` fires
    pub async fn login(&mut self, cancel: CancellationToken) -> Result<()> {
        const OP: &str = "FileChannel::login";

        if self.state != ConnectionState::Unopened {
            return Err(ExportError::NotOpen { op: OP });
        }

        let peer = format!("{}:{}", self.config.host, self.config.port);
        let conn = match FtpConnection::connect(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout(),
            self.config.io_timeout(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err::<(), _>(e).op_context(OP, "configure connection");
            }
        };

        if let Err(e) = conn.login(&self.config.user, &self.config.password).await {
            let _ = conn.quit().await;
            self.state = ConnectionState::Closed;
            return Err::<(), _>(e).op_context(OP, format!("login as {}", self.config.user));
        }

        info!("File-transfer session started with {} as {}", peer, self.config.user);
        *self.conn.lock().await = Some(conn);
        self.state = ConnectionState::Open;

        let slot = Arc::clone(&self.conn);
        let handle = tokio::spawn(async move {
            cancel.cancelled().await;
            // Waits for an in-flight transfer to release the connection
            let conn = slot.lock().await.take();
            if let Some(conn) = conn {
                match conn.quit().await {
                    Ok(()) => info!("File-transfer session with {} closed", peer),
                    Err(e) => warn!("Close file-transfer session with {} failed: {}", peer, e.chain()),
                }
            }
        });
        self.teardown = Some(Teardown::new("file-transfer", handle));

        Ok(())
    }

    /// Enumerate files lazily, one remote directory at a time
    ///
    /// The directory names are fetched up front; entries are listed on
    /// demand as the stream is pulled.
    pub async fn list_files(&mut self, cancel: CancellationToken) -> Result<FileListing> {
        const OP: &str = "FileChannel::list_files";
        self.ensure_open(OP)?;

        let names = {
            let guard = self.conn.lock().await;
            let conn = guard.as_ref().ok_or(ExportError::NotOpen { op: OP })?;
            conn.nlst().await.op_context(OP, "name list request")?
        };

        let directories: VecDeque<String> = names.iter().filter_map(|n| directory_name(n)).collect();
        debug!("Remote directories: {:?}", directories);

        Ok(FileListing {
            conn: Arc::clone(&self.conn),
            directories,
            batch: VecDeque::new(),
            cancel,
            now: Local::now().naive_local(),
        })
    }

    /// Start downloading one file
    pub async fn open_reader(&mut self, file: &FileDescriptor) -> Result<FtpFileReader> {
        const OP: &str = "FileChannel::open_reader";
        self.ensure_open(OP)?;

        let path = file.remote_path();
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let conn = guard.as_ref().ok_or(ExportError::NotOpen { op: OP })?;
        let download = conn
            .retr(&path)
            .await
            .op_context(OP, format!("send retr request: {}", path))?;

        Ok(FtpFileReader {
            _guard: guard,
            download,
            path,
        })
    }

    pub async fn delete(&mut self, file: &FileDescriptor) -> Result<()> {
        const OP: &str = "FileChannel::delete";
        self.ensure_open(OP)?;

        let path = file.remote_path();
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(ExportError::NotOpen { op: OP })?;
        conn.dele(&path)
            .await
            .op_context(OP, format!("send delete request file {}", path))
    }

    /// Wait for the teardown task (bounded) and mark the channel closed
    pub async fn close(&mut self, limit: Duration) {
        if let Some(teardown) = self.teardown.take() {
            teardown.wait(limit).await;
        }
        self.state = ConnectionState::Closed;
    }
}

/// Lazy, cancellable stream of remote files
pub struct FileListing {
    conn: SharedConnection,
    directories: VecDeque<String>,
    batch: VecDeque<FileDescriptor>,
    cancel: CancellationToken,
    now: NaiveDateTime,
}

impl FileListing {
    pub fn remaining_directories(&self) -> usize {
        self.directories.len()
    }
}

#[async_trait]
impl FileStream for FileListing {
    async fn next_file(&mut self) -> Result<Option<FileDescriptor>> {
        const OP: &str = "FileListing::next_file";

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(file) = self.batch.pop_front() {
                return Ok(Some(file));
            }
            let Some(directory) = self.directories.pop_front() else {
                return Ok(None);
            };

            let lines = {
                let guard = self.conn.lock().await;
                let conn = guard.as_ref().ok_or(ExportError::NotOpen { op: OP })?;
                conn.list(&directory)
                    .await
                    .op_context(OP, format!("list request {}", directory))?
            };

            self.batch = descriptors_from_listing(&directory, &lines, self.now).into();
            debug!("{}: {} file(s)", directory, self.batch.len());
        }
    }
}

/// Download stream of one file
///
/// Holds the FTP connection for the whole transfer; `close` reads the
/// server's verdict on it and then releases the connection.
pub struct FtpFileReader {
    _guard: OwnedMutexGuard<Option<FtpConnection>>,
    download: FtpDownload,
    path: String,
}

impl AsyncRead for FtpFileReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().download).poll_read(cx, buf)
    }
}

#[async_trait]
impl SourceReader for FtpFileReader {
    async fn close(&mut self) -> Result<()> {
        const OP: &str = "FtpFileReader::close";
        self.download
            .finish()
            .await
            .op_context(OP, format!("finish transfer {}", self.path))
    }
}
