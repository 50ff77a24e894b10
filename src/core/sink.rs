//! Local destination storage
//!
//! A copy is written to a hidden partial file next to its destination
//! (`.<name>.part`). Writers always start that partial from empty, so an
//! earlier interrupted attempt is discarded rather than extended. Only
//! `commit` moves the partial into place, and it never replaces a copy that
//! is already there: a name collision gets a ` (n)` suffix instead.

use crate::core::config::StorageConfig;
use crate::core::error::{ExportError, Result};
use crate::device::traits::FileDescriptor;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use sysinfo::Disks;
use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

/// Write side of one destination file
#[async_trait]
pub trait SinkWriter: AsyncWrite + Unpin + Send {
    /// Flush and sync the file to disk
    async fn close(&mut self) -> Result<()>;

    fn path(&self) -> &Path;
}

/// Destination for exported files
#[async_trait]
pub trait MediaSink: Send {
    /// Prepare the destination for a cycle (directory, free space)
    async fn session_start(&mut self) -> Result<()>;

    /// Create a fresh, empty in-progress copy for `file`
    async fn writer(&mut self, file: &FileDescriptor) -> Result<Box<dyn SinkWriter>>;

    /// Move the verified copy of `file` into place and return where it landed
    async fn commit(&mut self, file: &FileDescriptor) -> Result<PathBuf>;

    /// Remove the in-progress copy of `file`
    async fn delete(&mut self, file: &FileDescriptor) -> Result<()>;

    /// Where `file` lands unless that name is already taken
    fn local_path(&self, file: &FileDescriptor) -> PathBuf;
}

/// Free bytes on the disk holding `path`, by longest mount-point match
pub fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    disks
        .list()
        .iter()
        .filter(|disk| absolute.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// In-progress name for a destination: `.<name>.part` in the same directory
pub fn partial_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    destination.with_file_name(format!(".{}.part", name))
}

/// First free variant of `path`: `A.MP4`, `A (1).MP4`, `A (2).MP4`, ...
pub async fn available_path(path: PathBuf) -> PathBuf {
    if !fs::try_exists(&path).await.unwrap_or(false) {
        return path;
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let (base_name, extensions) = match filename.find('.') {
        Some(pos) if pos > 0 => (filename[..pos].to_string(), filename[pos..].to_string()),
        _ => (filename, String::new()),
    };

    let mut counter = 1u32;
    loop {
        let candidate = path.with_file_name(format!("{} ({}){}", base_name, counter, extensions));
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        counter += 1;
    }
}

/// Destination files on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalSink {
    config: StorageConfig,
}

impl LocalSink {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.directory
    }

    async fn check_free_space(&self) -> Result<()> {
        const OP: &str = "LocalSink::check_free_space";

        let required = self.config.min_free_bytes;
        if required == 0 {
            return Ok(());
        }

        let root = self.config.directory.clone();
        let available = tokio::task::spawn_blocking(move || available_space(&root))
            .await
            .ok()
            .flatten();

        match available {
            Some(free) if free >= required => {
                debug!("{} bytes free on the destination disk", free);
                Ok(())
            }
            Some(free) => Err(ExportError::Precondition {
                op: OP,
                message: format!(
                    "insufficient disk space on {}: {} bytes free, {} required",
                    self.config.directory.display(),
                    free,
                    required
                ),
            }),
            None => {
                warn!(
                    "Cannot determine free space for {}; continuing",
                    self.config.directory.display()
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MediaSink for LocalSink {
    async fn session_start(&mut self) -> Result<()> {
        const OP: &str = "LocalSink::session_start";
        let root = &self.config.directory;

        fs::create_dir_all(root)
            .await
            .map_err(|e| ExportError::filesystem(OP, "create directory", root, e))?;

        self.check_free_space().await
    }

    async fn writer(&mut self, file: &FileDescriptor) -> Result<Box<dyn SinkWriter>> {
        const OP: &str = "LocalSink::writer";
        let path = partial_path(&self.local_path(file));

        match fs::remove_file(&path).await {
            Ok(()) => info!("Removed stale partial copy {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ExportError::filesystem(OP, "remove stale", path, e)),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ExportError::filesystem(OP, "create directory", parent, e))?;
        }

        let handle = File::create(&path)
            .await
            .map_err(|e| ExportError::filesystem(OP, "create", &path, e))?;

        Ok(Box::new(LocalWriter {
            inner: BufWriter::new(handle),
            path,
        }))
    }

    async fn commit(&mut self, file: &FileDescriptor) -> Result<PathBuf> {
        const OP: &str = "LocalSink::commit";
        let preferred = self.local_path(file);
        let partial = partial_path(&preferred);

        let destination = available_path(preferred.clone()).await;
        if destination != preferred {
            warn!(
                "{} already exists; keeping it and storing {} as {}",
                preferred.display(),
                file.remote_path(),
                destination.display()
            );
        }

        fs::rename(&partial, &destination)
            .await
            .map_err(|e| ExportError::filesystem(OP, "rename", &destination, e))?;
        Ok(destination)
    }

    async fn delete(&mut self, file: &FileDescriptor) -> Result<()> {
        const OP: &str = "LocalSink::delete";
        let path = partial_path(&self.local_path(file));
        fs::remove_file(&path)
            .await
            .map_err(|e| ExportError::filesystem(OP, "remove", path, e))
    }

    fn local_path(&self, file: &FileDescriptor) -> PathBuf {
        file.local_path(&self.config.directory, self.config.preserve_structure)
    }
}

/// Buffered writer for one destination file
pub struct LocalWriter {
    inner: BufWriter<File>,
    path: PathBuf,
}

impl AsyncWrite for LocalWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl SinkWriter for LocalWriter {
    async fn close(&mut self) -> Result<()> {
        const OP: &str = "LocalWriter::close";
        self.inner
            .flush()
            .await
            .map_err(|e| ExportError::filesystem(OP, "flush", &self.path, e))?;
        self.inner
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| ExportError::filesystem(OP, "sync", &self.path, e))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn descriptor(name: &str) -> FileDescriptor {
        let time = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        FileDescriptor::new(name, "100MEDIA", time, 4096)
    }

    fn sink_in(dir: &Path, preserve_structure: bool) -> LocalSink {
        LocalSink::new(StorageConfig {
            directory: dir.to_path_buf(),
            preserve_structure,
            min_free_bytes: 0,
        })
    }

    async fn export(sink: &mut LocalSink, file: &FileDescriptor, content: &[u8]) -> PathBuf {
        let mut writer = sink.writer(file).await.unwrap();
        writer.write_all(content).await.unwrap();
        writer.close().await.unwrap();
        drop(writer);
        sink.commit(file).await.unwrap()
    }

    #[test]
    fn test_partial_path_is_hidden_sibling() {
        assert_eq!(
            partial_path(Path::new("/out/100MEDIA/A.MP4")),
            PathBuf::from("/out/100MEDIA/.A.MP4.part")
        );
    }

    #[tokio::test]
    async fn test_writer_truncates_stale_partial() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = sink_in(temp_dir.path(), false);
        sink.session_start().await.unwrap();

        let file = descriptor("A.MP4");
        let partial = partial_path(&sink.local_path(&file));
        std::fs::write(&partial, vec![0xAAu8; 3000]).unwrap();

        let mut writer = sink.writer(&file).await.unwrap();
        assert_eq!(writer.path(), partial.as_path());
        writer.write_all(b"fresh").await.unwrap();
        writer.close().await.unwrap();
        drop(writer);

        assert_eq!(std::fs::read(&partial).unwrap(), b"fresh");
        assert!(!sink.local_path(&file).exists());
    }

    #[tokio::test]
    async fn test_writer_without_data_leaves_empty_partial() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = sink_in(temp_dir.path(), false);

        let file = descriptor("A.MP4");
        std::fs::write(partial_path(&sink.local_path(&file)), b"stale partial").unwrap();

        let mut writer = sink.writer(&file).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(std::fs::metadata(writer.path()).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_commit_moves_partial_into_place() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = sink_in(temp_dir.path(), false);
        let file = descriptor("A.MP4");

        let landed = export(&mut sink, &file, b"clip").await;

        assert_eq!(landed, temp_dir.path().join("A.MP4"));
        assert_eq!(std::fs::read(&landed).unwrap(), b"clip");
        assert!(!partial_path(&landed).exists());
    }

    #[tokio::test]
    async fn test_commit_never_replaces_an_existing_copy() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = sink_in(temp_dir.path(), false);

        let first = FileDescriptor::new("A.MP4", "100MEDIA", descriptor("A.MP4").modified_time, 4);
        let second = FileDescriptor::new("A.MP4", "101MEDIA", descriptor("A.MP4").modified_time, 2);
        let third = FileDescriptor::new("A.MP4", "102MEDIA", descriptor("A.MP4").modified_time, 1);

        let a = export(&mut sink, &first, &[1u8; 4]).await;
        let b = export(&mut sink, &second, &[2u8; 2]).await;
        let c = export(&mut sink, &third, &[3u8; 1]).await;

        assert_eq!(a, temp_dir.path().join("A.MP4"));
        assert_eq!(b, temp_dir.path().join("A (1).MP4"));
        assert_eq!(c, temp_dir.path().join("A (2).MP4"));
        assert_eq!(std::fs::read(&a).unwrap(), vec![1u8; 4]);
        assert_eq!(std::fs::read(&b).unwrap(), vec![2u8; 2]);
    }

    #[tokio::test]
    async fn test_available_path_keeps_all_extensions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.tar.gz");
        assert_eq!(available_path(path.clone()).await, path);

        std::fs::write(&path, b"x").unwrap();
        assert_eq!(available_path(path).await, temp_dir.path().join("clip (1).tar.gz"));
    }

    #[tokio::test]
    async fn test_preserve_structure_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = sink_in(temp_dir.path(), true);

        let file = descriptor("A.MP4");
        let landed = export(&mut sink, &file, &[1, 2, 3]).await;

        assert_eq!(landed, temp_dir.path().join("100MEDIA").join("A.MP4"));
        assert!(landed.exists());
    }

    #[tokio::test]
    async fn test_delete_removes_partial_and_reports_missing() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = sink_in(temp_dir.path(), false);
        let file = descriptor("A.MP4");

        let mut writer = sink.writer(&file).await.unwrap();
        writer.close().await.unwrap();
        let partial = writer.path().to_path_buf();
        drop(writer);

        sink.delete(&file).await.unwrap();
        assert!(!partial.exists());

        let err = sink.delete(&file).await.unwrap_err();
        assert!(err.is_filesystem());
    }

    #[tokio::test]
    async fn test_delete_leaves_committed_copy_alone() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = sink_in(temp_dir.path(), false);
        let file = descriptor("A.MP4");

        let landed = export(&mut sink, &file, b"kept").await;
        assert!(sink.delete(&file).await.is_err());
        assert_eq!(std::fs::read(landed).unwrap(), b"kept");
    }

    #[tokio::test]
    async fn test_session_start_creates_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("nested").join("exports");
        let mut sink = sink_in(&root, false);
        sink.session_start().await.unwrap();
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_session_start_checks_free_space() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = LocalSink::new(StorageConfig {
            directory: temp_dir.path().to_path_buf(),
            preserve_structure: false,
            min_free_bytes: u64::MAX,
        });

        let result = sink.session_start().await;
        if available_space(temp_dir.path()).is_some() {
            let err = result.unwrap_err();
            assert!(matches!(err, ExportError::Precondition { .. }));
        } else {
            assert!(result.is_ok());
        }
    }
}
