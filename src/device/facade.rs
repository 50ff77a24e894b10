//! The camera as one [`MediaSource`]
//!
//! `session_start` brings the three channels up in a fixed order: the
//! control session unlocks the shell, the shell launches the FTP daemon, and
//! only then can the file channel log in. The first failure ends the start;
//! channels that did come up are torn down by `session_end` as usual.

use crate::core::config::Config;
use crate::core::error::{ExportError, OpContext, Result};
use crate::device::bootstrap::BootstrapChannel;
use crate::device::control::ControlSession;
use crate::device::file_channel::FileChannel;
use crate::device::traits::{FileDescriptor, FileStream, MediaSource, SourceReader};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Camera session made of the control, shell and file channels
///
/// Every `session_start` builds fresh channel instances; a closed channel is
/// never reused.
#[derive(Debug)]
pub struct DeviceFacade {
    config: Config,
    control: Option<ControlSession>,
    bootstrap: Option<BootstrapChannel>,
    files: Option<FileChannel>,
}

impl DeviceFacade {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            control: None,
            bootstrap: None,
            files: None,
        }
    }

    fn teardown_timeout(&self) -> Duration {
        self.config.export.teardown_timeout()
    }

    fn file_channel(&mut self, op: &'static str) -> Result<&mut FileChannel> {
        self.files.as_mut().ok_or(ExportError::NotOpen { op })
    }
}

#[async_trait]
impl MediaSource for DeviceFacade {
    async fn session_start(&mut self, cancel: CancellationToken) -> Result<()> {
        const OP: &str = "DeviceFacade::session_start";

        let control = self
            .control
            .insert(ControlSession::new(self.config.control.clone()));
        control
            .start(cancel.clone())
            .await
            .op_context(OP, "control session start")?;

        let bootstrap = self.bootstrap.insert(BootstrapChannel::new(
            self.config.shell.clone(),
            self.config.ftp.clone(),
        ));
        bootstrap
            .start(cancel.clone())
            .await
            .op_context(OP, "shell daemon launch")?;

        let files = self.files.insert(FileChannel::new(self.config.ftp.clone()));
        files
            .login(cancel)
            .await
            .op_context(OP, "file-transfer login")?;

        debug!("Device session established");
        Ok(())
    }

    async fn files(&mut self, cancel: CancellationToken) -> Result<Box<dyn FileStream>> {
        const OP: &str = "DeviceFacade::files";
        let listing = self
            .file_channel(OP)?
            .list_files(cancel)
            .await
            .op_context(OP, "file-transfer listing")?;
        Ok(Box::new(listing))
    }

    async fn reader(&mut self, file: &FileDescriptor) -> Result<Box<dyn SourceReader>> {
        const OP: &str = "DeviceFacade::reader";
        let reader = self
            .file_channel(OP)?
            .open_reader(file)
            .await
            .op_context(OP, format!("file-transfer reader {}", file.remote_path()))?;
        Ok(Box::new(reader))
    }

    async fn delete(&mut self, file: &FileDescriptor) -> Result<()> {
        const OP: &str = "DeviceFacade::delete";
        self.file_channel(OP)?
            .delete(file)
            .await
            .op_context(OP, "file-transfer delete")
    }

    /// Wait for all channels' teardown concurrently, each with its own bound
    async fn session_end(&mut self) {
        let limit = self.teardown_timeout();
        let mut control = self.control.take();
        let mut bootstrap = self.bootstrap.take();
        let mut files = self.files.take();

        tokio::join!(
            async {
                if let Some(channel) = control.as_mut() {
                    channel.close(limit).await;
                }
            },
            async {
                if let Some(channel) = bootstrap.as_mut() {
                    channel.close(limit).await;
                }
            },
            async {
                if let Some(channel) = files.as_mut() {
                    channel.close(limit).await;
                }
            },
        );
        debug!("Device session closed");
    }
}
