//! Bootstrap channel: launches the camera's file-transfer daemon
//!
//! The camera exposes a root shell on its telnet port. One login line and
//! one command line start `tcpsvd`/`ftpd` in the foreground of that shell,
//! so the shell socket is kept open until the session ends. Nothing on the
//! wire acknowledges the launch; readiness is established by probing the
//! daemon's port instead.

use crate::core::config::{FtpConfig, ShellConfig};
use crate::core::error::{ExportError, OpContext, Result};
use crate::device::net::{self, Teardown};
use crate::device::traits::ConnectionState;
use log::{debug, info, trace};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Hard cap on how long banner/echo draining may run
const DRAIN_CAP_FACTOR: u32 = 4;

/// Shell command that starts the file-transfer daemon
pub fn daemon_command(ftp_user: &str, ftp_port: u16, root_dir: &str) -> String {
    format!(
        "tcpsvd -u {} -vE 0.0.0.0 {} ftpd -w {} 1>/dev/null 2>&1",
        ftp_user, ftp_port, root_dir
    )
}

/// Read whatever the shell prints until it stays quiet for `quiet`
///
/// Returns the bytes read. The camera's shell never says when it is done
/// talking, so silence is the only end marker.
async fn drain(stream: &mut TcpStream, quiet: Duration) -> Result<Vec<u8>> {
    const OP: &str = "BootstrapChannel::drain";
    let deadline = Instant::now() + quiet * DRAIN_CAP_FACTOR;
    let mut out = Vec::new();
    let mut chunk = [0u8; 512];

    while Instant::now() < deadline {
        match timeout(quiet, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                return Err(ExportError::connection(
                    OP,
                    "read",
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "shell closed the connection",
                    ),
                ))
            }
            Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(ExportError::connection(OP, "read", e)),
            Err(_) => break,
        }
    }
    Ok(out)
}

async fn send_line(stream: &mut TcpStream, line: &str, what: &str) -> Result<()> {
    stream
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .map_err(|e| ExportError::connection("BootstrapChannel::send_line", format!("send {}", what), e))
}

/// Shell channel that starts the file-transfer daemon once per session
#[derive(Debug)]
pub struct BootstrapChannel {
    shell: ShellConfig,
    ftp: FtpConfig,
    state: ConnectionState,
    teardown: Option<Teardown>,
}

impl BootstrapChannel {
    pub fn new(shell: ShellConfig, ftp: FtpConfig) -> Self {
        Self {
            shell,
            ftp,
            state: ConnectionState::Unopened,
            teardown: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn command(&self) -> String {
        daemon_command(&self.ftp.user, self.ftp.port, &self.ftp.root_dir)
    }

    /// Log in, launch the daemon and wait until it accepts connections
    ///
    /// Calling `start` on an already open channel does nothing.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        const OP: &str = "BootstrapChannel::start";

        match self.state {
            ConnectionState::Open => {
                debug!("Shell channel already open; daemon launch skipped");
                return Ok(());
            }
            ConnectionState::Closed => return Err(ExportError::NotOpen { op: OP }),
            ConnectionState::Unopened => {}
        }

        let peer = format!("{}:{}", self.shell.host, self.shell.port);
        let mut stream = net::dial(OP, &self.shell.host, self.shell.port, self.shell.connect_timeout())
            .await
            .op_context(OP, "configure connection")?;

        info!("Shell channel connected to {}", peer);

        let launched = tokio::select! {
            result = self.launch(&mut stream) => result,
            _ = cancel.cancelled() => Err(ExportError::protocol(OP, "cancelled during daemon launch")),
        };

        if let Err(e) = launched {
            let _ = stream.shutdown().await;
            self.state = ConnectionState::Closed;
            return Err(e);
        }

        info!(
            "File-transfer daemon running on {}:{}",
            self.ftp.host, self.ftp.port
        );
        self.state = ConnectionState::Open;

        let handle = tokio::spawn(async move {
            cancel.cancelled().await;
            match stream.shutdown().await {
                Ok(()) => info!("Shell channel to {} closed", peer),
                Err(e) => debug!("Shell channel to {} closed uncleanly: {}", peer, e),
            }
        });
        self.teardown = Some(Teardown::new("shell", handle));

        Ok(())
    }

    async fn launch(&self, stream: &mut TcpStream) -> Result<()> {
        const OP: &str = "BootstrapChannel::launch";

        let banner = drain(stream, self.shell.banner_timeout())
            .await
            .op_context(OP, "read banner")?;
        trace!("shell banner: {:?}", String::from_utf8_lossy(&banner));

        sleep(self.shell.login_delay()).await;
        send_line(stream, &self.shell.user, "user line")
            .await
            .op_context(OP, "login")?;
        let echo = drain(stream, self.shell.banner_timeout())
            .await
            .op_context(OP, "login")?;
        trace!("shell login echo: {:?}", String::from_utf8_lossy(&echo));

        let command = self.command();
        debug!("Launching daemon: {}", command);
        send_line(stream, &command, "daemon command")
            .await
            .op_context(OP, "start daemon")?;

        let attempts = net::wait_until_accepting(OP, &self.ftp.host, self.ftp.port, self.shell.readiness_timeout())
            .await
            .op_context(OP, "daemon readiness")?;
        debug!("Daemon accepted after {} attempt(s)", attempts);
        Ok(())
    }

    /// Wait for the teardown task (bounded) and mark the channel closed
    pub async fn close(&mut self, limit: Duration) {
        if let Some(teardown) = self.teardown.take() {
            teardown.wait(limit).await;
        }
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdb::mock_camera::{MockCamera, MockCameraBehavior};

    #[test]
    fn test_daemon_command_format() {
        assert_eq!(
            daemon_command("root", 21, "/tmp/SD0/DCIM"),
            "tcpsvd -u root -vE 0.0.0.0 21 ftpd -w /tmp/SD0/DCIM 1>/dev/null 2>&1"
        );
    }

    #[tokio::test]
    async fn test_start_launches_daemon() {
        let camera = MockCamera::start(Vec::new(), MockCameraBehavior::default()).await;
        let config = camera.config("unused");
        let cancel = CancellationToken::new();

        let mut channel = BootstrapChannel::new(config.shell.clone(), config.ftp.clone());
        channel.start(cancel.clone()).await.unwrap();
        assert!(channel.state().is_open());
        assert!(camera.daemon_running());

        let lines = camera.shell_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "root");
        assert_eq!(lines[1], channel.command());

        cancel.cancel();
        channel.close(Duration::from_secs(2)).await;
        assert!(channel.state().is_closed());
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let camera = MockCamera::start(Vec::new(), MockCameraBehavior::default()).await;
        let config = camera.config("unused");
        let cancel = CancellationToken::new();

        let mut channel = BootstrapChannel::new(config.shell.clone(), config.ftp.clone());
        channel.start(cancel.clone()).await.unwrap();
        let before = camera.shell_lines().len();

        channel.start(cancel.clone()).await.unwrap();
        assert_eq!(camera.shell_lines().len(), before);
        assert_eq!(camera.daemon_launches(), 1);

        cancel.cancel();
        channel.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_daemon_never_ready_times_out() {
        let camera = MockCamera::start(
            Vec::new(),
            MockCameraBehavior {
                ignore_daemon_command: true,
                ..Default::default()
            },
        )
        .await;
        let mut config = camera.config("unused");
        config.shell.readiness_timeout_secs = 1;

        let mut channel = BootstrapChannel::new(config.shell.clone(), config.ftp.clone());
        let err = channel.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.root(), ExportError::Timeout { .. }));
        assert!(err.chain().contains("daemon readiness"));
        assert!(channel.state().is_closed());
    }

    #[tokio::test]
    async fn test_cancel_during_launch_aborts() {
        let camera = MockCamera::start(Vec::new(), MockCameraBehavior::default()).await;
        let mut config = camera.config("unused");
        config.shell.login_delay_ms = 5_000;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let mut channel = BootstrapChannel::new(config.shell.clone(), config.ftp.clone());
        let started = std::time::Instant::now();
        assert!(channel.start(cancel).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(camera.shell_lines().is_empty());
    }
}
