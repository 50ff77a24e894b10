//! Loopback camera speaking the real device protocols
//!
//! `MockCamera` runs three TCP servers on 127.0.0.1:
//!
//! - control: newline-terminated JSON requests, unframed JSON replies with
//!   interleaved notifications, token handed out on msg_id 257
//! - shell: banner, login prompt, records every line; the `tcpsvd` command
//!   binds the FTP daemon on a port reserved at start-up
//! - ftp: passive-mode subset (USER/PASS/TYPE/PASV/NLST/LIST/RETR/DELE/QUIT)
//!
//! Used by the protocol tests and by `cam-export simulate`.

use crate::core::config::Config;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime};
use log::{debug, trace, warn};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Token the mock control server hands out
pub const MOCK_SESSION_TOKEN: i64 = 3;

/// How long the FTP server waits for a passive data connection
const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Files
// =============================================================================

/// One file on the mock camera's card
#[derive(Debug, Clone)]
pub struct MockFile {
    pub directory: String,
    pub name: String,
    pub content: Vec<u8>,
    /// Size reported by `LIST`; differs from the content for stale entries
    pub declared_size: u64,
    /// Abort `RETR` with `426` after this many bytes
    pub fail_after: Option<usize>,
    pub modified: NaiveDateTime,
}

impl MockFile {
    pub fn new(directory: &str, name: &str, content: Vec<u8>) -> Self {
        let modified = NaiveDate::from_ymd_opt(2024, 1, 15)
            .and_then(|d| d.and_hms_opt(10, 30, 0))
            .unwrap_or(NaiveDateTime::MIN);
        Self {
            directory: directory.to_string(),
            name: name.to_string(),
            declared_size: content.len() as u64,
            content,
            fail_after: None,
            modified,
        }
    }

    /// Report `declared_size` while serving only the content
    pub fn stale(mut self, declared_size: u64) -> Self {
        self.declared_size = declared_size;
        self
    }

    pub fn fail_after(mut self, bytes: usize) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.directory, self.name)
    }

    fn list_line(&self, now: NaiveDateTime) -> String {
        let when = if self.modified.year() == now.year() && self.modified <= now {
            self.modified.format("%b %e %H:%M").to_string()
        } else {
            self.modified.format("%b %e  %Y").to_string()
        };
        format!(
            "-rw-r--r--    1 root     root     {:>10} {} {}",
            self.declared_size, when, self.name
        )
    }
}

// =============================================================================
// Control server
// =============================================================================

/// Fault injection for the control server
#[derive(Debug, Clone, Default)]
pub struct MockControlBehavior {
    /// Notifications sent ahead of each start-session reply
    pub notifications_before_reply: usize,
    /// Answer start-session with a negative rval
    pub reject_start: bool,
    /// Drop the connection when stop-session arrives
    pub drop_on_stop: bool,
    /// Never answer stop-session
    pub hang_on_stop: bool,
}

#[derive(Debug, Deserialize)]
struct MockRequest {
    msg_id: u32,
    #[serde(default)]
    token: i64,
}

/// Control-channel server
#[derive(Debug, Clone)]
pub struct MockControlServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<(u32, i64)>>>,
}

impl MockControlServer {
    /// Start on an ephemeral port; panics if loopback cannot be bound
    pub async fn start(behavior: MockControlBehavior) -> Self {
        Self::try_start(behavior)
            .await
            .expect("bind mock control server")
    }

    pub async fn try_start(behavior: MockControlBehavior) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Self {
            addr: listener.local_addr()?,
            received: Arc::new(Mutex::new(Vec::new())),
        };

        let received = Arc::clone(&server.received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let received = Arc::clone(&received);
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_control(stream, behavior, received).await {
                        trace!("mock control connection ended: {}", e);
                    }
                });
            }
        });

        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn token(&self) -> i64 {
        MOCK_SESSION_TOKEN
    }

    /// `(msg_id, token)` of every request, in arrival order
    pub fn received(&self) -> Vec<(u32, i64)> {
        lock(&self.received).clone()
    }
}

async fn serve_control(
    stream: TcpStream,
    behavior: MockControlBehavior,
    received: Arc<Mutex<Vec<(u32, i64)>>>,
) -> io::Result<()> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let request: MockRequest = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                warn!("mock control: bad request {:?}: {}", line, e);
                continue;
            }
        };
        lock(&received).push((request.msg_id, request.token));

        let reply = match request.msg_id {
            257 => {
                for _ in 0..behavior.notifications_before_reply {
                    stream
                        .get_mut()
                        .write_all(br#"{"msg_id":7,"type":"battery","param":"adapter"}"#)
                        .await?;
                }
                if behavior.reject_start {
                    r#"{"rval":-3,"msg_id":257}"#.to_string()
                } else {
                    format!(r#"{{"rval":0,"msg_id":257,"param":{}}}"#, MOCK_SESSION_TOKEN)
                }
            }
            258 => {
                if behavior.drop_on_stop {
                    return Ok(());
                }
                if behavior.hang_on_stop {
                    std::future::pending::<()>().await;
                }
                r#"{"rval":0,"msg_id":258}"#.to_string()
            }
            other => format!(r#"{{"rval":-9,"msg_id":{}}}"#, other),
        };
        stream.get_mut().write_all(reply.as_bytes()).await?;
    }
}

// =============================================================================
// Camera
// =============================================================================

/// Fault injection for the whole camera
#[derive(Debug, Clone, Default)]
pub struct MockCameraBehavior {
    pub control: MockControlBehavior,
    /// Record the daemon command but never start the daemon
    pub ignore_daemon_command: bool,
    /// Answer `PASS` with `530`
    pub reject_ftp_login: bool,
}

#[derive(Debug, Default)]
struct CameraState {
    files: Vec<MockFile>,
    shell_lines: Vec<String>,
    daemon_launches: usize,
    daemon_running: bool,
    ftp_logins: usize,
    ftp_quits: usize,
}

#[derive(Debug)]
struct CameraShared {
    state: Mutex<CameraState>,
    behavior: MockCameraBehavior,
    ftp_port: u16,
}

/// Loopback camera
#[derive(Debug, Clone)]
pub struct MockCamera {
    control: MockControlServer,
    shell_port: u16,
    shared: Arc<CameraShared>,
}

impl MockCamera {
    /// Start all servers; panics if loopback cannot be bound
    pub async fn start(files: Vec<MockFile>, behavior: MockCameraBehavior) -> Self {
        Self::try_start(files, behavior)
            .await
            .expect("bind mock camera")
    }

    pub async fn try_start(files: Vec<MockFile>, behavior: MockCameraBehavior) -> io::Result<Self> {
        let control = MockControlServer::try_start(behavior.control.clone()).await?;

        // The daemon port must be known before the daemon runs; reserve one
        let ftp_port = {
            let reserved = TcpListener::bind("127.0.0.1:0").await?;
            reserved.local_addr()?.port()
        };

        let shared = Arc::new(CameraShared {
            state: Mutex::new(CameraState {
                files,
                ..Default::default()
            }),
            behavior,
            ftp_port,
        });

        let shell = TcpListener::bind("127.0.0.1:0").await?;
        let shell_port = shell.local_addr()?.port();
        let shell_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = shell.accept().await {
                let shared = Arc::clone(&shell_shared);
                tokio::spawn(async move {
                    if let Err(e) = serve_shell(stream, shared).await {
                        trace!("mock shell connection ended: {}", e);
                    }
                });
            }
        });

        debug!(
            "Mock camera up: control {}, shell {}, ftp {}",
            control.port(),
            shell_port,
            ftp_port
        );

        Ok(Self {
            control,
            shell_port,
            shared,
        })
    }

    /// Configuration pointing every channel at this camera
    pub fn config(&self, storage_dir: impl AsRef<Path>) -> Config {
        let mut config = Config::default();
        config.set_camera_host("127.0.0.1");

        config.control.port = self.control.port();
        config.control.connect_timeout_secs = 2;
        config.control.io_timeout_secs = 5;

        config.shell.port = self.shell_port;
        config.shell.connect_timeout_secs = 2;
        config.shell.banner_timeout_ms = 100;
        config.shell.login_delay_ms = 50;
        config.shell.readiness_timeout_secs = 5;

        config.ftp.port = self.shared.ftp_port;
        config.ftp.connect_timeout_secs = 2;
        config.ftp.io_timeout_secs = 5;

        config.storage.directory = storage_dir.as_ref().to_path_buf();
        config.storage.min_free_bytes = 0;

        config.export.survey_interval_secs = 1;
        config.export.idle_interval_secs = 1;
        config.export.teardown_timeout_secs = 2;
        config
    }

    /// Bind the FTP daemon as if the shell command had been run
    pub async fn launch_daemon(&self) {
        start_daemon(Arc::clone(&self.shared)).await;
    }

    pub fn daemon_running(&self) -> bool {
        lock(&self.shared.state).daemon_running
    }

    pub fn daemon_launches(&self) -> usize {
        lock(&self.shared.state).daemon_launches
    }

    pub fn shell_lines(&self) -> Vec<String> {
        lock(&self.shared.state).shell_lines.clone()
    }

    pub fn control_log(&self) -> Vec<(u32, i64)> {
        self.control.received()
    }

    pub fn ftp_logins(&self) -> usize {
        lock(&self.shared.state).ftp_logins
    }

    pub fn ftp_quits(&self) -> usize {
        lock(&self.shared.state).ftp_quits
    }

    pub fn has_file(&self, remote_path: &str) -> bool {
        lock(&self.shared.state)
            .files
            .iter()
            .any(|f| f.remote_path() == remote_path)
    }

    pub fn remaining_files(&self) -> Vec<String> {
        lock(&self.shared.state)
            .files
            .iter()
            .map(MockFile::remote_path)
            .collect()
    }
}

// =============================================================================
// Shell
// =============================================================================

async fn serve_shell(stream: TcpStream, shared: Arc<CameraShared>) -> io::Result<()> {
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(b"\r\nBusyBox v1.20.2 built-in shell (ash)\r\na12 login: ")
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end_matches(['\r', '\n']).to_string();
        lock(&shared.state).shell_lines.push(command.clone());

        if command.starts_with("tcpsvd ") {
            lock(&shared.state).daemon_launches += 1;
            if !shared.behavior.ignore_daemon_command {
                start_daemon(Arc::clone(&shared)).await;
            }
            // Foreground daemon: the shell prints nothing more
            continue;
        }
        stream.get_mut().write_all(b"\r\n# ").await?;
    }
}

async fn start_daemon(shared: Arc<CameraShared>) {
    {
        let mut state = lock(&shared.state);
        if state.daemon_running {
            return;
        }
        state.daemon_running = true;
    }

    let listener = match TcpListener::bind(("127.0.0.1", shared.ftp_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("mock ftpd: bind port {} failed: {}", shared.ftp_port, e);
            lock(&shared.state).daemon_running = false;
            return;
        }
    };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Err(e) = serve_ftp(stream, shared).await {
                    trace!("mock ftp connection ended: {}", e);
                }
            });
        }
    });
}

// =============================================================================
// FTP
// =============================================================================

async fn reply(stream: &mut BufReader<TcpStream>, text: &str) -> io::Result<()> {
    stream
        .get_mut()
        .write_all(format!("{}\r\n", text).as_bytes())
        .await
}

async fn accept_data(listener: Option<TcpListener>) -> io::Result<TcpStream> {
    let listener = listener.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no PASV"))?;
    match timeout(DATA_ACCEPT_TIMEOUT, listener.accept()).await {
        Ok(result) => result.map(|(stream, _)| stream),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "data accept timed out")),
    }
}

async fn serve_ftp(stream: TcpStream, shared: Arc<CameraShared>) -> io::Result<()> {
    let mut stream = BufReader::new(stream);
    reply(&mut stream, "220 Operation successful").await?;

    let mut passive: Option<TcpListener> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match trimmed.split_once(' ') {
            Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.to_string()),
            None => (trimmed.to_ascii_uppercase(), String::new()),
        };

        match verb.as_str() {
            "USER" => reply(&mut stream, "331 Please specify password").await?,
            "PASS" => {
                if shared.behavior.reject_ftp_login {
                    reply(&mut stream, "530 Login incorrect").await?;
                } else {
                    lock(&shared.state).ftp_logins += 1;
                    reply(&mut stream, "230 Operation successful").await?;
                }
            }
            "TYPE" => reply(&mut stream, "200 Operation successful").await?,
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                passive = Some(listener);
                reply(
                    &mut stream,
                    &format!("227 PASV ok (127,0,0,1,{},{})", port / 256, port % 256),
                )
                .await?;
            }
            "NLST" => {
                let directories: BTreeSet<String> = lock(&shared.state)
                    .files
                    .iter()
                    .map(|f| f.directory.clone())
                    .collect();
                reply(&mut stream, "150 Directory listing").await?;
                let mut data = accept_data(passive.take()).await?;
                for dir in directories {
                    data.write_all(format!("{}\r\n", dir).as_bytes()).await?;
                }
                drop(data);
                reply(&mut stream, "226 Operation successful").await?;
            }
            "LIST" => {
                let now = Local::now().naive_local();
                let mut lines = vec![
                    "total 0".to_string(),
                    "drwxr-xr-x    2 root     root            0 Jan  1  2024 .".to_string(),
                ];
                lines.extend(
                    lock(&shared.state)
                        .files
                        .iter()
                        .filter(|f| f.directory == arg)
                        .map(|f| f.list_line(now)),
                );
                reply(&mut stream, "150 Directory listing").await?;
                let mut data = accept_data(passive.take()).await?;
                for l in lines {
                    data.write_all(format!("{}\r\n", l).as_bytes()).await?;
                }
                drop(data);
                reply(&mut stream, "226 Operation successful").await?;
            }
            "RETR" => {
                let file = lock(&shared.state)
                    .files
                    .iter()
                    .find(|f| f.remote_path() == arg)
                    .cloned();
                // The passive listener stays up, as with busybox ftpd
                let Some(file) = file else {
                    reply(&mut stream, "550 Failed to open file").await?;
                    continue;
                };

                reply(&mut stream, "150 Opening BINARY connection").await?;
                let mut data = accept_data(passive.take()).await?;
                let served = file
                    .fail_after
                    .map_or(file.content.len(), |n| n.min(file.content.len()));
                // A client that stops reading early resets the data connection
                let sent = match data.write_all(&file.content[..served]).await {
                    Ok(()) => data.shutdown().await,
                    Err(e) => Err(e),
                };
                drop(data);

                if file.fail_after.is_some() || sent.is_err() {
                    reply(&mut stream, "426 Connection closed; transfer aborted").await?;
                } else {
                    reply(&mut stream, "226 Operation successful").await?;
                }
            }
            "DELE" => {
                let removed = {
                    let mut state = lock(&shared.state);
                    let before = state.files.len();
                    state.files.retain(|f| f.remote_path() != arg);
                    state.files.len() != before
                };
                if removed {
                    reply(&mut stream, "250 Operation successful").await?;
                } else {
                    reply(&mut stream, "550 Operation failed").await?;
                }
            }
            "QUIT" => {
                lock(&shared.state).ftp_quits += 1;
                reply(&mut stream, "221 Goodbye").await?;
                return Ok(());
            }
            _ => reply(&mut stream, "502 Command not implemented").await?,
        }
    }
}
