//! FTP client for the camera's daemon
//!
//! The protocol work is done by `suppaftp`'s blocking `FtpStream`. Each
//! connection gets one worker thread that owns the stream for its whole
//! life; the async side sends it requests over a channel and awaits the
//! answers. Downloads come back as chunks on a bounded channel, so a slow
//! local disk pauses the transfer instead of buffering it.
//!
//! Replies on the control connection are bounded by the I/O timeout (socket
//! read/write timeouts). Data connections have no timeout.

use crate::core::error::{ExportError, Result};
use log::{debug, trace};
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Bytes per download chunk
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the worker and the reader
const CHUNKS_IN_FLIGHT: usize = 4;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Work for the connection's worker thread
enum Request {
    Login {
        user: String,
        password: String,
        reply: Reply<()>,
    },
    Nlst {
        reply: Reply<Vec<String>>,
    },
    List {
        path: String,
        reply: Reply<Vec<String>>,
    },
    Retr {
        path: String,
        started: Reply<()>,
        chunks: mpsc::Sender<io::Result<Vec<u8>>>,
        finished: Reply<()>,
    },
    Dele {
        path: String,
        reply: Reply<()>,
    },
    Quit {
        reply: Reply<()>,
    },
}

/// Map a library error onto the export error kinds
///
/// Socket timeouts surface as `WouldBlock`/`TimedOut` I/O errors.
pub fn classify(op: &'static str, action: impl Into<String>, io_timeout: Duration, err: FtpError) -> ExportError {
    match err {
        FtpError::ConnectionError(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            ExportError::timeout(op, action, io_timeout)
        }
        FtpError::ConnectionError(e) => ExportError::connection(op, action, e),
        other => ExportError::protocol(op, format!("{}: {}", action.into(), other)),
    }
}

fn worker_gone(op: &'static str, action: impl Into<String>) -> ExportError {
    ExportError::connection(
        op,
        action,
        io::Error::new(io::ErrorKind::BrokenPipe, "file-transfer worker stopped"),
    )
}

fn open_stream(addr: SocketAddr, connect_timeout: Duration, io_timeout: Duration) -> std::result::Result<FtpStream, FtpError> {
    let stream = FtpStream::connect_timeout(addr, connect_timeout)?;
    stream
        .get_ref()
        .set_read_timeout(Some(io_timeout))
        .map_err(FtpError::ConnectionError)?;
    stream
        .get_ref()
        .set_write_timeout(Some(io_timeout))
        .map_err(FtpError::ConnectionError)?;
    Ok(stream)
}

/// Body of the worker thread: serve requests until every sender is gone
fn serve(mut ftp: FtpStream, mut requests: mpsc::Receiver<Request>, peer: String, io_timeout: Duration) {
    const OP: &str = "FtpConnection";

    while let Some(request) = requests.blocking_recv() {
        match request {
            Request::Login { user, password, reply } => {
                let result = ftp
                    .login(user.as_str(), password.as_str())
                    .and_then(|_| ftp.transfer_type(FileType::Binary))
                    .map_err(|e| classify(OP, format!("login as {}", user), io_timeout, e));
                let _ = reply.send(result);
            }
            Request::Nlst { reply } => {
                let result = ftp
                    .nlst(None)
                    .map_err(|e| classify(OP, "name list", io_timeout, e));
                let _ = reply.send(result);
            }
            Request::List { path, reply } => {
                let result = ftp
                    .list(Some(path.as_str()))
                    .map_err(|e| classify(OP, format!("list {}", path), io_timeout, e));
                let _ = reply.send(result);
            }
            Request::Retr {
                path,
                started,
                chunks,
                finished,
            } => {
                let mut data = match ftp.retr_as_stream(path.as_str()) {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = started.send(Err(classify(OP, format!("retrieve {}", path), io_timeout, e)));
                        continue;
                    }
                };
                let _ = started.send(Ok(()));

                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    match data.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // Reader gone: stop pulling and let the server settle the transfer
                            if chunks.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let _ = chunks.blocking_send(Err(e));
                            break;
                        }
                    }
                }
                drop(chunks);

                let result = ftp
                    .finalize_retr_stream(data)
                    .map_err(|e| classify(OP, format!("finish transfer {}", path), io_timeout, e));
                let _ = finished.send(result);
            }
            Request::Dele { path, reply } => {
                let result = ftp
                    .rm(path.as_str())
                    .map_err(|e| classify(OP, format!("delete {}", path), io_timeout, e));
                let _ = reply.send(result);
            }
            Request::Quit { reply } => {
                let result = ftp.quit().map_err(|e| classify(OP, "quit", io_timeout, e));
                let _ = reply.send(result);
                break;
            }
        }
    }

    trace!("File-transfer worker for {} stopped", peer);
}

/// One FTP control connection and its worker thread
pub struct FtpConnection {
    requests: mpsc::Sender<Request>,
    peer: String,
}

impl fmt::Debug for FtpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConnection").field("peer", &self.peer).finish()
    }
}

impl FtpConnection {
    /// Resolve, connect and read the greeting
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration, io_timeout: Duration) -> Result<Self> {
        const OP: &str = "FtpConnection::connect";
        let peer = format!("{}:{}", host, port);

        let addr = match timeout(connect_timeout, tokio::net::lookup_host((host, port))).await {
            Ok(Ok(mut addrs)) => addrs.next().ok_or_else(|| {
                ExportError::connection(
                    OP,
                    format!("resolve {}", peer),
                    io::Error::new(io::ErrorKind::NotFound, "no address"),
                )
            })?,
            Ok(Err(e)) => return Err(ExportError::connection(OP, format!("resolve {}", peer), e)),
            Err(_) => return Err(ExportError::timeout(OP, format!("resolve {}", peer), connect_timeout)),
        };

        let (requests, inbox) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker_peer = peer.clone();
        std::thread::Builder::new()
            .name(format!("ftp-{}", peer))
            .spawn(move || match open_stream(addr, connect_timeout, io_timeout) {
                Ok(ftp) => {
                    let _ = ready_tx.send(Ok(()));
                    serve(ftp, inbox, worker_peer, io_timeout);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(classify(OP, format!("dial {}", worker_peer), io_timeout, e)));
                }
            })
            .map_err(|e| ExportError::connection(OP, "start file-transfer worker", e))?;

        // Connect plus greeting
        let limit = connect_timeout + io_timeout;
        match timeout(limit, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!("File-transfer connection to {} established", peer);
                Ok(Self { requests, peer })
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(worker_gone(OP, format!("dial {}", peer))),
            Err(_) => Err(ExportError::timeout(OP, format!("dial {}", peer), limit)),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn call<T>(&self, op: &'static str, action: &str, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| worker_gone(op, action))?;
        answer.await.map_err(|_| worker_gone(op, action))?
    }

    /// `USER`/`PASS`, then binary mode
    pub async fn login(&self, user: &str, password: &str) -> Result<()> {
        self.call("FtpConnection::login", "login", |reply| Request::Login {
            user: user.to_string(),
            password: password.to_string(),
            reply,
        })
        .await
    }

    /// Names in the daemon's working directory
    pub async fn nlst(&self) -> Result<Vec<String>> {
        self.call("FtpConnection::nlst", "name list", |reply| Request::Nlst { reply })
            .await
    }

    /// Raw `LIST` lines for `path`
    pub async fn list(&self, path: &str) -> Result<Vec<String>> {
        self.call("FtpConnection::list", "list", |reply| Request::List {
            path: path.to_string(),
            reply,
        })
        .await
    }

    /// Start a download; fails here if the server refuses `RETR`
    pub async fn retr(&self, path: &str) -> Result<FtpDownload> {
        const OP: &str = "FtpConnection::retr";

        let (started, started_rx) = oneshot::channel();
        let (finished, finished_rx) = oneshot::channel();
        let (chunks, chunks_rx) = mpsc::channel(CHUNKS_IN_FLIGHT);

        self.requests
            .send(Request::Retr {
                path: path.to_string(),
                started,
                chunks,
                finished,
            })
            .await
            .map_err(|_| worker_gone(OP, "retrieve"))?;
        started_rx.await.map_err(|_| worker_gone(OP, "retrieve"))??;

        Ok(FtpDownload {
            chunks: chunks_rx,
            current: Vec::new(),
            offset: 0,
            finished: Some(finished_rx),
        })
    }

    pub async fn dele(&self, path: &str) -> Result<()> {
        self.call("FtpConnection::dele", "delete", |reply| Request::Dele {
            path: path.to_string(),
            reply,
        })
        .await
    }

    /// Log out; the worker exits afterwards
    pub async fn quit(self) -> Result<()> {
        self.call("FtpConnection::quit", "quit", |reply| Request::Quit { reply })
            .await
    }
}

/// Data side of one `RETR`
///
/// Reads until the server closes the data connection. `finish` then
/// reports the server's verdict on the transfer.
pub struct FtpDownload {
    chunks: mpsc::Receiver<io::Result<Vec<u8>>>,
    current: Vec<u8>,
    offset: usize,
    finished: Option<oneshot::Receiver<Result<()>>>,
}

impl FtpDownload {
    /// Stop reading and wait for the transfer's final reply
    pub async fn finish(&mut self) -> Result<()> {
        let Some(finished) = self.finished.take() else {
            return Ok(());
        };
        self.chunks.close();
        finished
            .await
            .map_err(|_| worker_gone("FtpDownload::finish", "finish transfer"))?
    }
}

impl AsyncRead for FtpDownload {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.current.len() {
                let n = buf.remaining().min(this.current.len() - this.offset);
                buf.put_slice(&this.current[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }

            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.current = chunk;
                    this.offset = 0;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
