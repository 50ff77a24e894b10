//! Socket helpers shared by the three device channels
//!
//! - `dial` - TCP connect bounded by a timeout
//! - `wait_until_accepting` - bounded connect-retry check for a service that
//!   gives no readiness signal of its own
//! - `Teardown` - handle on a channel's background teardown task, awaited
//!   with a bound and force-closed on expiry

use crate::core::error::{ExportError, Result};
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// First pause between readiness attempts
const READY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Longest pause between readiness attempts
const READY_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Connect to `host:port` or fail after `limit`
pub async fn dial(op: &'static str, host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    trace!("{}: dialing {}", op, addr);

    match timeout(limit, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(ExportError::connection(op, format!("dial {}", addr), e)),
        Err(_) => Err(ExportError::timeout(op, format!("dial {}", addr), limit)),
    }
}

/// Dial `host:port` repeatedly until it accepts a connection or `budget` runs out
///
/// Backs off exponentially between attempts. Each trial connection is
/// dropped straight away.
pub async fn wait_until_accepting(
    op: &'static str,
    host: &str,
    port: u16,
    budget: Duration,
) -> Result<u32> {
    let deadline = Instant::now() + budget;
    let mut backoff = READY_INITIAL_BACKOFF;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ExportError::timeout(
                op,
                format!("waiting for {}:{} to accept ({} attempts)", host, port, attempts - 1),
                budget,
            ));
        }

        match timeout(remaining, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                debug!("{}: {}:{} accepting after {} attempt(s)", op, host, port, attempts);
                return Ok(attempts);
            }
            Ok(Err(e)) => trace!("{}: attempt {} at {}:{} failed: {}", op, attempts, host, port, e),
            Err(_) => trace!("{}: attempt {} at {}:{} timed out", op, attempts, host, port),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep(backoff.min(remaining)).await;
        backoff = (backoff * 2).min(READY_MAX_BACKOFF);
    }
}

/// Background teardown task of one channel
#[derive(Debug)]
pub struct Teardown {
    channel: &'static str,
    handle: JoinHandle<()>,
}

impl Teardown {
    pub fn new(channel: &'static str, handle: JoinHandle<()>) -> Self {
        Self { channel, handle }
    }

    /// Wait for the task, aborting it if it outlives `limit`
    ///
    /// Aborting drops whatever socket the task owns, which closes it.
    /// Returns `true` when the task finished on its own.
    pub async fn wait(self, limit: Duration) -> bool {
        let Teardown { channel, mut handle } = self;

        match timeout(limit, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("{} teardown task failed: {}", channel, e);
                false
            }
            Err(_) => {
                warn!(
                    "{} teardown did not finish within {:?}; force-closing",
                    channel, limit
                );
                handle.abort();
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_dial_refused_is_connection_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial("test", "127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_wait_succeeds_once_service_binds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let attempts = wait_until_accepting("test", "127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(attempts > 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_explicitly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = wait_until_accepting("test", "127.0.0.1", port, Duration::from_millis(400))
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_teardown_finishes_when_cancelled() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let teardown = Teardown::new(
            "test",
            tokio::spawn(async move {
                token.cancelled().await;
            }),
        );

        cancel.cancel();
        assert!(teardown.wait(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_teardown_hung_task_is_aborted() {
        let teardown = Teardown::new(
            "test",
            tokio::spawn(async {
                sleep(Duration::from_secs(3600)).await;
            }),
        );

        let started = std::time::Instant::now();
        assert!(!teardown.wait(Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
