//! Error types for the camera exporter
//!
//! Every component wraps the failure it observed with its own operation name
//! (`ControlSession::start`, `DeviceFacade::session_start`, ...) so the final
//! error carries the whole causal chain through [`std::error::Error::source`].

use std::error::Error as StdError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the camera exporter
#[derive(Error, Debug)]
pub enum ExportError {
    /// Dial, read or write failure on one of the device channels
    #[error("{op}: {action} failed: {source}")]
    Connection {
        op: &'static str,
        action: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed, truncated or unexpected response from the device
    #[error("{op}: {message}")]
    Protocol { op: &'static str, message: String },

    /// Local create/open/remove failure
    #[error("{op}: {action} '{}' failed: {source}", path.display())]
    Filesystem {
        op: &'static str,
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A session-start precondition does not hold (e.g. not enough free space)
    #[error("{op}: {message}")]
    Precondition { op: &'static str, message: String },

    /// The device did not answer within the allotted time
    #[error("{op}: {action} timed out after {timeout:?}")]
    Timeout {
        op: &'static str,
        action: String,
        timeout: Duration,
    },

    /// Operation attempted on a channel that is not in the `Open` state
    #[error("{op}: channel is not open")]
    NotOpen { op: &'static str },

    /// A failure wrapped with the name of the operation that observed it
    #[error("{op}: {action} failed")]
    Operation {
        op: &'static str,
        action: String,
        #[source]
        source: Box<ExportError>,
    },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ExportError>;

impl ExportError {
    pub fn connection(op: &'static str, action: impl Into<String>, source: std::io::Error) -> Self {
        ExportError::Connection {
            op,
            action: action.into(),
            source,
        }
    }

    pub fn protocol(op: &'static str, message: impl Into<String>) -> Self {
        ExportError::Protocol {
            op,
            message: message.into(),
        }
    }

    pub fn filesystem(
        op: &'static str,
        action: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        ExportError::Filesystem {
            op,
            action,
            path: path.into(),
            source,
        }
    }

    pub fn timeout(op: &'static str, action: impl Into<String>, timeout: Duration) -> Self {
        ExportError::Timeout {
            op,
            action: action.into(),
            timeout,
        }
    }

    /// Render the error together with every cause, outermost first.
    ///
    /// Leaf variants already print their io cause, so the walk stops there.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut current: &ExportError = self;
        while let ExportError::Operation { source, .. } = current {
            out.push_str(": ");
            out.push_str(&source.to_string());
            current = source;
        }
        out
    }

    /// The innermost error of an `Operation` chain
    pub fn root(&self) -> &ExportError {
        let mut current = self;
        while let ExportError::Operation { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether the root cause is a local filesystem failure
    pub fn is_filesystem(&self) -> bool {
        matches!(self.root(), ExportError::Filesystem { .. })
    }

    /// Whether the root cause happened on the wire
    pub fn is_connection(&self) -> bool {
        matches!(
            self.root(),
            ExportError::Connection { .. } | ExportError::Timeout { .. }
        )
    }

    /// Depth of the wrapping chain (1 for a leaf error)
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut source = StdError::source(self);
        while let Some(err) = source {
            depth += 1;
            source = err.source();
        }
        depth
    }
}

/// Wrap the error side of a result with the calling operation's name
pub trait OpContext<T> {
    fn op_context(self, op: &'static str, action: impl Into<String>) -> Result<T>;
}

impl<T> OpContext<T> for Result<T> {
    fn op_context(self, op: &'static str, action: impl Into<String>) -> Result<T> {
        self.map_err(|source| ExportError::Operation {
            op,
            action: action.into(),
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn failing_dial() -> Result<()> {
        Err(ExportError::connection(
            "ControlSession::start",
            "dial 192.168.42.1:7878",
            io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
        ))
    }

    #[test]
    fn test_op_context_preserves_chain() {
        let err = failing_dial()
            .op_context("DeviceFacade::session_start", "control session start")
            .op_context("ExportOrchestrator::cycle", "device session start")
            .unwrap_err();

        let rendered = err.chain();
        assert!(rendered.starts_with("ExportOrchestrator::cycle: device session start failed"));
        assert!(rendered.contains("DeviceFacade::session_start: control session start failed"));
        assert!(rendered.contains("connection refused"));

        // Operation -> Operation -> Connection -> io::Error
        assert_eq!(err.depth(), 4);
        assert!(err.is_connection());
        assert!(!err.is_filesystem());
    }

    #[test]
    fn test_root_of_leaf_is_itself() {
        let err = ExportError::protocol("FtpConnection::pasv", "malformed 227 reply");
        assert!(matches!(err.root(), ExportError::Protocol { .. }));
        assert_eq!(err.chain(), "FtpConnection::pasv: malformed 227 reply");
    }

    #[test]
    fn test_filesystem_display_includes_path() {
        let err = ExportError::filesystem(
            "LocalSink::delete",
            "remove",
            "/data/A.MP4",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/data/A.MP4"));
        assert!(msg.contains("denied"));
        assert!(err.is_filesystem());
    }
}
