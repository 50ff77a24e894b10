//! Device interaction module
//!
//! Talks to the camera over its three network protocols and presents the
//! result as a single [`MediaSource`].
//!
//! # Submodules
//!
//! - `control` - token-scoped JSON control session (port 7878)
//! - `bootstrap` - shell channel that launches the FTP daemon (port 23)
//! - `ftp` - async front for the `suppaftp` client (one worker thread per connection)
//! - `file_channel` - enumeration, download and removal over FTP
//! - `facade` - sequences the three channels into one session
//! - `net` - dial, readiness check and bounded teardown helpers
//! - `traits` - abstraction traits for testability

pub mod bootstrap;
pub mod control;
pub mod facade;
pub mod file_channel;
pub mod ftp;
pub mod net;
pub mod traits;

pub use facade::DeviceFacade;
pub use traits::{ConnectionState, FileDescriptor, FileStream, MediaSource, SourceReader};
