//! Camera Export Library
//!
//! Harvest-and-remove exporter for Ambarella-based Wi-Fi action cameras.
//! Every clip on the card is copied to local storage and deleted from the
//! camera only once the copy's length matches the size the camera listed.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`core`] - Configuration, error handling, local storage, the export
//!   ledger and the poll loop
//! - [`device`] - The camera's three network channels (JSON control session,
//!   shell bootstrap, FTP file transfer) behind one [`device::MediaSource`]
//! - [`cli`] - Command-line interface (only used by the binary)
//! - [`testdb`] - In-memory and loopback mock cameras for testing
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use cam_export::core::config::Config;
//! use cam_export::core::exporter::{ExportOrchestrator, ExporterConfig};
//! use cam_export::core::sink::LocalSink;
//! use cam_export::device::DeviceFacade;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut exporter = ExportOrchestrator::new(
//!         DeviceFacade::new(config.clone()),
//!         LocalSink::new(config.storage.clone()),
//!         ExporterConfig::from_config(&config),
//!     );
//!
//!     let report = exporter.run_cycle(&CancellationToken::new()).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```
//!
//! # Testing Without a Camera
//!
//! `testdb::MockCamera` serves the real control, shell and FTP protocols on
//! 127.0.0.1, so the whole pipeline can run against it:
//!
//! ```rust,no_run
//! use cam_export::testdb::{MockCamera, MockCameraBehavior, MockFile};
//!
//! # async fn demo() {
//! let camera = MockCamera::start(
//!     vec![MockFile::new("100MEDIA", "YDXJ0001.MP4", vec![0u8; 1024])],
//!     MockCameraBehavior::default(),
//! )
//! .await;
//! let config = camera.config("./exported");
//! # }
//! ```

pub mod cli;
pub mod core;
pub mod device;
pub mod testdb;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
