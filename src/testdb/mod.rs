//! Test Database Module
//!
//! Stand-ins for the camera so the exporter can be exercised without one.
//!
//! # Features
//!
//! - **MockMediaSource**: in-memory [`MediaSource`](crate::device::MediaSource)
//!   with per-file fault injection, for exporter tests
//! - **MockCamera**: loopback control, shell and FTP servers speaking the real
//!   wire protocols, for channel tests and `cam-export simulate`
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cam_export::device::DeviceFacade;
//! use cam_export::testdb::{MockCamera, MockCameraBehavior, MockFile};
//!
//! # async fn demo() {
//! let camera = MockCamera::start(
//!     vec![MockFile::new("100MEDIA", "YDXJ0001.MP4", vec![0u8; 4096])],
//!     MockCameraBehavior::default(),
//! )
//! .await;
//! let facade = DeviceFacade::new(camera.config("./exported"));
//! # }
//! ```

pub mod mock_camera;
pub mod mock_media;

pub use mock_camera::{MockCamera, MockCameraBehavior, MockControlBehavior, MockControlServer, MockFile};
pub use mock_media::{MockMediaFile, MockMediaSource};
