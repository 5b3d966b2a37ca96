//! DeskStream - live screen streaming for lightweight remote viewing
//!
//! This library provides the host side of a screen-sharing stream:
//! - Screen capture behind a pluggable source
//! - Perceptual change detection between captures
//! - Quality-adaptive JPEG + zstd frame encoding
//! - Viewer lag tracking that steers quality and drops frames under load
//! - A paced capture loop with a bounded outgoing queue
//! - Configuration and logging infrastructure
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use desk_stream::{
//!     config::ConfigManager,
//!     desktop::{RuntimeParams, ScrapSource},
//!     logging,
//!     stream::{spawn_forwarder, BroadcastHub, StreamScheduler, StreamSettings},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! logging::init_default_logging();
//!
//! let config = ConfigManager::new().unwrap().load_or_create_default().unwrap();
//! let (scheduler, endpoints) =
//!     StreamScheduler::new(StreamSettings::from_config(&config), RuntimeParams::default());
//!
//! let hub = BroadcastHub::default();
//! let mut viewer = hub.subscribe();
//! spawn_forwarder(endpoints.frames, Arc::new(hub.clone()));
//!
//! let _handle = scheduler.spawn(|| ScrapSource::open(None)).unwrap();
//! let frame = viewer.recv().await.unwrap();
//! println!("first frame: {} ({} bytes)", frame.frame_type, frame.size_bytes());
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod desktop;
pub mod error;
pub mod logging;
pub mod stream;

// Re-export commonly used types at crate root
pub use error::{Result, StreamError};
