//! Common test infrastructure
//!
//! Integration tests import from this module only.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{play, TestService};
//!
//! #[tokio::test]
//! async fn test_ingest() {
//!     let service = TestService::spawn().await;
//!     service.manager.ingest(play("u1", "uri-1", "Song", "2025-01-01T10:00:00Z")).await.unwrap();
//! }
//! ```

mod fixtures;
mod service;

#[allow(unused_imports)]
pub use fixtures::{play, play_with_duration, FlakyRecomputer};
#[allow(unused_imports)]
pub use service::{fast_settings, TestService};
