//! Test doubles shared across the StoryLoom crates.
//!
//! Capabilities record every prompt they receive so tests can assert which
//! nodes actually reached a provider. Stores are plain in-memory maps, with a
//! flaky wrapper for exercising the persistence retry path.

pub mod fixtures;
pub mod mocks;
pub mod store;

pub use mocks::{GatedText, MockImage, MockText, MockUploader, MockVideo};
pub use store::{FlakyStore, MemoryStore};

/// A temporary directory removed when dropped.
pub fn temp_workspace() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("storyloom_test_")
        .tempdir()
        .expect("create temp workspace")
}
