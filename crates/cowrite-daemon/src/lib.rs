//! cowrite-daemon library: Networking and native pieces around cowrite-core.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod client;
pub mod config;
pub mod connection;
pub mod dir_store;
pub mod file_surface;
pub mod server;
pub mod watcher;

// Re-export key types for convenience
pub use client::{ClientConfig, CollabClient, TransportMode};
pub use config::{ConfigError, EditArgs, EditSettings};
pub use connection::{ClientConnection, ConnectionEvent, IncomingMessage};
pub use dir_store::DirStore;
pub use file_surface::FileSurface;
pub use server::RelayServer;
pub use watcher::{FileEventKind, FileWatcher};
