//! Packrat
//!
//! Client-side assistant daemon for a distributed file-metadata and
//! content-deduplication system. It continuously discovers files under
//! user-registered roots, fingerprints their content with SHA-256, and
//! ships metadata (optionally content) to a remote server, surviving
//! server outages, restarts and large backlogs.
//!
//! The pipeline is three decoupled stages joined by durable queues in an
//! embedded SQLite store:
//!
//! `scanner → queue_pending_checksum → fingerprinter → queue_pending_upload
//! → uploader → remote server`
//!
//! A loopback HTTP control plane exposes management endpoints and an SSE
//! activity feed for local clients.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod fingerprint;
pub mod scanner;
pub mod store;
pub mod uploader;

pub use config::Config;
pub use daemon::Daemon;
pub use store::Store;
