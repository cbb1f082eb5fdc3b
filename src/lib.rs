//! Gated File Transfer
//!
//! A file transfer client and a write-mostly, IP-gated server.
//!
//! ## Features
//! - Server-side access gate: every mutating command must target a path
//!   under the allowed root and come from a whitelisted, non-blacklisted
//!   address; downloads are always refused
//! - Streaming uploads and downloads of single files and whole directory
//!   trees, with progress reporting
//! - Optional reversible XOR stream transform of file contents
//! - Optional TLS for the connection, self-signed certificate generation
//! - Global and per-address connection limits, idle timeouts, audit events
//!
//! ## Usage
//!
//! ```bash
//! # Start the server
//! gft server --config server.toml
//!
//! # Upload files, one connection each
//! gft upload --host 10.0.0.5 --user alice --password secret a.txt b.txt
//!
//! # Mirror a directory
//! gft upload-dir --config client.toml ./reports /reports
//! ```

pub mod audit;
pub mod cipher;
pub mod client;
pub mod config;
pub mod gate;
pub mod limits;
pub mod policy;
pub mod progress;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod tls;
pub mod transfer;
pub mod walker;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use cipher::{transform, CipherContext};
pub use client::{spawn_transfer, Client, ClientConfig, ClientSession, JobOutcome, TransferJob};
pub use config::{ClientSettings, ServerSettings};
pub use gate::{Gate, Verb};
pub use policy::{is_path_allowed, AccessPolicy, Permissions};
pub use progress::{BarProgress, NoProgress, ProgressSink};
pub use protocol::{Reply, Request, Response};
pub use remote::RemoteFs;
pub use server::{BoundServer, Server};
pub use tls::{ClientTlsConfig, ServerTlsConfig};
pub use transfer::{
    download_directory, download_file, upload_directory, upload_file, MirrorReport,
    TransferError, TransferReport,
};
