//! Remote file system verbs
//!
//! The transfer engine talks to a server only through [`RemoteFs`]. The
//! network client implements it over the wire protocol; unit tests use an
//! in-memory implementation.

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{FileInfo, ProtocolError, Reply};

#[cfg(test)]
mod memory;
#[cfg(test)]
pub(crate) use memory::{MemoryRemote, SliceSource};

/// Failure of a single remote verb
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The server answered with a non-success reply
    #[error("server replied {0}")]
    Rejected(Reply),

    /// The connection or framing failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<io::Error> for RemoteError {
    fn from(e: io::Error) -> Self {
        RemoteError::Protocol(ProtocolError::Io(e))
    }
}

/// Pull side of a store: yields the bytes to send
#[async_trait]
pub trait ByteSource: Send {
    /// Fill `buf` with the next bytes, returning 0 at end of stream
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Push side of a retrieve: consumes received bytes
#[async_trait]
pub trait ByteSink: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;
}

/// The verbs the transfer engine needs from a connection
#[async_trait]
pub trait RemoteFs: Send {
    /// Create or replace `path`, returning the number of bytes sent
    async fn store(&mut self, path: &str, source: &mut dyn ByteSource) -> Result<u64, RemoteError>;

    /// Append to `path`, creating it if missing
    async fn append(&mut self, path: &str, source: &mut dyn ByteSource)
        -> Result<u64, RemoteError>;

    /// Fetch `path`, returning the number of bytes received
    async fn retrieve(&mut self, path: &str, sink: &mut dyn ByteSink) -> Result<u64, RemoteError>;

    async fn list(&mut self, path: &str) -> Result<Vec<FileInfo>, RemoteError>;

    async fn size(&mut self, path: &str) -> Result<u64, RemoteError>;

    async fn make_directory(&mut self, path: &str) -> Result<(), RemoteError>;

    async fn remove_directory(&mut self, path: &str) -> Result<(), RemoteError>;

    async fn delete(&mut self, path: &str) -> Result<(), RemoteError>;

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError>;
}

/// Collapse `.`/`..` and make `path` absolute under `/`
pub fn normalize_remote(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let start = if path.starts_with('/') { "" } else { cwd };

    for segment in start.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    format!("/{}", parts.join("/"))
}
