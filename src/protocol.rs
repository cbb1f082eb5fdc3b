//! Protocol Definition Module
//!
//! A small command/reply file-transfer protocol:
//! - Command messages naming a verb and a remote path
//! - Replies carrying conventional three-digit status codes
//! - Binary framing for messages and file data
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                 Server
//!   |                                      |
//!   |<----------------------- 220 Ready ---|
//!   |-- Login(user, password) ------------>|
//!   |<------------------ 230 Logged in ----|
//!   |                                      |
//!   |-- Store(path) ---------------------->|
//!   |<--------- 150 Ready (or 553 Deny) ---|
//!   |-- [File Data Chunks] --------------->|
//!   |<----------------- 226 Complete ------|
//!   |                                      |
//!   |-- Quit ----------------------------->|
//!   |<------------------------ 221 Bye ----|
//! ```
//!
//! ## Reply classes
//!
//! | Class | Meaning |
//! |-------|---------|
//! | 1xx   | preliminary, data follows |
//! | 2xx   | success |
//! | 3xx   | intermediate, more input expected |
//! | 4xx   | transient failure |
//! | 5xx   | permanent failure or permission denied |

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (16 MB) - prevents memory exhaustion
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Chunk size for file transfers (64 KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Magic bytes to identify our protocol
pub const PROTOCOL_MAGIC: &[u8; 4] = b"GFT1";

/// Reply codes used by the server
pub mod codes {
    pub const DATA_READY: u16 = 150;
    pub const OK: u16 = 200;
    pub const SIZE: u16 = 213;
    pub const SERVICE_READY: u16 = 220;
    pub const GOODBYE: u16 = 221;
    pub const TRANSFER_COMPLETE: u16 = 226;
    pub const LOGGED_IN: u16 = 230;
    pub const ACTION_OK: u16 = 250;
    pub const PATH_CREATED: u16 = 257;
    pub const PENDING: u16 = 350;
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    pub const TRANSFER_ABORTED: u16 = 426;
    pub const LOCAL_ERROR: u16 = 451;
    pub const BAD_SEQUENCE: u16 = 503;
    pub const NOT_LOGGED_IN: u16 = 530;
    pub const ACTION_FAILED: u16 = 550;
    pub const NOT_PERMITTED: u16 = 553;
}

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(u64, u64),

    #[error("Invalid protocol magic")]
    InvalidMagic,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ProtocolError {
    /// True when the peer went away cleanly between messages
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Client-to-server command messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Login { username: String, password: String },
    Store { path: String },
    Append { path: String },
    Retrieve { path: String },
    List { path: Option<String> },
    Size { path: String },
    MakeDirectory { path: String },
    RemoveDirectory { path: String },
    Delete { path: String },
    RenameFrom { path: String },
    RenameTo { path: String },
    ChangeDirectory { path: String },
    PrintDirectory,
    Quit,
}

/// Status line of a server reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// First digit of the code
    pub fn class(&self) -> u16 {
        self.code / 100
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == 1
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    pub fn is_intermediate(&self) -> bool {
        self.class() == 3
    }

    pub fn is_failure(&self) -> bool {
        self.class() >= 4
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Server-to-client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Plain status reply
    Reply(Reply),

    /// Directory listing
    Listing { entries: Vec<FileInfo> },

    /// Size of a remote file in bytes
    Size { bytes: u64 },
}

impl From<Reply> for Response {
    fn from(reply: Reply) -> Self {
        Response::Reply(reply)
    }
}

/// Kind of a remote directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// File information for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<u64>, // Unix timestamp
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Protocol message with framing
///
/// Wire format:
/// ```text
/// +----------+----------+----------+
/// | Magic(4) | Length(4)| Payload  |
/// +----------+----------+----------+
/// ```
pub struct MessageFramer;

impl MessageFramer {
    /// Write a message with length prefix
    pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize,
    {
        let payload = serde_json::to_vec(message)?;
        let len = payload.len() as u64;

        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
        }

        writer.write_all(PROTOCOL_MAGIC).await?;
        writer.write_u32(len as u32).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Read a message with length prefix
    pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await?;

        if &magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        let len = reader.read_u32().await? as u64;

        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;

        Ok(serde_json::from_slice(&payload)?)
    }

    /// Write raw data chunks (for file transfer)
    pub async fn write_data<W>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_u32(data.len() as u32).await?;
        writer.write_all(data).await?;
        Ok(())
    }

    /// Read a data chunk, returning 0 at the end marker
    pub async fn read_data<R>(reader: &mut R, buffer: &mut [u8]) -> Result<usize, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let len = reader.read_u32().await? as usize;

        if len > buffer.len() {
            return Err(ProtocolError::InvalidFormat(format!(
                "Chunk size {} exceeds buffer size {}",
                len,
                buffer.len()
            )));
        }

        if len > 0 {
            reader.read_exact(&mut buffer[..len]).await?;
        }

        Ok(len)
    }

    /// Write end-of-data marker
    pub async fn write_end_marker<W>(writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_u32(0).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Streaming SHA-256 over received file data, reported in audit records
pub struct StreamingHasher {
    hasher: Sha256,
    bytes_processed: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}
