//! Streaming Transfer Engine
//!
//! Moves single files and whole directory trees between the local file
//! system and a [`RemoteFs`] connection. Bytes flow in `CHUNK_SIZE` pieces;
//! each chunk goes through the [`CipherContext`] at its absolute offset and
//! is then reported to the [`ProgressSink`], so memory use stays flat no
//! matter how large the file or whether the transform is on.
//!
//! ## Failure semantics
//!
//! - Bad local input is reported before any remote verb is issued.
//! - Nothing is retried; a new operation is the retry.
//! - A download interrupted halfway leaves the partial local file in place.
//!   Treat such a file as untrustworthy until a fresh attempt succeeds.
//!   A download that fails before its first byte leaves nothing behind.
//! - Directory mirrors stop at the first failed file. Files already moved
//!   stay where they are.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use crate::cipher::CipherContext;
use crate::progress::{OffsetProgress, ProgressSink};
use crate::protocol::{EntryKind, ProtocolError, Reply};
use crate::remote::{ByteSink, ByteSource, RemoteError, RemoteFs};
use crate::walker::{join_remote, plan_upload, remote_basename, remote_children};

#[derive(Error, Debug)]
pub enum TransferError {
    /// Rejected before touching the network
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Server rejected {path}: {reply}")]
    Rejected { path: String, reply: Reply },

    #[error("Transport failure: {0}")]
    Transport(#[from] ProtocolError),

    #[error("Local I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    fn remote(path: &str) -> impl FnOnce(RemoteError) -> TransferError + '_ {
        move |e| match e {
            RemoteError::Rejected(reply) => TransferError::Rejected {
                path: path.to_string(),
                reply,
            },
            RemoteError::Protocol(e) => TransferError::Transport(e),
        }
    }

    fn io(path: &Path) -> impl FnOnce(io::Error) -> TransferError + '_ {
        move |source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Result of one completed file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub direction: Direction,
    pub local: PathBuf,
    pub remote: String,
    /// Size known up front, `0` if it was not
    pub total_bytes: u64,
    pub bytes: u64,
}

/// Running totals of a directory mirror
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

impl MirrorReport {
    fn add_file(&mut self, report: &TransferReport) {
        self.files += 1;
        self.bytes += report.bytes;
    }
}

/// Reads a local file, transforming and reporting each chunk
struct FileSource<'a> {
    reader: BufReader<File>,
    cipher: &'a CipherContext,
    progress: &'a dyn ProgressSink,
    offset: u64,
    total: u64,
}

#[async_trait]
impl ByteSource for FileSource<'_> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf).await?;
        if n > 0 {
            self.cipher.apply(self.offset, &mut buf[..n]);
            self.offset += n as u64;
            self.progress.report(self.offset, self.total);
        }
        Ok(n)
    }
}

/// Writes received chunks to a local file after transforming them
struct FileSink<'a> {
    writer: BufWriter<File>,
    cipher: &'a CipherContext,
    progress: &'a dyn ProgressSink,
    scratch: Vec<u8>,
    offset: u64,
    total: u64,
}

#[async_trait]
impl ByteSink for FileSink<'_> {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        self.cipher.apply(self.offset, &mut self.scratch);
        self.writer.write_all(&self.scratch).await?;
        self.offset += data.len() as u64;
        self.progress.report(self.offset, self.total);
        Ok(())
    }
}

/// Upload one regular file to `remote_name`.
pub async fn upload_file<C>(
    conn: &mut C,
    local_path: &Path,
    remote_name: &str,
    cipher: &CipherContext,
    progress: &dyn ProgressSink,
) -> Result<TransferReport, TransferError>
where
    C: RemoteFs + ?Sized,
{
    let metadata = fs::metadata(local_path)
        .await
        .map_err(|e| TransferError::InvalidInput(format!("{:?}: {}", local_path, e)))?;
    if !metadata.is_file() {
        return Err(TransferError::InvalidInput(format!(
            "Not a regular file: {:?}",
            local_path
        )));
    }

    let file = File::open(local_path)
        .await
        .map_err(|e| TransferError::InvalidInput(format!("Cannot read {:?}: {}", local_path, e)))?;

    let total = metadata.len();
    info!(
        "📤 Uploading {:?} -> {} ({} bytes{})",
        local_path,
        remote_name,
        total,
        if cipher.is_active() { ", encrypted" } else { "" }
    );

    progress.report(0, total);
    let mut source = FileSource {
        reader: BufReader::new(file),
        cipher,
        progress,
        offset: 0,
        total,
    };

    let bytes = conn
        .store(remote_name, &mut source)
        .await
        .map_err(TransferError::remote(remote_name))?;

    info!("✅ Upload complete: {} ({} bytes)", remote_name, bytes);

    Ok(TransferReport {
        direction: Direction::Upload,
        local: local_path.to_path_buf(),
        remote: remote_name.to_string(),
        total_bytes: total,
        bytes,
    })
}

/// Download `remote_name` into `local_dir`, naming the file after the last
/// segment of the remote name.
pub async fn download_file<C>(
    conn: &mut C,
    remote_name: &str,
    local_dir: &Path,
    cipher: &CipherContext,
    progress: &dyn ProgressSink,
) -> Result<TransferReport, TransferError>
where
    C: RemoteFs + ?Sized,
{
    let metadata = fs::metadata(local_dir)
        .await
        .map_err(|e| TransferError::InvalidInput(format!("{:?}: {}", local_dir, e)))?;
    if !metadata.is_dir() {
        return Err(TransferError::InvalidInput(format!(
            "Not a directory: {:?}",
            local_dir
        )));
    }
    if let Err(e) = probe_writable(local_dir).await {
        return Err(TransferError::InvalidInput(format!(
            "Directory is not writable: {:?}: {}",
            local_dir, e
        )));
    }

    let name = remote_basename(remote_name).ok_or_else(|| {
        TransferError::InvalidInput(format!("Remote name has no file name: {:?}", remote_name))
    })?;
    let local_path = local_dir.join(name);

    let total = match conn.size(remote_name).await {
        Ok(size) => size,
        Err(RemoteError::Rejected(reply)) => {
            debug!("Size of {} unknown: {}", remote_name, reply);
            0
        }
        Err(RemoteError::Protocol(e)) => return Err(TransferError::Transport(e)),
    };

    info!("📥 Downloading {} -> {:?}", remote_name, local_path);

    let file = File::create(&local_path)
        .await
        .map_err(TransferError::io(&local_path))?;

    progress.report(0, total);
    let mut sink = FileSink {
        writer: BufWriter::new(file),
        cipher,
        progress,
        scratch: Vec::new(),
        offset: 0,
        total,
    };

    let result = conn.retrieve(remote_name, &mut sink).await;
    let flushed = sink.writer.flush().await;

    let bytes = match result {
        Ok(bytes) => bytes,
        Err(e) => {
            if sink.offset > 0 {
                warn!(
                    "⚠️  Partial file left at {:?} ({} bytes); do not trust it",
                    local_path, sink.offset
                );
            } else {
                drop(sink);
                if let Err(e) = fs::remove_file(&local_path).await {
                    warn!("Could not remove empty file {:?}: {}", local_path, e);
                }
            }
            return Err(TransferError::remote(remote_name)(e));
        }
    };
    flushed.map_err(TransferError::io(&local_path))?;

    info!("✅ Download complete: {:?} ({} bytes)", local_path, bytes);

    Ok(TransferReport {
        direction: Direction::Download,
        local: local_path,
        remote: remote_name.to_string(),
        total_bytes: total,
        bytes,
    })
}

/// Create one remote directory. A refusal (usually "already exists") is
/// logged and ignored; transport failures still abort.
async fn make_remote_dir<C>(conn: &mut C, path: &str) -> Result<(), TransferError>
where
    C: RemoteFs + ?Sized,
{
    match conn.make_directory(path).await {
        Ok(()) => {
            debug!("Created remote directory {}", path);
            Ok(())
        }
        Err(RemoteError::Rejected(reply)) => {
            debug!("Remote directory {} not created: {}", path, reply);
            Ok(())
        }
        Err(RemoteError::Protocol(e)) => Err(TransferError::Transport(e)),
    }
}

/// Create `path` and any missing ancestors on the remote side
async fn ensure_remote_dir<C>(conn: &mut C, path: &str) -> Result<(), TransferError>
where
    C: RemoteFs + ?Sized,
{
    let absolute = path.starts_with('/');
    let mut current = String::new();

    for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        make_remote_dir(conn, &current).await?;
    }

    Ok(())
}

/// Mirror the local tree under `local_root` to `remote_root`.
pub async fn upload_directory<C>(
    conn: &mut C,
    local_root: &Path,
    remote_root: &str,
    cipher: &CipherContext,
    progress: &dyn ProgressSink,
) -> Result<MirrorReport, TransferError>
where
    C: RemoteFs + ?Sized,
{
    let root = local_root.to_path_buf();
    let plan = tokio::task::spawn_blocking(move || plan_upload(&root))
        .await
        .map_err(|e| TransferError::InvalidInput(format!("Directory walk failed: {}", e)))?
        .map_err(|e| TransferError::InvalidInput(format!("{:?}: {}", local_root, e)))?;

    info!(
        "📤 Uploading directory {:?} -> {} ({} files, {} bytes)",
        local_root,
        remote_root,
        plan.files().count(),
        plan.total_bytes
    );

    ensure_remote_dir(conn, remote_root).await?;

    let mut report = MirrorReport::default();
    for entry in &plan.entries {
        let remote_path = join_remote(remote_root, &entry.relative);
        match entry.kind {
            EntryKind::Directory => {
                make_remote_dir(conn, &remote_path).await?;
                report.directories += 1;
            }
            EntryKind::File => {
                let sink = OffsetProgress::new(progress, report.bytes, plan.total_bytes);
                let file = upload_file(conn, &entry.local, &remote_path, cipher, &sink).await?;
                report.add_file(&file);
            }
        }
    }

    info!(
        "✅ Directory upload complete: {} files, {} directories, {} bytes",
        report.files, report.directories, report.bytes
    );
    Ok(report)
}

/// Mirror the remote tree under `remote_root` into `local_root`.
pub async fn download_directory<C>(
    conn: &mut C,
    remote_root: &str,
    local_root: &Path,
    cipher: &CipherContext,
    progress: &dyn ProgressSink,
) -> Result<MirrorReport, TransferError>
where
    C: RemoteFs + ?Sized,
{
    if local_root.exists() && !local_root.is_dir() {
        return Err(TransferError::InvalidInput(format!(
            "Not a directory: {:?}",
            local_root
        )));
    }
    fs::create_dir_all(local_root)
        .await
        .map_err(TransferError::io(local_root))?;

    info!("📥 Downloading directory {} -> {:?}", remote_root, local_root);

    let mut report = MirrorReport::default();
    let mut pending = vec![(remote_root.to_string(), local_root.to_path_buf())];

    while let Some((remote_dir, local_dir)) = pending.pop() {
        let entries = remote_children(conn, &remote_dir)
            .await
            .map_err(TransferError::remote(&remote_dir))?;

        let mut subdirs = Vec::new();
        for entry in entries {
            let Some(name) = remote_basename(&entry.name) else {
                continue;
            };
            let remote_path = join_remote(&remote_dir, name);

            if entry.is_directory() {
                let local_sub = local_dir.join(name);
                fs::create_dir_all(&local_sub)
                    .await
                    .map_err(TransferError::io(&local_sub))?;
                report.directories += 1;
                subdirs.push((remote_path, local_sub));
            } else {
                let sink = OffsetProgress::new(progress, report.bytes, 0);
                let file = download_file(conn, &remote_path, &local_dir, cipher, &sink).await?;
                report.add_file(&file);
            }
        }

        // Reverse so the stack visits subdirectories in name order
        pending.extend(subdirs.into_iter().rev());
    }

    info!(
        "✅ Directory download complete: {} files, {} directories, {} bytes",
        report.files, report.directories, report.bytes
    );
    Ok(report)
}

/// Create and drop an anonymous file in `dir`, proving it accepts writes
async fn probe_writable(dir: &Path) -> io::Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || tempfile::tempfile_in(dir).map(drop))
        .await
        .map_err(io::Error::other)?
}
