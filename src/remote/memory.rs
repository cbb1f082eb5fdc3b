//! In-memory [`RemoteFs`] for unit tests

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use async_trait::async_trait;

use super::{normalize_remote, ByteSink, ByteSource, RemoteError, RemoteFs};
use crate::protocol::{codes, EntryKind, FileInfo, Reply, CHUNK_SIZE};

/// In-memory byte source
pub(crate) struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

#[async_trait]
impl ByteSource for SliceSource<'_> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[async_trait]
impl ByteSink for Vec<u8> {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// A remote file system held in memory
///
/// Records every verb invoked so tests can assert on side effects.
/// Listings include `.` and `..` entries, as some servers send them.
#[derive(Debug)]
pub(crate) struct MemoryRemote {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    calls: Vec<String>,
    fail_on: Option<String>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            files: BTreeMap::new(),
            dirs,
            calls: Vec::new(),
            fail_on: None,
        }
    }

    /// Make every transfer of `path` fail with a 451 reply
    pub fn fail_transfers_of(&mut self, path: &str) {
        self.fail_on = Some(normalize_remote("/", path));
    }

    /// Seed a file, creating its parent directories
    pub fn insert_file(&mut self, path: &str, data: impl Into<Vec<u8>>) {
        let path = normalize_remote("/", path);
        let mut dir = parent_of(&path).to_string();
        while dir != "/" {
            self.dirs.insert(dir.clone());
            dir = parent_of(&dir).to_string();
        }
        self.files.insert(path, data.into());
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files
            .get(&normalize_remote("/", path))
            .map(Vec::as_slice)
    }

    pub fn has_directory(&self, path: &str) -> bool {
        self.dirs.contains(&normalize_remote("/", path))
    }

    /// Verbs invoked so far, formatted as `"VERB /path"`
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    fn record(&mut self, verb: &str, path: &str) -> String {
        let path = normalize_remote("/", path);
        self.calls.push(format!("{} {}", verb, path));
        path
    }

    fn check_parent(&self, path: &str) -> Result<(), RemoteError> {
        if self.dirs.contains(parent_of(path)) {
            Ok(())
        } else {
            Err(not_found(parent_of(path)))
        }
    }

    fn check_failure(&self, path: &str) -> Result<(), RemoteError> {
        if self.fail_on.as_deref() == Some(path) {
            return Err(RemoteError::Rejected(Reply::new(
                codes::LOCAL_ERROR,
                format!("Simulated failure: {}", path),
            )));
        }
        Ok(())
    }

    async fn drain(source: &mut dyn ByteSource) -> Result<Vec<u8>, RemoteError> {
        let mut data = Vec::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let n = source.read_chunk(&mut buffer).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buffer[..n]);
        }
        Ok(data)
    }
}

fn not_found(path: &str) -> RemoteError {
    RemoteError::Rejected(Reply::new(
        codes::ACTION_FAILED,
        format!("No such file or directory: {}", path),
    ))
}

#[async_trait]
impl RemoteFs for MemoryRemote {
    async fn store(&mut self, path: &str, source: &mut dyn ByteSource) -> Result<u64, RemoteError> {
        let path = self.record("STOR", path);
        self.check_parent(&path)?;
        self.check_failure(&path)?;
        let data = Self::drain(source).await?;
        let len = data.len() as u64;
        self.files.insert(path, data);
        Ok(len)
    }

    async fn append(
        &mut self,
        path: &str,
        source: &mut dyn ByteSource,
    ) -> Result<u64, RemoteError> {
        let path = self.record("APPE", path);
        self.check_parent(&path)?;
        self.check_failure(&path)?;
        let data = Self::drain(source).await?;
        let len = data.len() as u64;
        self.files.entry(path).or_default().extend_from_slice(&data);
        Ok(len)
    }

    async fn retrieve(&mut self, path: &str, sink: &mut dyn ByteSink) -> Result<u64, RemoteError> {
        let path = self.record("RETR", path);
        self.check_failure(&path)?;
        let data = self.files.get(&path).ok_or_else(|| not_found(&path))?;
        for chunk in data.chunks(CHUNK_SIZE) {
            sink.write_chunk(chunk).await?;
        }
        Ok(data.len() as u64)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<FileInfo>, RemoteError> {
        let dir = self.record("LIST", path);
        if !self.dirs.contains(&dir) {
            return Err(not_found(&dir));
        }

        let mut entries = vec![
            FileInfo {
                name: ".".into(),
                kind: EntryKind::Directory,
                size: 0,
                modified: None,
            },
            FileInfo {
                name: "..".into(),
                kind: EntryKind::Directory,
                size: 0,
                modified: None,
            },
        ];
        let children = |p: &str| p != dir && parent_of(p) == dir;
        for sub in self.dirs.iter().filter(|p| children(p.as_str())) {
            entries.push(FileInfo {
                name: sub.rsplit('/').next().unwrap_or_default().to_string(),
                kind: EntryKind::Directory,
                size: 0,
                modified: None,
            });
        }
        for (file, data) in self.files.iter().filter(|(p, _)| children(p.as_str())) {
            entries.push(FileInfo {
                name: file.rsplit('/').next().unwrap_or_default().to_string(),
                kind: EntryKind::File,
                size: data.len() as u64,
                modified: None,
            });
        }
        Ok(entries)
    }

    async fn size(&mut self, path: &str) -> Result<u64, RemoteError> {
        let path = self.record("SIZE", path);
        self.files
            .get(&path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| not_found(&path))
    }

    async fn make_directory(&mut self, path: &str) -> Result<(), RemoteError> {
        let path = self.record("MKD", path);
        self.check_parent(&path)?;
        if !self.dirs.insert(path.clone()) {
            return Err(RemoteError::Rejected(Reply::new(
                codes::ACTION_FAILED,
                format!("Directory exists: {}", path),
            )));
        }
        Ok(())
    }

    async fn remove_directory(&mut self, path: &str) -> Result<(), RemoteError> {
        let path = self.record("RMD", path);
        let occupied = self.dirs.iter().any(|d| parent_of(d) == path && *d != path)
            || self.files.keys().any(|f| parent_of(f) == path);
        if occupied || path == "/" || !self.dirs.remove(&path) {
            return Err(not_found(&path));
        }
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> Result<(), RemoteError> {
        let path = self.record("DELE", path);
        self.files
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| not_found(&path))
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        let from = self.record("RNFR", from);
        let to = self.record("RNTO", to);
        self.check_parent(&to)?;
        let data = self.files.remove(&from).ok_or_else(|| not_found(&from))?;
        self.files.insert(to, data);
        Ok(())
    }
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_remote_requires_parent() {
        let mut remote = MemoryRemote::new();
        let mut source = SliceSource::new(b"data");
        let result = remote.store("/missing/a.txt", &mut source).await;
        assert!(matches!(result, Err(RemoteError::Rejected(r)) if r.code == 550));

        remote.make_directory("/missing").await.unwrap();
        let mut source = SliceSource::new(b"data");
        assert_eq!(remote.store("/missing/a.txt", &mut source).await.unwrap(), 4);
        assert_eq!(remote.file("/missing/a.txt"), Some(&b"data"[..]));
    }

    #[tokio::test]
    async fn test_memory_remote_listing() {
        let mut remote = MemoryRemote::new();
        remote.insert_file("/folder/a.txt", "1");
        remote.insert_file("/folder/sub/b.txt", "2");

        let names: Vec<String> = remote
            .list("/folder")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", "..", "sub", "a.txt"]);
    }

    #[tokio::test]
    async fn test_memory_remote_rename_and_append() {
        let mut remote = MemoryRemote::new();
        remote.insert_file("/log.txt", "ab");
        let mut source = SliceSource::new(b"cd");
        remote.append("/log.txt", &mut source).await.unwrap();
        remote.rename("/log.txt", "/old.txt").await.unwrap();
        assert_eq!(remote.file("/old.txt"), Some(&b"abcd"[..]));
        assert!(remote.file("/log.txt").is_none());
        assert_eq!(remote.calls(), ["APPE /log.txt", "RNFR /log.txt", "RNTO /old.txt"]);
    }
}
