//! Directory walking for mirror transfers
//!
//! Local trees are walked in pre-order with siblings sorted by name, so the
//! same tree always yields the same sequence. Remote trees are listed one
//! directory at a time by the transfer engine through [`remote_children`].

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::protocol::{EntryKind, FileInfo};
use crate::remote::{RemoteError, RemoteFs};

/// One entry of a local tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Absolute or caller-relative local path
    pub local: PathBuf,
    /// Path below the walk root, `/`-separated
    pub relative: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Everything an upload mirror will create, in order
#[derive(Debug, Clone, Default)]
pub struct UploadPlan {
    pub entries: Vec<WalkEntry>,
    pub total_bytes: u64,
}

impl UploadPlan {
    pub fn files(&self) -> impl Iterator<Item = &WalkEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::File)
    }

    pub fn directories(&self) -> impl Iterator<Item = &WalkEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Directory)
    }
}

/// Walk `root` and list every subdirectory and regular file beneath it.
///
/// A directory always appears before anything inside it. Symbolic links
/// and special files are skipped.
pub fn plan_upload(root: &Path) -> io::Result<UploadPlan> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Not a directory: {:?}", root),
        ));
    }

    let mut plan = UploadPlan::default();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let file_type = entry.file_type();

        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            debug!("Skipping non-regular entry {:?}", entry.path());
            continue;
        };

        let size = match kind {
            EntryKind::File => entry.metadata().map_err(io::Error::from)?.len(),
            EntryKind::Directory => 0,
        };
        plan.total_bytes += size;

        let relative = relative_remote_path(root, entry.path())?;
        plan.entries.push(WalkEntry {
            local: entry.into_path(),
            relative,
            kind,
            size,
        });
    }

    Ok(plan)
}

/// `path` below `root`, rendered with `/` separators
fn relative_remote_path(root: &Path, path: &Path) -> io::Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("File name is not valid UTF-8: {:?}", name),
                )
            })?),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Unexpected path component in {:?}", rel),
                ))
            }
        }
    }

    Ok(parts.join("/"))
}

/// Join a remote base directory and a relative path with `/`
pub fn join_remote(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    match base.trim_end_matches('/') {
        "" if base.starts_with('/') => format!("/{}", relative),
        "" | "." => relative.to_string(),
        base => format!("{}/{}", base, relative),
    }
}

/// Last segment of a remote name, safe to use as a local file name.
///
/// Both `/` and `\` count as separators. Returns `None` for names that would
/// not stay inside the destination directory (`""`, `"."`, `".."`).
pub fn remote_basename(name: &str) -> Option<&str> {
    let base = name
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()?;
    match base {
        "" | "." | ".." => None,
        base => Some(base),
    }
}

/// List `dir` on the remote side, dropping `.`/`..` and sorting by name
pub async fn remote_children<C>(conn: &mut C, dir: &str) -> Result<Vec<FileInfo>, RemoteError>
where
    C: RemoteFs + ?Sized,
{
    let mut entries: Vec<FileInfo> = conn
        .list(dir)
        .await?
        .into_iter()
        .filter(|e| remote_basename(&e.name).is_some())
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_plan_is_preorder_and_sorted() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("b.txt"), "bb").unwrap();
        fs::write(root.join("a.txt"), "1").unwrap();
        fs::write(root.join("sub/b.txt"), "2").unwrap();
        fs::write(root.join("sub/deeper/c.txt"), "333").unwrap();

        let plan = plan_upload(root).unwrap();
        let order: Vec<(&str, EntryKind)> = plan
            .entries
            .iter()
            .map(|e| (e.relative.as_str(), e.kind))
            .collect();

        assert_eq!(
            order,
            vec![
                ("a.txt", EntryKind::File),
                ("b.txt", EntryKind::File),
                ("empty", EntryKind::Directory),
                ("sub", EntryKind::Directory),
                ("sub/b.txt", EntryKind::File),
                ("sub/deeper", EntryKind::Directory),
                ("sub/deeper/c.txt", EntryKind::File),
            ]
        );
        assert_eq!(plan.total_bytes, 1 + 2 + 1 + 3);
        assert_eq!(plan.files().count(), 4);
        assert_eq!(plan.directories().count(), 3);
    }

    #[test]
    fn test_plan_rejects_non_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        assert!(plan_upload(&file).is_err());
        assert!(plan_upload(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/dest", "a.txt"), "/dest/a.txt");
        assert_eq!(join_remote("/dest/", "sub/b.txt"), "/dest/sub/b.txt");
        assert_eq!(join_remote("/", "a.txt"), "/a.txt");
        assert_eq!(join_remote(".", "a.txt"), "a.txt");
        assert_eq!(join_remote("", "a.txt"), "a.txt");
        assert_eq!(join_remote("inbox", "a.txt"), "inbox/a.txt");
    }

    #[test]
    fn test_remote_basename_strips_prefixes() {
        assert_eq!(remote_basename("report.pdf"), Some("report.pdf"));
        assert_eq!(remote_basename("/folder/sub/b.txt"), Some("b.txt"));
        assert_eq!(remote_basename("../../etc/passwd"), Some("passwd"));
        assert_eq!(remote_basename("..\\..\\boot.ini"), Some("boot.ini"));
        assert_eq!(remote_basename("folder/"), Some("folder"));
        assert_eq!(remote_basename(".."), None);
        assert_eq!(remote_basename("."), None);
        assert_eq!(remote_basename(""), None);
    }

    #[tokio::test]
    async fn test_remote_children_skips_dot_entries() {
        let mut remote = MemoryRemote::new();
        remote.insert_file("/folder/z.txt", "z");
        remote.insert_file("/folder/a.txt", "a");
        remote.insert_file("/folder/m/x.txt", "x");

        let names: Vec<String> = remote_children(&mut remote, "/folder")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "m", "z.txt"]);
    }
}
