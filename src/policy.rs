//! Access policy: path containment, address lists and permission profiles
//!
//! The policy is built once at server start and shared read-only between
//! sessions.

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use bitflags::bitflags;
use ipnet::IpNet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("allowed root {path:?} cannot be resolved: {source}")]
    InvalidRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid address or network {0:?}")]
    InvalidAddress(String),

    #[error("unknown permission letter {0:?} (expected any of \"elradfmw\")")]
    UnknownPermission(char),
}

bitflags! {
    /// Capability profile of an authenticated identity
    ///
    /// Parsed from the letter notation `"elradfmw"`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// `e`: change directory
        const CHANGE_DIR = 1 << 0;
        /// `l`: list directories
        const LIST = 1 << 1;
        /// `r`: download. Parsed but not honored: retrieve is always denied.
        const DOWNLOAD = 1 << 2;
        /// `a`: append to files
        const APPEND = 1 << 3;
        /// `d`: delete files and directories
        const DELETE = 1 << 4;
        /// `f`: rename
        const RENAME = 1 << 5;
        /// `m`: make directories
        const MAKE_DIR = 1 << 6;
        /// `w`: store files
        const UPLOAD = 1 << 7;
    }
}

impl Permissions {
    pub fn parse(letters: &str) -> Result<Self, PolicyError> {
        letters.chars().try_fold(Permissions::empty(), |acc, c| {
            let flag = match c {
                'e' => Permissions::CHANGE_DIR,
                'l' => Permissions::LIST,
                'r' => Permissions::DOWNLOAD,
                'a' => Permissions::APPEND,
                'd' => Permissions::DELETE,
                'f' => Permissions::RENAME,
                'm' => Permissions::MAKE_DIR,
                'w' => Permissions::UPLOAD,
                other => return Err(PolicyError::UnknownPermission(other)),
            };
            Ok(acc | flag)
        })
    }
}

/// Set of addresses and networks
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    hosts: HashSet<IpAddr>,
    networks: Vec<IpNet>,
}

impl AddressList {
    /// Parse entries such as `"127.0.0.1"`, `"::1"` or `"10.0.0.0/8"`.
    ///
    /// Blank entries are ignored.
    pub fn parse<I, S>(entries: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = AddressList::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if let Ok(addr) = entry.parse::<IpAddr>() {
                list.hosts.insert(addr.to_canonical());
            } else if let Ok(net) = entry.parse::<IpNet>() {
                list.networks.push(net.trunc());
            } else {
                return Err(PolicyError::InvalidAddress(entry.to_string()));
            }
        }
        Ok(list)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.hosts.contains(&addr) || self.networks.iter().any(|net| net.contains(&addr))
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.networks.is_empty()
    }
}

/// Immutable server-wide access policy
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    allowed_root: PathBuf,
    whitelist: AddressList,
    blacklist: AddressList,
}

impl AccessPolicy {
    /// Build the policy, canonicalizing `allowed_root` (which must exist)
    pub fn new(
        allowed_root: impl AsRef<Path>,
        whitelist: AddressList,
        blacklist: AddressList,
    ) -> Result<Self, PolicyError> {
        let root = allowed_root.as_ref();
        let allowed_root = root.canonicalize().map_err(|source| PolicyError::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;

        Ok(Self {
            allowed_root,
            whitelist,
            blacklist,
        })
    }

    pub fn allowed_root(&self) -> &Path {
        &self.allowed_root
    }

    pub fn is_path_allowed(&self, path: &Path) -> bool {
        is_path_allowed(path, &self.allowed_root)
    }

    /// Whitelisted and not blacklisted
    pub fn is_ip_allowed(&self, addr: IpAddr) -> bool {
        let listed = self.is_whitelisted(addr);
        let banned = self.is_blacklisted(addr);
        listed && !banned
    }

    pub fn is_whitelisted(&self, addr: IpAddr) -> bool {
        self.whitelist.contains(addr)
    }

    pub fn is_blacklisted(&self, addr: IpAddr) -> bool {
        self.blacklist.contains(addr)
    }
}

/// True iff `path` resolves to `allowed_root` or somewhere beneath it.
///
/// Both sides are resolved with [`resolve_path`], so symbolic links and `..`
/// segments cannot smuggle a path out of the root. The comparison is by
/// component: `/srv/rootevil` is not under `/srv/root`.
pub fn is_path_allowed(path: &Path, allowed_root: &Path) -> bool {
    match (resolve_path(path), resolve_path(allowed_root)) {
        (Ok(path), Ok(root)) => path.starts_with(root),
        _ => false,
    }
}

/// Symlink hops followed through missing targets before giving up
const MAX_LINK_HOPS: usize = 40;

/// Resolve `path` to an absolute form without requiring it to exist.
///
/// Walks the path one component at a time. While the prefix exists it is
/// canonicalized (following symlinks); `..` is applied to the resolved
/// prefix. A dangling symlink is followed to its target, so the result names
/// the file a create would actually touch. Once a component is missing the
/// remainder is joined lexically.
pub fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    resolve_absolute(&absolute, 0)
}

fn resolve_absolute(absolute: &Path, hops: usize) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut on_disk = true;
    let mut components = absolute.components();

    while let Some(component) = components.next() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
                on_disk = on_disk || resolved.exists();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if !on_disk {
                    continue;
                }
                match resolved.canonicalize() {
                    Ok(real) => resolved = real,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        let is_link = std::fs::symlink_metadata(&resolved)
                            .map(|meta| meta.file_type().is_symlink())
                            .unwrap_or(false);
                        if !is_link {
                            on_disk = false;
                            continue;
                        }
                        if hops >= MAX_LINK_HOPS {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                format!("too many symbolic links resolving {:?}", absolute),
                            ));
                        }
                        let target = std::fs::read_link(&resolved)?;
                        resolved.pop();
                        let followed = resolved.join(target).join(components.as_path());
                        return resolve_absolute(&followed, hops + 1);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn policy(root: &Path, white: &[&str], black: &[&str]) -> AccessPolicy {
        AccessPolicy::new(
            root,
            AddressList::parse(white).unwrap(),
            AddressList::parse(black).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_permissions() {
        let perms = Permissions::parse("elradfmw").unwrap();
        assert_eq!(perms, Permissions::all());

        let guest = Permissions::parse("elr").unwrap();
        assert!(guest.contains(Permissions::LIST));
        assert!(!guest.contains(Permissions::UPLOAD));

        assert!(matches!(
            Permissions::parse("elrX"),
            Err(PolicyError::UnknownPermission('X'))
        ));
    }

    #[test]
    fn test_path_inside_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();

        assert!(is_path_allowed(&root, &root));
        assert!(is_path_allowed(&root.join("sub"), &root));
        assert!(is_path_allowed(&root.join("sub/new/file.txt"), &root));
        assert!(is_path_allowed(&root.join("sub/../file.txt"), &root));
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();

        // Starts with the root literally, but resolves outside it
        assert!(!is_path_allowed(&root.join("../outside.txt"), &root));
        assert!(!is_path_allowed(&root.join("missing/../../outside.txt"), &root));
        assert!(!is_path_allowed(&root.join("a/b/../../../etc/passwd"), &root));
    }

    #[test]
    fn test_sibling_prefix_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let evil = dir.path().join("rootevil");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&evil).unwrap();

        assert!(!is_path_allowed(&evil.join("x.txt"), &root));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        assert!(!is_path_allowed(&root.join("link/file.txt"), &root));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_escape_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(outside.join("planted.txt"), root.join("drop.txt")).unwrap();
        std::os::unix::fs::symlink("../outside/missing", root.join("rel")).unwrap();

        assert!(!is_path_allowed(&root.join("drop.txt"), &root));
        assert!(!is_path_allowed(&root.join("rel/deeper.txt"), &root));
        assert_eq!(
            resolve_path(&root.join("drop.txt")).unwrap(),
            outside.canonicalize().unwrap().join("planted.txt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_inside_root_allowed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        std::os::unix::fs::symlink("sub/later.txt", root.join("alias.txt")).unwrap();

        assert!(is_path_allowed(&root.join("alias.txt"), &root));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(root.join("b"), root.join("a")).unwrap();
        std::os::unix::fs::symlink(root.join("a"), root.join("b")).unwrap();

        assert!(!is_path_allowed(&root.join("a"), &root));
    }

    #[test]
    fn test_blacklist_overrides_whitelist() {
        let dir = TempDir::new().unwrap();
        let lists = policy(dir.path(), &["1.2.3.4", "127.0.0.1"], &["1.2.3.4"]);

        assert!(!lists.is_ip_allowed(ip("1.2.3.4")));
        assert!(lists.is_ip_allowed(ip("127.0.0.1")));
    }

    #[test]
    fn test_absent_from_whitelist_is_denied() {
        let dir = TempDir::new().unwrap();
        let listed = policy(dir.path(), &["127.0.0.1"], &[]);
        assert!(!listed.is_ip_allowed(ip("10.1.1.1")));

        let empty = policy(dir.path(), &[], &[]);
        assert!(!empty.is_ip_allowed(ip("127.0.0.1")));
    }

    #[test]
    fn test_networks_and_mapped_addresses() {
        let dir = TempDir::new().unwrap();
        let lists = policy(dir.path(), &["10.0.0.0/8", ""], &["10.9.9.9"]);

        assert!(lists.is_ip_allowed(ip("10.1.2.3")));
        assert!(lists.is_ip_allowed(ip("::ffff:10.1.2.3")));
        assert!(!lists.is_ip_allowed(ip("10.9.9.9")));
        assert!(!lists.is_ip_allowed(ip("192.168.0.1")));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(matches!(
            AddressList::parse(["not-an-ip"]),
            Err(PolicyError::InvalidAddress(_))
        ));

        let missing = AccessPolicy::new(
            "/definitely/not/here",
            AddressList::default(),
            AddressList::default(),
        );
        assert!(matches!(missing, Err(PolicyError::InvalidRoot { .. })));
    }
}
