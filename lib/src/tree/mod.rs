//! An in-memory model of a layered filesystem: a tree of name-edges
//! over reference-counted inodes with hardlink sharing.
//!
//! Trees are built either from a guest filesystem walk or from OCI
//! layer tar streams, then diffed, streamed back out as a layer, or
//! reduced to a Bloom-filter sketch.

use std::cell::RefCell;
use std::rc::Rc;

pub(crate) mod diff;
pub(crate) mod guest;
pub(crate) mod layer;

/// Seconds and nanoseconds, as reported by `lstatns`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Timespec {
    pub(crate) sec: i64,
    pub(crate) nsec: i64,
}

impl Timespec {
    pub(crate) fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

/// The stat fields the model carries.  `dev`/`ino` are only
/// meaningful for hardlink bookkeeping during builds; `nlink`
/// mirrors the number of entries referring to the inode.
#[derive(Debug, Clone, Default)]
pub(crate) struct Stat {
    pub(crate) dev: u64,
    pub(crate) ino: u64,
    pub(crate) mode: u32,
    pub(crate) nlink: u64,
    pub(crate) uid: u64,
    pub(crate) gid: u64,
    pub(crate) rdev: u64,
    pub(crate) size: u64,
    pub(crate) atime: Timespec,
    pub(crate) mtime: Timespec,
    pub(crate) ctime: Timespec,
}

/// One extended attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Xattr {
    pub(crate) name: String,
    pub(crate) value: Vec<u8>,
}

/// Type-specific inode payload.
#[derive(Debug)]
pub(crate) enum Body {
    /// Regular file; carries the content digest when checksumming
    /// was requested at build time.
    Regular { sha256: Option<[u8; 32]> },
    /// Directory with its (uniquely named, ordered) children.
    Directory { children: Vec<Entry> },
    /// Symbolic link and its target.
    Symlink { target: String },
    /// Character/block device, fifo or socket.
    Other,
}

/// A file node shared by one or more entries.
#[derive(Debug)]
pub(crate) struct Inode {
    pub(crate) stat: Stat,
    pub(crate) xattrs: Vec<Xattr>,
    pub(crate) body: Body,
}

pub(crate) type InodeRef = Rc<RefCell<Inode>>;

/// A name-edge pointing at an inode.  Distinct entries may share an
/// inode (hardlinks); the inode's nlink tracks how many do.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) name: String,
    pub(crate) inode: InodeRef,
}

pub(crate) fn major(dev: u64) -> u64 {
    ((dev & 0x00000000000fff00) >> 8) | ((dev & 0xfffff00000000000) >> 32)
}

pub(crate) fn minor(dev: u64) -> u64 {
    (dev & 0x00000000000000ff) | ((dev & 0x00000ffffff00000) >> 12)
}

pub(crate) fn makedev(maj: u64, min: u64) -> u64 {
    ((maj & 0xfff) << 8)
        | ((maj & !0xfffu64) << 32)
        | (min & 0xff)
        | ((min & !0xffu64) << 12)
}

impl Inode {
    pub(crate) fn new(stat: Stat, body: Body) -> InodeRef {
        Rc::new(RefCell::new(Inode {
            stat,
            xattrs: Vec::new(),
            body,
        }))
    }

    /// An empty directory inode with the given mode bits.
    pub(crate) fn new_dir(mode: u32) -> InodeRef {
        let stat = Stat {
            mode: libc::S_IFDIR | (mode & 0o7777),
            nlink: 1,
            ..Default::default()
        };
        Inode::new(stat, Body::Directory { children: Vec::new() })
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.stat.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub(crate) fn is_regular(&self) -> bool {
        self.stat.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub(crate) fn children(&self) -> Option<&Vec<Entry>> {
        match &self.body {
            Body::Directory { children } => Some(children),
            _ => None,
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<Entry>> {
        match &mut self.body {
            Body::Directory { children } => Some(children),
            _ => None,
        }
    }
}

impl Entry {
    /// A fresh tree: a root entry named `/` over an empty
    /// `drwxr-xr-x` directory inode.
    pub(crate) fn new_root() -> Entry {
        Entry {
            name: "/".to_string(),
            inode: Inode::new_dir(0o755),
        }
    }

    /// Walk an absolute (or root-relative) path through directories
    /// only, returning the inode at the end.  Returns `None` when a
    /// component is missing.
    ///
    /// Descending through a non-directory parent is a caller bug and
    /// panics, matching the model's no-symlink-traversal contract.
    pub(crate) fn lookup(&self, path: &str) -> Option<InodeRef> {
        let mut cur = self.inode.clone();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            let next = {
                let inode = cur.borrow();
                if !inode.is_dir() {
                    panic!("Parent of {part} in {path} is not a directory");
                }
                inode
                    .children()
                    .unwrap()
                    .iter()
                    .find(|e| e.name == part)
                    .map(|e| e.inode.clone())
            };
            cur = next?;
        }
        Some(cur)
    }

    /// Sum the 4 KiB-block-rounded sizes of all regular files,
    /// recursing through directories.  Used to size target disks.
    pub(crate) fn disk_usage(&self) -> u64 {
        let inode = self.inode.borrow();
        match &inode.body {
            Body::Regular { .. } => inode.stat.size.div_ceil(4096) * 4096,
            Body::Directory { children } => children.iter().map(|c| c.disk_usage()).sum(),
            _ => 0,
        }
    }
}

/// Options for tree builds.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WalkFlags {
    /// Stream regular file contents through sha256.
    pub(crate) checksum: bool,
    /// Do not descend into btrfs snapshot roots whose subvolume
    /// UUID (or parent UUID) was already seen during this walk.
    pub(crate) skip_btrfs_snapshots: bool,
}

/// Visit every unique inode of a tree once, by `Rc` identity.
pub(crate) fn for_each_inode(root: &Entry, f: &mut impl FnMut(&InodeRef)) {
    fn visit(
        inode: &InodeRef,
        seen: &mut std::collections::HashSet<*const RefCell<Inode>>,
        f: &mut impl FnMut(&InodeRef),
    ) {
        if !seen.insert(Rc::as_ptr(inode)) {
            return;
        }
        f(inode);
        let children: Vec<InodeRef> = inode
            .borrow()
            .children()
            .map(|cs| cs.iter().map(|c| c.inode.clone()).collect())
            .unwrap_or_default();
        for c in &children {
            visit(c, seen, f);
        }
    }
    let mut seen = std::collections::HashSet::new();
    visit(&root.inode, &mut seen, f);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let root = Entry::new_root();
        let etc = Inode::new_dir(0o755);
        testutil::attach(&root.inode, "etc", etc.clone());
        testutil::attach(&etc, "passwd", testutil::regular(1, 100, None));
        assert!(root.lookup("/etc").is_some());
        assert!(root.lookup("/etc/passwd").is_some());
        assert!(root.lookup("etc/passwd").is_some());
        assert!(root.lookup("/etc/missing").is_none());
        assert!(root.lookup("/").is_some());
    }

    #[test]
    #[should_panic(expected = "not a directory")]
    fn test_lookup_through_file_panics() {
        let root = Entry::new_root();
        testutil::attach(&root.inode, "f", testutil::regular(1, 0, None));
        let _ = root.lookup("/f/x");
    }

    #[test]
    fn test_disk_usage() {
        let root = Entry::new_root();
        testutil::attach(&root.inode, "a", testutil::regular(1, 1, None));
        testutil::attach(&root.inode, "b", testutil::regular(2, 4096, None));
        testutil::attach(&root.inode, "c", testutil::regular(3, 4097, None));
        assert_eq!(root.disk_usage(), 4096 + 4096 + 8192);
    }

    #[test]
    fn test_dev_split() {
        let dev = makedev(259, 7);
        assert_eq!(major(dev), 259);
        assert_eq!(minor(dev), 7);
    }
}
