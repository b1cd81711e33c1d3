//! Diffing two trees into a minimal new layer.
//!
//! The same walk runs in three modes: actually emitting tar entries,
//! dry-run byte accounting (to decide whether reusing a source
//! image's layers pays off), and a short-circuiting subtree
//! difference test used to decide whether a directory must itself be
//! re-emitted.

use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::{Body, Entry, Inode, InodeRef};
use crate::ociarchive::layer::LayerBuilder;
use crate::Result;

/// Volatile directories never descended into.
const SKIP_DIRS: &[&str] = &["/tmp/", "/run/", "/var/tmp/", "/var/cache/"];

const RECORD: u64 = 512;

/// Supplies regular-file bytes for entries being emitted.
pub(crate) trait ContentSource {
    /// Open the contents of the file at a guest-absolute path.
    fn open(&mut self, path: &Utf8Path) -> Result<Box<dyn Read + '_>>;
}

fn dir_skipped(path: &Utf8Path) -> bool {
    let with_slash = format!("{path}/");
    SKIP_DIRS.contains(&with_slash.as_str())
}

fn payload_records(size: u64) -> u64 {
    size.div_ceil(RECORD) * RECORD
}

fn xattrs_differ(a: &Inode, b: &Inode) -> bool {
    a.xattrs != b.xattrs
}

/// The inode-level difference relation: stat (minus ctime, with
/// atime only when both sides carry one), xattrs, content digest and
/// symlink target.
fn inode_differs(a: &Inode, b: &Inode) -> bool {
    if a.stat.mode != b.stat.mode || a.stat.uid != b.stat.uid || a.stat.gid != b.stat.gid {
        return true;
    }
    let fmt = b.stat.mode & libc::S_IFMT;
    if matches!(fmt, libc::S_IFCHR | libc::S_IFBLK) && a.stat.rdev != b.stat.rdev {
        return true;
    }
    if fmt == libc::S_IFREG && a.stat.size != b.stat.size {
        return true;
    }
    if a.stat.mtime != b.stat.mtime {
        return true;
    }
    if !a.stat.atime.is_zero() && !b.stat.atime.is_zero() && a.stat.atime != b.stat.atime {
        return true;
    }
    if xattrs_differ(a, b) {
        return true;
    }
    match (&a.body, &b.body) {
        (Body::Regular { sha256: sa }, Body::Regular { sha256: sb }) => sa != sb,
        (Body::Symlink { target: ta }, Body::Symlink { target: tb }) => ta != tb,
        _ => false,
    }
}

/// Do the children of two directory inodes differ anywhere below?
fn children_differ(a: &InodeRef, b: &InodeRef, path: &Utf8Path) -> bool {
    if dir_skipped(path) {
        return false;
    }
    let a = a.borrow();
    let b = b.borrow();
    let a_children = a.children().expect("directory");
    let b_children = b.children().expect("directory");
    for ac in a_children {
        if !b_children.iter().any(|bc| bc.name == ac.name) {
            return true;
        }
    }
    for bc in b_children {
        let Some(ac) = a_children.iter().find(|ac| ac.name == bc.name) else {
            return true;
        };
        if subtree_differs(&ac.inode, &bc.inode, &path.join(&bc.name)) {
            return true;
        }
    }
    false
}

fn subtree_differs(a: &InodeRef, b: &InodeRef, path: &Utf8Path) -> bool {
    if inode_differs(&a.borrow(), &b.borrow()) {
        return true;
    }
    let both_dirs = a.borrow().is_dir() && b.borrow().is_dir();
    both_dirs && children_differ(a, b, path)
}

/// Whether two trees are equal under the diff's relation.
pub(crate) fn trees_differ(a: &Entry, b: &Entry) -> bool {
    subtree_differs(&a.inode, &b.inode, Utf8Path::new("/"))
}

enum Sink<'a> {
    Count,
    Layer {
        layer: &'a mut LayerBuilder,
        content: &'a mut dyn ContentSource,
    },
}

struct DiffWalk<'a> {
    sink: Sink<'a>,
    bytes: u64,
}

impl DiffWalk<'_> {
    fn emit_inode(&mut self, path: &Utf8Path, inode_ref: &InodeRef) -> Result<()> {
        let inode = inode_ref.borrow();
        match &mut self.sink {
            Sink::Count => {
                self.bytes += RECORD;
                if inode.is_regular() {
                    self.bytes += payload_records(inode.stat.size);
                }
            }
            Sink::Layer { layer, content } => {
                if inode.is_regular() && !layer.is_seen_link(&inode) {
                    self.bytes += RECORD + payload_records(inode.stat.size);
                    let mut data = content.open(path)?;
                    layer.append_inode(path, &inode, Some(data.as_mut()))?;
                } else {
                    self.bytes += RECORD;
                    layer.append_inode(path, &inode, None)?;
                }
            }
        }
        Ok(())
    }

    fn emit_whiteout(&mut self, dir: &Utf8Path, name: &str) -> Result<()> {
        self.bytes += RECORD;
        if let Sink::Layer { layer, .. } = &mut self.sink {
            layer.append_whiteout(dir, name)?;
        }
        Ok(())
    }

    /// Emit an entry and everything below it.
    fn emit_subtree(&mut self, path: &Utf8Path, entry: &InodeRef) -> Result<()> {
        self.emit_inode(path, entry)?;
        let is_dir = entry.borrow().is_dir();
        if is_dir && !dir_skipped(path) {
            let children: Vec<(String, InodeRef)> = entry
                .borrow()
                .children()
                .expect("directory")
                .iter()
                .map(|c| (c.name.clone(), c.inode.clone()))
                .collect();
            for (name, child) in children {
                self.emit_subtree(&path.join(name), &child)?;
            }
        }
        Ok(())
    }

    /// Emit the differences between the children of two directories.
    fn diff_children(&mut self, a: &InodeRef, b: &InodeRef, path: &Utf8Path) -> Result<()> {
        if dir_skipped(path) {
            return Ok(());
        }
        let a_names: Vec<String> = a
            .borrow()
            .children()
            .expect("directory")
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let b_children: Vec<(String, InodeRef)> = b
            .borrow()
            .children()
            .expect("directory")
            .iter()
            .map(|c| (c.name.clone(), c.inode.clone()))
            .collect();

        for name in &a_names {
            if !b_children.iter().any(|(n, _)| n == name) {
                self.emit_whiteout(path, name)?;
            }
        }
        for (name, bc) in b_children {
            let child_path = path.join(&name);
            let ac = a
                .borrow()
                .children()
                .expect("directory")
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.inode.clone());
            match ac {
                None => self.emit_subtree(&child_path, &bc)?,
                Some(ac) => {
                    let both_dirs = ac.borrow().is_dir() && bc.borrow().is_dir();
                    if both_dirs {
                        let meta_changed = inode_differs(&ac.borrow(), &bc.borrow());
                        let below_changed = children_differ(&ac, &bc, &child_path);
                        if meta_changed || below_changed {
                            self.emit_inode(&child_path, &bc)?;
                        }
                        if below_changed {
                            self.diff_children(&ac, &bc, &child_path)?;
                        }
                    } else if subtree_differs(&ac, &bc, &child_path) {
                        // Type change or content change; the new
                        // entry replaces the old wholesale.
                        self.emit_subtree(&child_path, &bc)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn run(&mut self, a: Option<&Entry>, b: &Entry) -> Result<u64> {
        let root = Utf8Path::new("/");
        match a {
            None => {
                // Fresh emission against an empty baseline.
                let children: Vec<(String, InodeRef)> = b
                    .inode
                    .borrow()
                    .children()
                    .expect("directory")
                    .iter()
                    .map(|c| (c.name.clone(), c.inode.clone()))
                    .collect();
                for (name, child) in children {
                    self.emit_subtree(&Utf8PathBuf::from(format!("/{name}")), &child)?;
                }
            }
            Some(a) => {
                self.diff_children(&a.inode, &b.inode, root)?;
            }
        }
        Ok(self.bytes)
    }
}

/// Emit the layer turning `a` (empty when `None`) into `b`, and
/// return the number of tar bytes written (before end-of-archive
/// records).
#[context("Building layer")]
pub(crate) fn build_layer(
    a: Option<&Entry>,
    b: &Entry,
    layer: &mut LayerBuilder,
    content: &mut dyn ContentSource,
) -> Result<u64> {
    let mut walk = DiffWalk {
        sink: Sink::Layer { layer, content },
        bytes: 0,
    };
    walk.run(a, b)
}

/// Byte accounting only: what `build_layer` would emit.  The two
/// end-of-archive records are not included.
pub(crate) fn estimate_layer(a: Option<&Entry>, b: &Entry) -> Result<u64> {
    let mut walk = DiffWalk {
        sink: Sink::Count,
        bytes: 0,
    };
    walk.run(a, b)
}


#[cfg(test)]
mod tests {
    use super::testcontent::MapContent;
    use super::*;
    use crate::ociarchive::reader::MemLayer;
    use crate::ociarchive::Compression;
    use crate::tree::layer::from_oci_layer;
    use crate::tree::testutil::{attach, regular};
    use crate::tree::{Stat, Timespec, WalkFlags};
    use crate::Result;

    fn sha(data: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        let mut h = crate::digest::new_sha256_hasher().unwrap();
        h.update(data).unwrap();
        out.copy_from_slice(&h.finish().unwrap());
        out
    }

    fn reg_with(ino: u64, data: &[u8]) -> InodeRef {
        regular(ino, data.len() as u64, Some(sha(data)))
    }

    fn dir_with_mtime(sec: i64) -> InodeRef {
        let inode = Inode::new_dir(0o755);
        inode.borrow_mut().stat.mtime = Timespec { sec, nsec: 0 };
        inode
    }

    /// Round-trip a built layer back into a tree.
    fn tree_of_layer(finished: &crate::ociarchive::layer::FinishedLayer) -> Result<Entry> {
        let crate::ociarchive::writer::BlobSource::File { path, .. } = finished.blob_source()
        else {
            panic!("expected file blob");
        };
        let mut mem = MemLayer(std::fs::read(path)?);
        from_oci_layer(
            &mut mem,
            &WalkFlags {
                checksum: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_trees_equal() {
        let a = Entry::new_root();
        attach(&a.inode, "f", reg_with(1, b"hello"));
        let b = Entry::new_root();
        attach(&b.inode, "f", reg_with(2, b"hello"));
        assert!(!trees_differ(&a, &b));
    }

    #[test]
    fn test_estimate_against_empty() -> Result<()> {
        let b = Entry::new_root();
        attach(&b.inode, "f", reg_with(1, &[7u8; 600]));
        // One header record plus 600 bytes rounded to two records.
        assert_eq!(estimate_layer(None, &b)?, 512 + 1024);
        Ok(())
    }

    #[test]
    fn test_whiteout_emission_and_roundtrip() -> Result<()> {
        let a = Entry::new_root();
        attach(&a.inode, "a", reg_with(1, b""));
        attach(&a.inode, "b", reg_with(2, b""));
        let b = Entry::new_root();
        attach(&b.inode, "b", reg_with(3, b""));

        let mut lb = LayerBuilder::new(Compression::None, None)?;
        let mut content = MapContent::default();
        build_layer(Some(&a), &b, &mut lb, &mut content)?;
        let finished = lb.finish()?;

        // Applying the emitted layer onto a again must yield b.
        let crate::ociarchive::writer::BlobSource::File { path, .. } = finished.blob_source()
        else {
            panic!("expected file blob");
        };
        let mut mem = MemLayer(std::fs::read(path)?);
        let mut target = Entry::new_root();
        attach(&target.inode, "a", reg_with(4, b""));
        attach(&target.inode, "b", reg_with(5, b""));
        crate::tree::layer::apply_oci_layer(
            &mut target,
            &mut mem,
            &WalkFlags {
                checksum: true,
                ..Default::default()
            },
        )?;
        assert!(!trees_differ(&target, &b));
        assert!(target.lookup("/a").is_none());
        Ok(())
    }

    #[test]
    fn test_fresh_emission_roundtrip() -> Result<()> {
        let b = Entry::new_root();
        let etc = dir_with_mtime(50);
        attach(&b.inode, "etc", etc.clone());
        attach(&etc, "passwd", reg_with(1, b"root:x:0:0\n"));
        let sub = dir_with_mtime(60);
        attach(&etc, "sub", sub.clone());
        attach(
            &sub,
            "link",
            {
                let inode = Inode::new(
                    Stat {
                        mode: libc::S_IFLNK | 0o777,
                        nlink: 1,
                        ..Default::default()
                    },
                    Body::Symlink {
                        target: "../passwd".into(),
                    },
                );
                inode
            },
        );

        let mut lb = LayerBuilder::new(Compression::None, None)?;
        let mut content = MapContent::default();
        content
            .0
            .insert("/etc/passwd".into(), b"root:x:0:0\n".to_vec());
        build_layer(None, &b, &mut lb, &mut content)?;
        let finished = lb.finish()?;

        let rebuilt = tree_of_layer(&finished)?;
        assert!(!trees_differ(&rebuilt, &b));
        Ok(())
    }

    #[test]
    fn test_idempotent_apply() -> Result<()> {
        let b = Entry::new_root();
        let d = dir_with_mtime(9);
        attach(&b.inode, "d", d.clone());
        attach(&d, "f", reg_with(1, b"xyz"));

        let mut lb = LayerBuilder::new(Compression::None, None)?;
        let mut content = MapContent::default();
        content.0.insert("/d/f".into(), b"xyz".to_vec());
        build_layer(None, &b, &mut lb, &mut content)?;
        let finished = lb.finish()?;
        let crate::ociarchive::writer::BlobSource::File { path, .. } = finished.blob_source()
        else {
            panic!("expected file blob");
        };
        let bytes = std::fs::read(path)?;

        let flags = WalkFlags {
            checksum: true,
            ..Default::default()
        };
        let mut once = from_oci_layer(&mut MemLayer(bytes.clone()), &flags)?;
        crate::tree::layer::apply_oci_layer(&mut once, &mut MemLayer(bytes), &flags)?;
        assert!(!trees_differ(&once, &b));
        Ok(())
    }

    #[test]
    fn test_hardlink_roundtrip() -> Result<()> {
        let b = Entry::new_root();
        let shared = reg_with(77, b"ABC");
        shared.borrow_mut().stat.nlink = 2;
        attach(&b.inode, "foo", shared.clone());
        attach(&b.inode, "bar", shared.clone());

        let mut lb = LayerBuilder::new(Compression::None, None)?;
        let mut content = MapContent::default();
        content.0.insert("/foo".into(), b"ABC".to_vec());
        content.0.insert("/bar".into(), b"ABC".to_vec());
        let bytes = build_layer(None, &b, &mut lb, &mut content)?;
        // Two headers, one 3-byte payload rounded to one record.
        assert_eq!(bytes, 512 + 512 + 512);
        let finished = lb.finish()?;

        let rebuilt = tree_of_layer(&finished)?;
        let foo = rebuilt.lookup("/foo").unwrap();
        let bar = rebuilt.lookup("/bar").unwrap();
        assert!(std::rc::Rc::ptr_eq(&foo, &bar));
        assert_eq!(foo.borrow().stat.nlink, 2);
        Ok(())
    }

    #[test]
    fn test_skip_dirs() -> Result<()> {
        let a = Entry::new_root();
        let a_tmp = dir_with_mtime(1);
        attach(&a.inode, "tmp", a_tmp.clone());
        attach(&a_tmp, "junk", reg_with(1, b"junk"));
        let b = Entry::new_root();
        let b_tmp = dir_with_mtime(1);
        attach(&b.inode, "tmp", b_tmp.clone());
        attach(&b_tmp, "other", reg_with(2, b"other"));

        // Differences confined to /tmp are invisible.
        assert!(!trees_differ(&a, &b));
        assert_eq!(estimate_layer(Some(&a), &b)?, 0);
        Ok(())
    }

    #[test]
    fn test_changed_child_reemits_directory() -> Result<()> {
        let mk = |content: &[u8]| -> Result<Entry> {
            let root = Entry::new_root();
            let d = dir_with_mtime(5);
            attach(&root.inode, "d", d.clone());
            attach(&d, "f", reg_with(1, content));
            Ok(root)
        };
        let a = mk(b"old")?;
        let b = mk(b"newer!")?;
        // Directory header + file header + one payload record.
        assert_eq!(estimate_layer(Some(&a), &b)?, 512 + 512 + 512);
        Ok(())
    }
}
