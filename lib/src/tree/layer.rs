//! Building trees from OCI layer streams and applying layers with
//! whiteout semantics on top of an existing tree.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context};
use fn_error_context::context;

use super::{Body, Entry, Inode, InodeRef, Stat, Timespec, WalkFlags, Xattr};
use crate::digest::new_sha256_hasher;
use crate::ociarchive::reader::LayerSource;
use crate::Result;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

// Inodes materialised from tar streams have no stable device/inode
// identity; hand out synthetic inode numbers so hardlink groups stay
// distinguishable across every tree built in this process.
static NEXT_SYNTHETIC_INO: AtomicU64 = AtomicU64::new(1);

fn alloc_ino() -> u64 {
    NEXT_SYNTHETIC_INO.fetch_add(1, Ordering::Relaxed)
}

/// Normalize `/foo`, `./foo`, `foo/`, … to `foo`; the root entry
/// itself normalizes to the empty string.
pub(crate) fn normalize_entry_name(name: &str) -> String {
    let name = name
        .strip_prefix("./")
        .or_else(|| name.strip_prefix('/'))
        .unwrap_or(name);
    let name = name.strip_suffix('/').unwrap_or(name);
    if name == "." {
        return String::new();
    }
    name.to_string()
}

fn split_dir_base(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

/// Resolve `path` to a directory inode under `root`; `path` must be
/// normalized.  Returns `None` when a component is missing or the
/// final inode is not a directory.  Descending *through* a
/// non-directory panics (see [`Entry::lookup`]).
fn resolve_dir(root: &Entry, path: &str) -> Option<InodeRef> {
    let inode = root.lookup(path)?;
    if !inode.borrow().is_dir() {
        return None;
    }
    Some(inode)
}

fn detach_child(dir: &InodeRef, name: &str) {
    let mut dir = dir.borrow_mut();
    let children = dir.children_mut().expect("directory");
    if let Some(pos) = children.iter().position(|e| e.name == name) {
        let entry = children.remove(pos);
        entry.inode.borrow_mut().stat.nlink -= 1;
    }
}

/// Times, ownership and xattrs carried in pax extension records.
#[derive(Debug, Default)]
pub(crate) struct PaxMeta {
    uid: Option<u64>,
    gid: Option<u64>,
    atime: Option<Timespec>,
    mtime: Option<Timespec>,
    ctime: Option<Timespec>,
    pub(crate) xattrs: Vec<Xattr>,
}

fn parse_pax_time(v: &str) -> Option<Timespec> {
    let v = v.trim();
    match v.split_once('.') {
        Some((sec, frac)) => {
            let sec = sec.parse().ok()?;
            let mut digits: String = frac.chars().filter(|c| c.is_ascii_digit()).collect();
            digits.truncate(9);
            while digits.len() < 9 {
                digits.push('0');
            }
            let nsec: i64 = digits.parse().ok()?;
            Some(Timespec { sec, nsec })
        }
        None => Some(Timespec {
            sec: v.parse().ok()?,
            nsec: 0,
        }),
    }
}

pub(crate) fn parse_pax_meta<R: Read>(entry: &mut tar::Entry<R>) -> Result<PaxMeta> {
    let mut meta = PaxMeta::default();
    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(meta);
    };
    for ext in extensions {
        let ext = ext?;
        let Ok(key) = ext.key() else { continue };
        let value = ext.value_bytes();
        if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
            meta.xattrs.push(Xattr {
                name: name.to_string(),
                value: value.to_vec(),
            });
            continue;
        }
        let text = String::from_utf8_lossy(value);
        match key {
            "atime" => meta.atime = parse_pax_time(&text),
            "mtime" => meta.mtime = parse_pax_time(&text),
            "ctime" => meta.ctime = parse_pax_time(&text),
            "uid" => meta.uid = text.trim().parse().ok(),
            "gid" => meta.gid = text.trim().parse().ok(),
            _ => {}
        }
    }
    Ok(meta)
}

fn mode_from_entry<R: Read>(entry: &tar::Entry<R>) -> Result<u32> {
    let header = entry.header();
    let perms = header.mode()? & 0o7777;
    let fmt = match header.entry_type() {
        tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
            libc::S_IFREG
        }
        tar::EntryType::Directory => libc::S_IFDIR,
        tar::EntryType::Symlink => libc::S_IFLNK,
        tar::EntryType::Char => libc::S_IFCHR,
        tar::EntryType::Block => libc::S_IFBLK,
        tar::EntryType::Fifo => libc::S_IFIFO,
        o => return Err(anyhow!("Unhandled tar entry type {:?}", o)),
    };
    Ok(fmt | perms)
}

pub(crate) fn stat_from_entry<R: Read>(entry: &tar::Entry<R>, meta: &PaxMeta) -> Result<Stat> {
    let header = entry.header();
    let mode = mode_from_entry(entry)?;
    let rdev = match header.entry_type() {
        tar::EntryType::Char | tar::EntryType::Block => {
            let maj = header.device_major()?.unwrap_or(0) as u64;
            let min = header.device_minor()?.unwrap_or(0) as u64;
            super::makedev(maj, min)
        }
        _ => 0,
    };
    let mtime = meta.mtime.unwrap_or(Timespec {
        sec: header.mtime()? as i64,
        nsec: 0,
    });
    Ok(Stat {
        dev: 0,
        ino: alloc_ino(),
        mode,
        nlink: 1,
        uid: meta.uid.unwrap_or(header.uid()?),
        gid: meta.gid.unwrap_or(header.gid()?),
        rdev,
        size: if mode & libc::S_IFMT == libc::S_IFREG {
            header.size()?
        } else {
            0
        },
        atime: meta.atime.unwrap_or_default(),
        mtime,
        ctime: meta.ctime.unwrap_or_default(),
    })
}

/// Stream an entry's contents through sha256, padding sparse holes
/// and short tails with zero bytes up to the declared size.
fn checksum_from_entry<R: Read>(entry: &mut tar::Entry<R>, size: u64) -> Result<[u8; 32]> {
    let mut hasher = new_sha256_hasher()?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut read_total = 0u64;
    loop {
        let n = entry.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
        read_total += n as u64;
    }
    if read_total < size {
        buf.fill(0);
        let mut remaining = size - read_total;
        while remaining > 0 {
            let n = (buf.len() as u64).min(remaining) as usize;
            hasher.update(&buf[..n])?;
            remaining -= n as u64;
        }
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finish()?);
    Ok(out)
}

fn body_for_mode(mode: u32, symlink_target: Option<String>, sha256: Option<[u8; 32]>) -> Body {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => Body::Directory { children: Vec::new() },
        libc::S_IFLNK => Body::Symlink {
            target: symlink_target.unwrap_or_default(),
        },
        libc::S_IFREG => Body::Regular { sha256 },
        _ => Body::Other,
    }
}

/// Point the entry `path` at `target` (hardlink), creating it if
/// needed.  The previous inode, if any, loses a reference.
fn link_entry(root: &mut Entry, path: &str, target: InodeRef) -> Result<()> {
    let (dir, base) = split_dir_base(path);
    let parent = resolve_dir(root, dir)
        .with_context(|| format!("Missing parent directory entries for {path}"))?;
    target.borrow_mut().stat.nlink += 1;
    let mut parent = parent.borrow_mut();
    let children = parent.children_mut().expect("directory");
    match children.iter_mut().find(|e| e.name == base) {
        Some(existing) => {
            existing.inode.borrow_mut().stat.nlink -= 1;
            existing.inode = target;
        }
        None => children.push(Entry {
            name: base.to_string(),
            inode: target,
        }),
    }
    Ok(())
}

#[context("Applying layer additions")]
fn apply_layer_addition(
    root: &mut Entry,
    layer: &mut dyn LayerSource,
    flags: &WalkFlags,
) -> Result<()> {
    let mut archive = layer.open()?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?;
        let raw_path = raw_path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid non-utf8 path {:?}", raw_path))?
            .to_owned();
        let path = normalize_entry_name(&raw_path);
        let (_, base) = split_dir_base(&path);
        if base.starts_with(WHITEOUT_PREFIX) {
            // Consumed by the subtract pass.
            continue;
        }

        if entry.header().entry_type() == tar::EntryType::Link {
            let target = entry
                .link_name()?
                .ok_or_else(|| anyhow!("Invalid empty hardlink {path}"))?;
            let target = target
                .to_str()
                .ok_or_else(|| anyhow!("Invalid non-utf8 hardlink target"))?;
            let target = normalize_entry_name(target);
            let target_inode = root
                .lookup(&target)
                .with_context(|| format!("Hardlink target {target} absent at apply time"))?;
            link_entry(root, &path, target_inode)?;
            continue;
        }

        let meta = parse_pax_meta(&mut entry)?;
        let stat = stat_from_entry(&entry, &meta)?;
        let symlink_target = match entry.header().entry_type() {
            tar::EntryType::Symlink => Some(
                entry
                    .link_name()?
                    .ok_or_else(|| anyhow!("Invalid symlink {path}"))?
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid non-utf8 symlink target"))?
                    .to_string(),
            ),
            _ => None,
        };
        let sha256 = if flags.checksum && stat.mode & libc::S_IFMT == libc::S_IFREG {
            Some(checksum_from_entry(&mut entry, stat.size)?)
        } else {
            None
        };

        if path.is_empty() {
            // The layer re-states the root directory: refresh its
            // metadata, keep the children.
            let mut inode = root.inode.borrow_mut();
            let nlink = inode.stat.nlink;
            inode.stat = stat;
            inode.stat.nlink = nlink;
            inode.xattrs = meta.xattrs;
            continue;
        }

        let (dir, base) = split_dir_base(&path);
        let parent = resolve_dir(root, dir)
            .with_context(|| format!("Missing parent directory entries for {path}"))?;
        let mut parent = parent.borrow_mut();
        let children = parent.children_mut().expect("directory");
        match children.iter_mut().find(|e| e.name == base) {
            Some(existing) => {
                let shared = existing.inode.borrow().stat.nlink > 1;
                if shared {
                    // Copy-on-write: detach from the hardlink group
                    // before replacing the contents.
                    existing.inode.borrow_mut().stat.nlink -= 1;
                    let mode = stat.mode;
                    let inode = Inode::new(stat, body_for_mode(mode, symlink_target, sha256));
                    inode.borrow_mut().xattrs = meta.xattrs;
                    existing.inode = inode;
                } else {
                    let mut inode = existing.inode.borrow_mut();
                    let both_dirs = inode.is_dir() && stat.mode & libc::S_IFMT == libc::S_IFDIR;
                    inode.stat = stat;
                    inode.stat.nlink = 1;
                    inode.xattrs = meta.xattrs;
                    // A directory re-stated by a later layer keeps
                    // its children.
                    if !both_dirs {
                        inode.body = body_for_mode(inode.stat.mode, symlink_target, sha256);
                    }
                }
            }
            None => {
                let mode = stat.mode;
                let inode = Inode::new(stat, body_for_mode(mode, symlink_target, sha256));
                inode.borrow_mut().xattrs = meta.xattrs;
                children.push(Entry {
                    name: base.to_string(),
                    inode,
                });
            }
        }
    }
    Ok(())
}

/// Delete the entries named by a layer's whiteout markers.
#[context("Applying layer whiteouts")]
fn apply_layer_subtraction(root: &mut Entry, layer: &mut dyn LayerSource) -> Result<()> {
    let mut archive = layer.open()?;
    for entry in archive.entries()? {
        let entry = entry?;
        let raw_path = entry.path()?;
        let raw_path = raw_path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid non-utf8 path {:?}", raw_path))?
            .to_owned();
        let path = normalize_entry_name(&raw_path);
        let (dir, base) = split_dir_base(&path);
        if !base.starts_with(WHITEOUT_PREFIX) {
            continue;
        }
        // A whiteout in a directory that does not (yet) exist, or
        // whose parent is not a directory, is silently skipped.
        let Some(dir_inode) = resolve_dir(root, dir) else {
            continue;
        };
        if base == OPAQUE_WHITEOUT {
            let mut dir_inode = dir_inode.borrow_mut();
            let children = dir_inode.children_mut().expect("directory");
            for entry in children.drain(..) {
                entry.inode.borrow_mut().stat.nlink -= 1;
            }
        } else {
            let victim = &base[WHITEOUT_PREFIX.len()..];
            if victim.is_empty() {
                continue;
            }
            detach_child(&dir_inode, victim);
        }
    }
    Ok(())
}

/// Build a tree from a single layer applied over an empty root.
pub(crate) fn from_oci_layer(layer: &mut dyn LayerSource, flags: &WalkFlags) -> Result<Entry> {
    let mut root = Entry::new_root();
    apply_layer_addition(&mut root, layer, flags)?;
    Ok(root)
}

/// Apply one layer on top of `root`: whiteout pass, rewind, then
/// addition pass.
pub(crate) fn apply_oci_layer(
    root: &mut Entry,
    layer: &mut dyn LayerSource,
    flags: &WalkFlags,
) -> Result<()> {
    apply_layer_subtraction(root, layer)?;
    apply_layer_addition(root, layer, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ociarchive::reader::MemLayer;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn checksum_flags() -> WalkFlags {
        WalkFlags {
            checksum: true,
            ..Default::default()
        }
    }

    struct TarBuf(tar::Builder<Vec<u8>>);

    impl TarBuf {
        fn new() -> Self {
            TarBuf(tar::Builder::new(Vec::new()))
        }

        fn header(mode: u32, size: u64, t: tar::EntryType) -> tar::Header {
            let mut h = tar::Header::new_ustar();
            h.set_entry_type(t);
            h.set_mode(mode);
            h.set_uid(0);
            h.set_gid(0);
            h.set_mtime(7);
            h.set_size(size);
            h
        }

        fn file(&mut self, path: &str, data: &[u8]) -> &mut Self {
            let mut h = Self::header(0o644, data.len() as u64, tar::EntryType::Regular);
            self.0.append_data(&mut h, path, data).unwrap();
            self
        }

        fn dir(&mut self, path: &str) -> &mut Self {
            let mut h = Self::header(0o755, 0, tar::EntryType::Directory);
            self.0.append_data(&mut h, path, std::io::empty()).unwrap();
            self
        }

        fn hardlink(&mut self, path: &str, target: &str) -> &mut Self {
            let mut h = Self::header(0o644, 0, tar::EntryType::Link);
            self.0.append_link(&mut h, path, target).unwrap();
            self
        }

        fn finish(self) -> MemLayer {
            MemLayer(self.0.into_inner().unwrap())
        }
    }

    /// The number of entries referring to each inode must equal its
    /// link count.
    fn assert_link_invariant(root: &Entry) {
        let mut counts: HashMap<*const std::cell::RefCell<Inode>, u64> = HashMap::new();
        fn visit(e: &Entry, counts: &mut HashMap<*const std::cell::RefCell<Inode>, u64>) {
            *counts.entry(Rc::as_ptr(&e.inode)).or_default() += 1;
            if let Some(children) = e.inode.borrow().children() {
                for c in children {
                    visit(c, counts);
                }
            }
        }
        visit(root, &mut counts);
        let mut checked = std::collections::HashSet::new();
        fn walk(
            e: &Entry,
            counts: &HashMap<*const std::cell::RefCell<Inode>, u64>,
            checked: &mut std::collections::HashSet<*const std::cell::RefCell<Inode>>,
        ) {
            let ptr = Rc::as_ptr(&e.inode);
            if checked.insert(ptr) {
                assert_eq!(
                    e.inode.borrow().stat.nlink,
                    counts[&ptr],
                    "nlink mismatch for {}",
                    e.name
                );
            }
            if let Some(children) = e.inode.borrow().children() {
                for c in children {
                    walk(c, counts, checked);
                }
            }
        }
        walk(root, &counts, &mut checked);
    }

    #[test]
    fn test_normalize_entry_name() {
        for (input, expected) in [
            ("/foo", "foo"),
            ("./foo", "foo"),
            ("foo/", "foo"),
            ("./foo/bar/", "foo/bar"),
            (".", ""),
            ("./", ""),
            ("foo", "foo"),
        ] {
            assert_eq!(normalize_entry_name(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_basic_build_and_checksum() -> Result<()> {
        let mut tb = TarBuf::new();
        tb.dir("etc").file("etc/hosts", b"127.0.0.1\n");
        let mut layer = tb.finish();
        let tree = from_oci_layer(&mut layer, &checksum_flags())?;
        let hosts = tree.lookup("/etc/hosts").unwrap();
        let hosts = hosts.borrow();
        assert_eq!(hosts.stat.size, 10);
        let Body::Regular { sha256: Some(sum) } = &hosts.body else {
            panic!("expected checksummed regular file");
        };
        assert_eq!(
            hex::encode(sum),
            crate::digest::sha256_hex_of_slice(b"127.0.0.1\n")?
        );
        assert_link_invariant(&tree);
        Ok(())
    }

    #[test]
    fn test_hardlink_grouping() -> Result<()> {
        let mut tb = TarBuf::new();
        tb.file("foo", b"ABC").hardlink("bar", "foo");
        let mut layer = tb.finish();
        let tree = from_oci_layer(&mut layer, &checksum_flags())?;
        let foo = tree.lookup("/foo").unwrap();
        let bar = tree.lookup("/bar").unwrap();
        assert!(Rc::ptr_eq(&foo, &bar));
        assert_eq!(foo.borrow().stat.nlink, 2);
        assert_link_invariant(&tree);
        Ok(())
    }

    #[test]
    fn test_whiteout_and_opaque() -> Result<()> {
        let mut base = TarBuf::new();
        base.dir("dir")
            .file("dir/x", b"x")
            .file("dir/y", b"y")
            .file("a", b"")
            .file("b", b"");
        let mut layer = base.finish();
        let mut tree = from_oci_layer(&mut layer, &checksum_flags())?;

        // `./dir/.wh.x` removes /dir/x.
        let mut wh = TarBuf::new();
        wh.file("./dir/.wh.x", b"");
        apply_oci_layer(&mut tree, &mut wh.finish(), &checksum_flags())?;
        assert!(tree.lookup("/dir/x").is_none());
        assert!(tree.lookup("/dir/y").is_some());

        // `.wh.a` at the root removes /a only.
        let mut wh = TarBuf::new();
        wh.file(".wh.a", b"");
        apply_oci_layer(&mut tree, &mut wh.finish(), &checksum_flags())?;
        assert!(tree.lookup("/a").is_none());
        assert!(tree.lookup("/b").is_some());

        // The opaque marker clears all children of its directory.
        let mut wh = TarBuf::new();
        wh.file("./dir/.wh..wh..opq", b"");
        apply_oci_layer(&mut tree, &mut wh.finish(), &checksum_flags())?;
        let dir = tree.lookup("/dir").unwrap();
        assert!(dir.borrow().children().unwrap().is_empty());
        assert_link_invariant(&tree);
        Ok(())
    }

    #[test]
    fn test_whiteout_in_missing_dir_skipped() -> Result<()> {
        let mut base = TarBuf::new();
        base.file("f", b"");
        let mut tree = from_oci_layer(&mut base.finish(), &checksum_flags())?;
        let mut wh = TarBuf::new();
        wh.file("nodir/.wh.x", b"").file("f/.wh.y", b"");
        // Both parents are unusable (absent / not a directory); the
        // markers are skipped, and the data pass adds nothing.
        apply_oci_layer(&mut tree, &mut wh.finish(), &checksum_flags())?;
        assert!(tree.lookup("/f").is_some());
        Ok(())
    }

    #[test]
    fn test_directory_update_keeps_children() -> Result<()> {
        let mut base = TarBuf::new();
        base.dir("etc").file("etc/hosts", b"x");
        let mut tree = from_oci_layer(&mut base.finish(), &checksum_flags())?;

        // A later layer re-states /etc with a different mode.
        let mut update = TarBuf::new();
        let mut h = TarBuf::header(0o700, 0, tar::EntryType::Directory);
        update.0.append_data(&mut h, "etc", std::io::empty())?;
        apply_oci_layer(&mut tree, &mut update.finish(), &checksum_flags())?;

        let etc = tree.lookup("/etc").unwrap();
        assert_eq!(etc.borrow().stat.mode & 0o7777, 0o700);
        assert!(tree.lookup("/etc/hosts").is_some());
        Ok(())
    }

    #[test]
    fn test_replace_hardlinked_entry_detaches() -> Result<()> {
        let mut base = TarBuf::new();
        base.file("foo", b"ABC").hardlink("bar", "foo");
        let mut tree = from_oci_layer(&mut base.finish(), &checksum_flags())?;

        // Overwriting one name must not affect the other link.
        let mut update = TarBuf::new();
        update.file("bar", b"NEW!");
        apply_oci_layer(&mut tree, &mut update.finish(), &checksum_flags())?;

        let foo = tree.lookup("/foo").unwrap();
        let bar = tree.lookup("/bar").unwrap();
        assert!(!Rc::ptr_eq(&foo, &bar));
        assert_eq!(foo.borrow().stat.nlink, 1);
        assert_eq!(bar.borrow().stat.nlink, 1);
        assert_eq!(bar.borrow().stat.size, 4);
        assert_link_invariant(&tree);
        Ok(())
    }

    #[test]
    fn test_pax_time_parse() {
        assert_eq!(
            parse_pax_time("1700000000.25"),
            Some(Timespec {
                sec: 1700000000,
                nsec: 250000000
            })
        );
        assert_eq!(
            parse_pax_time("12"),
            Some(Timespec { sec: 12, nsec: 0 })
        );
        assert_eq!(
            parse_pax_time("5.123456789123"),
            Some(Timespec {
                sec: 5,
                nsec: 123456789
            })
        );
    }

    #[test]
    fn test_short_payload_is_zero_padded() -> Result<()> {
        // A declared size larger than the stored bytes hashes as if
        // the tail were zeros.
        let mut hasher = crate::digest::new_sha256_hasher()?;
        hasher.update(b"ab\0\0")?;
        let expected = hex::encode(hasher.finish()?);

        let mut tb = TarBuf::new();
        tb.file("f", b"ab");
        let mut archive = tar::Archive::new(std::io::Cursor::new(tb.0.into_inner()?));
        let mut entry = archive.entries()?.next().unwrap()?;
        let sum = checksum_from_entry(&mut entry, 4)?;
        assert_eq!(hex::encode(sum), expected);
        Ok(())
    }
}
