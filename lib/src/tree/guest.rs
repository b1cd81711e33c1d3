//! Building a tree from a mounted guest filesystem.

use std::collections::{HashMap, HashSet};
use std::io::Read;

use fn_error_context::context;

use super::{major, Body, Entry, Inode, InodeRef, Timespec, WalkFlags};
use crate::digest::new_sha256_hasher;
use crate::guest::GuestHandle;
use crate::Result;

const CHECKSUM_BUFSZ: usize = 4 * 1024 * 1024;

// btrfs surfaces two magic inode numbers: 2 is the read-only empty
// directory shown inside an unpopulated subvolume, 256 is the root
// of every subvolume.
const BTRFS_EMPTY_SUBVOL_DIR_OBJECTID: u64 = 2;
const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

struct WalkCtx {
    // (dev, ino) of multiply-linked inodes still waiting for some of
    // their links, with the expected link count.  An entry is
    // discarded once all links were seen, bounding the table.
    hardlinks: HashMap<(u64, u64), (InodeRef, u64)>,
    btrfs_uuids: HashSet<String>,
}

fn is_btrfs_subvolume_seen(g: &GuestHandle, path: &str, ctx: &mut WalkCtx) -> bool {
    let Ok(info) = g.btrfs_subvolume_show(path) else {
        return false;
    };
    let mut uuid_skip = false;
    let mut parent_skip = false;
    if let Some(uuid) = info.get("UUID") {
        uuid_skip = ctx.btrfs_uuids.contains(uuid);
        if !uuid_skip {
            ctx.btrfs_uuids.insert(uuid.clone());
        }
    }
    if let Some(parent) = info.get("Parent UUID") {
        parent_skip = ctx.btrfs_uuids.contains(parent);
    }
    uuid_skip || parent_skip
}

#[context("Hashing guest file {}", path)]
fn checksum_from_guest(g: &GuestHandle, path: &str) -> Result<[u8; 32]> {
    let tmp = tempfile::NamedTempFile::new()?;
    let tmp_path = tmp.into_temp_path();
    g.download(path, &tmp_path)?;
    let mut src = std::fs::File::open(&tmp_path)?;
    let mut hasher = new_sha256_hasher()?;
    let mut buf = vec![0u8; CHECKSUM_BUFSZ];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finish()?);
    Ok(out)
}

fn fill_children(
    g: &GuestHandle,
    dir: &InodeRef,
    path: &str,
    flags: &WalkFlags,
    ctx: &mut WalkCtx,
) -> Result<()> {
    let names: Vec<String> = g
        .ls(path)?
        .into_iter()
        // Whiteout markers on the guest are dead state from layer
        // materialisation; never capture them.
        .filter(|n| !n.starts_with(".wh."))
        .collect();
    if names.is_empty() {
        return Ok(());
    }
    let stats = g.lstatns_list(path, &names)?;
    let xattrs = g.lxattrlist(path, &names)?;

    let prefix = if path == "/" { String::new() } else { path.to_string() };
    for ((name, mut stat), xattrs) in names.into_iter().zip(stats).zip(xattrs) {
        let abs = format!("{prefix}/{name}");

        if stat.nlink > 1 {
            let key = (stat.dev, stat.ino);
            if let Some((inode, expected)) = ctx.hardlinks.get(&key).cloned() {
                inode.borrow_mut().stat.nlink += 1;
                if inode.borrow().stat.nlink == expected {
                    // Last link seen, no longer a candidate.
                    ctx.hardlinks.remove(&key);
                }
                dir.borrow_mut()
                    .children_mut()
                    .expect("directory")
                    .push(Entry { name, inode });
                continue;
            }
        }

        let is_empty_subvol_dir = stat.ino == BTRFS_EMPTY_SUBVOL_DIR_OBJECTID
            && major(stat.dev) == 0
            && stat.mode == libc::S_IFDIR | 0o755
            && stat.mtime == stat.ctime
            && stat.atime == stat.mtime;

        let expected_nlink = stat.nlink;
        stat.nlink = 1;
        if is_empty_subvol_dir {
            // Synthesised at run time with throwaway timestamps; it
            // has no xattr support either.
            stat.atime = Timespec::default();
            stat.mtime = Timespec::default();
            stat.ctime = Timespec::default();
        }

        let mode = stat.mode;
        let body = match mode & libc::S_IFMT {
            libc::S_IFDIR => Body::Directory { children: Vec::new() },
            libc::S_IFLNK => Body::Symlink {
                target: String::new(),
            },
            libc::S_IFREG => Body::Regular { sha256: None },
            _ => Body::Other,
        };
        let inode = Inode::new(stat, body);
        if expected_nlink > 1 {
            let key = {
                let stat = &inode.borrow().stat;
                (stat.dev, stat.ino)
            };
            ctx.hardlinks.insert(key, (inode.clone(), expected_nlink));
        }

        if !is_empty_subvol_dir {
            inode.borrow_mut().xattrs = xattrs;
            match mode & libc::S_IFMT {
                libc::S_IFDIR => {
                    let skip_snapshot = flags.skip_btrfs_snapshots
                        && inode.borrow().stat.ino == BTRFS_FIRST_FREE_OBJECTID
                        && major(inode.borrow().stat.dev) == 0
                        && is_btrfs_subvolume_seen(g, &abs, ctx);
                    if !skip_snapshot {
                        fill_children(g, &inode, &abs, flags, ctx)?;
                    }
                }
                libc::S_IFLNK => {
                    let target = g.readlink(&abs)?;
                    inode.borrow_mut().body = Body::Symlink { target };
                }
                libc::S_IFREG if flags.checksum => {
                    let sum = checksum_from_guest(g, &abs)?;
                    inode.borrow_mut().body = Body::Regular { sha256: Some(sum) };
                }
                _ => {}
            }
        }

        dir.borrow_mut()
            .children_mut()
            .expect("directory")
            .push(Entry { name, inode });
    }
    Ok(())
}

/// Depth-first walk of the mounted guest starting at `/`.
#[context("Walking guest filesystem")]
pub(crate) fn from_guest(g: &GuestHandle, flags: &WalkFlags) -> Result<Entry> {
    let mut ctx = WalkCtx {
        hardlinks: HashMap::new(),
        btrfs_uuids: HashSet::new(),
    };

    let mut stat = g.lstatns("/")?;
    if flags.skip_btrfs_snapshots
        && stat.ino == BTRFS_FIRST_FREE_OBJECTID
        && major(stat.dev) == 0
    {
        // Record the root subvolume UUID so its snapshots are
        // recognised during the walk.
        is_btrfs_subvolume_seen(g, "/", &mut ctx);
    }
    stat.nlink = 1;
    let root_inode = Inode::new(stat, Body::Directory { children: Vec::new() });
    root_inode.borrow_mut().xattrs = g.lgetxattrs("/")?;

    let root = Entry {
        name: "/".to_string(),
        inode: root_inode,
    };
    fill_children(g, &root.inode, "/", flags, &mut ctx)?;
    Ok(root)
}
