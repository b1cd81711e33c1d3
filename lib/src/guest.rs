//! Client for the VM-sandboxed filesystem service.
//!
//! All guest disk access goes through the host's `guestfish` binary
//! (the libguestfs shell), spawned once in `--listen` mode; every
//! operation is then one `guestfish --remote=<pid> -- <cmd>`
//! invocation.  The rest of the crate sees only the typed surface
//! below; any failure reported by the service aborts the calling
//! pipeline.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context};
use camino::Utf8Path;
use fn_error_context::context;

use crate::tree::{Stat, Timespec, Xattr};
use crate::Result;

/// A handle to one running filesystem service instance.
#[derive(Debug)]
pub(crate) struct GuestHandle {
    pid: u32,
    closed: bool,
}

fn new_cmd() -> Command {
    let mut cmd = Command::new("guestfish");
    cmd.stdin(Stdio::null());
    cmd
}

impl GuestHandle {
    /// Start a service instance with no drives attached.
    #[context("Launching filesystem service")]
    fn listen() -> Result<Self> {
        let out = new_cmd()
            .arg("--listen")
            .output()
            .context("Failed to exec guestfish")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("guestfish --listen failed: {}", stderr));
        }
        let stdout = String::from_utf8(out.stdout)?;
        // The shell prints `GUESTFISH_PID=<n>; export GUESTFISH_PID`.
        let pid = stdout
            .split(|c: char| !c.is_ascii_digit())
            .find(|s| !s.is_empty())
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| anyhow!("Cannot parse guestfish pid from {:?}", stdout))?;
        Ok(Self { pid, closed: false })
    }

    /// One remote call; returns raw stdout.
    fn call(&self, args: &[&str]) -> Result<String> {
        let out = new_cmd()
            .arg(format!("--remote={}", self.pid))
            .arg("--")
            .args(args)
            .output()
            .context("Failed to exec guestfish")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!(
                "guestfish {}: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn call_unit(&self, args: &[&str]) -> Result<()> {
        self.call(args).map(|_| ())
    }

    /// Create a qcow2 disk of `size` bytes, format it as btrfs and
    /// mount it at `/`.
    #[context("Creating target disk {}", path)]
    pub(crate) fn create_qcow2_btrfs(path: &Utf8Path, size: u64) -> Result<Self> {
        let g = Self::listen()?;
        g.call_unit(&["disk-create", path.as_str(), "qcow2", &size.to_string()])?;
        g.call_unit(&["add-drive", path.as_str(), "format:qcow2"])?;
        g.call_unit(&["run"])?;
        g.call_unit(&["mkfs-btrfs", "/dev/sda"])?;
        g.call_unit(&["mount", "/dev/sda", "/"])?;
        Ok(g)
    }

    /// Attach an existing disk image and launch the service.
    #[context("Opening disk image {}", path)]
    pub(crate) fn open_image(path: &Utf8Path, readonly: bool) -> Result<Self> {
        let g = Self::listen()?;
        if readonly {
            g.call_unit(&["add-drive", path.as_str(), "readonly:true"])?;
        } else {
            g.call_unit(&["add-drive", path.as_str()])?;
        }
        g.call_unit(&["run"])?;
        Ok(g)
    }

    /// Inspect the guest and mount the first Linux OS found,
    /// mountpoints sorted by path; falls back to the first plausible
    /// filesystem when inspection finds nothing.  Returns the list
    /// of (mountpath, device) pairs actually mounted.
    #[context("Mounting guest filesystems")]
    pub(crate) fn mount_first_linux_os(&self) -> Result<Vec<(String, String)>> {
        let roots: Vec<String> = self
            .call(&["inspect-os"])?
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        let mut target = None;
        for root in &roots {
            match self.call(&["inspect-get-type", root.as_str()]) {
                Ok(t) if t.trim() == "linux" => {
                    target = Some(root.clone());
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("inspect-get-type {root}: {e}");
                }
            }
        }
        let mut mounts: Vec<(String, String)> = match &target {
            Some(root) => self
                .call(&["inspect-get-mountpoints", root.as_str()])?
                .lines()
                .filter_map(|l| l.split_once(": "))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect(),
            None => Vec::new(),
        };
        if mounts.is_empty() {
            // No OS or no mountpoint table; mount the first
            // filesystem that is not swap and not unrecognised.
            let fses = self.call(&["list-filesystems"])?;
            for line in fses.lines() {
                let Some((dev, typ)) = line.split_once(": ") else {
                    continue;
                };
                let typ = typ.trim();
                if typ == "swap" || typ == "unknown" {
                    continue;
                }
                self.call_unit(&["mount", dev.trim(), "/"])?;
                return Ok(vec![("/".to_string(), dev.trim().to_string())]);
            }
            return Err(anyhow!("No mountable filesystem found"));
        }
        mounts.sort();
        let mut mounted = Vec::new();
        for (mp, dev) in mounts {
            if mp != "/" && !self.is_dir(&mp)? {
                if let Err(e) = self.call_unit(&["mkdir-p", &mp]) {
                    tracing::warn!("mountpoint {mp} setup failed: {e}");
                }
            }
            match self.call_unit(&["mount", &dev, &mp]) {
                Ok(()) => mounted.push((mp, dev)),
                Err(e) => tracing::warn!("mount {dev} at {mp} failed: {e}"),
            }
        }
        Ok(mounted)
    }

    pub(crate) fn umask(&self, mask: u32) -> Result<()> {
        self.call_unit(&["umask", &format!("0{mask:o}")])
    }

    pub(crate) fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self.call(&["is-dir", path])?.trim() == "true")
    }

    pub(crate) fn ls(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .call(&["ls", path])?
            .lines()
            .map(|l| l.to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub(crate) fn readlink(&self, path: &str) -> Result<String> {
        Ok(self.call(&["readlink", path])?.trim_end().to_string())
    }

    pub(crate) fn lstatns(&self, path: &str) -> Result<Stat> {
        let out = self.call(&["lstatns", path])?;
        let stats = parse_statns_list(&out);
        stats
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty lstatns reply for {path}"))
    }

    /// Batched lstat of several children of `dir`.
    pub(crate) fn lstatns_list(&self, dir: &str, names: &[String]) -> Result<Vec<Stat>> {
        let mut args = vec!["lstatnslist", dir];
        args.extend(names.iter().map(|s| s.as_str()));
        let out = self.call(&args)?;
        let stats = parse_statns_list(&out);
        if stats.len() != names.len() {
            return Err(anyhow!(
                "lstatnslist returned {} entries for {} names",
                stats.len(),
                names.len()
            ));
        }
        Ok(stats)
    }

    /// Batched xattr fetch for several children of `dir`; one inner
    /// vector per name, in order.
    pub(crate) fn lxattrlist(&self, dir: &str, names: &[String]) -> Result<Vec<Vec<Xattr>>> {
        let mut args = vec!["lxattrlist", dir];
        args.extend(names.iter().map(|s| s.as_str()));
        let out = self.call(&args)?;
        let grouped = parse_lxattrlist(&out)?;
        if grouped.len() != names.len() {
            return Err(anyhow!(
                "lxattrlist returned {} groups for {} names",
                grouped.len(),
                names.len()
            ));
        }
        Ok(grouped)
    }

    pub(crate) fn lgetxattrs(&self, path: &str) -> Result<Vec<Xattr>> {
        let out = self.call(&["lgetxattrs", path])?;
        Ok(parse_xattr_structs(&out)
            .into_iter()
            .map(|(name, value)| Xattr { name, value })
            .collect())
    }

    pub(crate) fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.call_unit(&["download", remote, &local.to_string_lossy()])
    }

    pub(crate) fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.call_unit(&["upload", &local.to_string_lossy(), remote])
    }

    pub(crate) fn upload_offset(&self, local: &Path, remote: &str, offset: u64) -> Result<()> {
        self.call_unit(&[
            "upload-offset",
            &local.to_string_lossy(),
            remote,
            &offset.to_string(),
        ])
    }

    pub(crate) fn truncate_size(&self, path: &str, size: u64) -> Result<()> {
        self.call_unit(&["truncate-size", path, &size.to_string()])
    }

    pub(crate) fn mknod(&self, mode: u32, devmajor: u64, devminor: u64, path: &str) -> Result<()> {
        self.call_unit(&[
            "mknod",
            &format!("0{mode:o}"),
            &devmajor.to_string(),
            &devminor.to_string(),
            path,
        ])
    }

    pub(crate) fn mkdir_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.call_unit(&["mkdir-mode", path, &format!("0{mode:o}")])
    }

    pub(crate) fn mkdir_p(&self, path: &str) -> Result<()> {
        self.call_unit(&["mkdir-p", path])
    }

    pub(crate) fn chmod(&self, mode: u32, path: &str) -> Result<()> {
        self.call_unit(&["chmod", &format!("0{mode:o}"), path])
    }

    pub(crate) fn lchown(&self, uid: u64, gid: u64, path: &str) -> Result<()> {
        self.call_unit(&["lchown", &uid.to_string(), &gid.to_string(), path])
    }

    pub(crate) fn lsetxattr(&self, xattr: &Xattr, path: &str) -> Result<()> {
        let value = String::from_utf8_lossy(&xattr.value);
        self.call_unit(&[
            "lsetxattr",
            &xattr.name,
            &value,
            &xattr.value.len().to_string(),
            path,
        ])
    }

    pub(crate) fn utimens(&self, path: &str, atime: &Timespec, mtime: &Timespec) -> Result<()> {
        self.call_unit(&[
            "utimens",
            path,
            &atime.sec.to_string(),
            &atime.nsec.to_string(),
            &mtime.sec.to_string(),
            &mtime.nsec.to_string(),
        ])
    }

    pub(crate) fn ln(&self, target: &str, linkname: &str) -> Result<()> {
        self.call_unit(&["ln", target, linkname])
    }

    pub(crate) fn ln_s(&self, target: &str, linkname: &str) -> Result<()> {
        self.call_unit(&["ln-s", target, linkname])
    }

    pub(crate) fn rm_f(&self, path: &str) -> Result<()> {
        self.call_unit(&["rm-f", path])
    }

    pub(crate) fn rm_rf(&self, path: &str) -> Result<()> {
        self.call_unit(&["rm-rf", path])
    }

    /// Create a read-only btrfs snapshot of `src` at `dest`.
    pub(crate) fn btrfs_snapshot_ro(&self, src: &str, dest: &str) -> Result<()> {
        self.call_unit(&["btrfs-subvolume-snapshot", src, dest, "ro:true"])
    }

    /// Key/value details of a btrfs subvolume (`UUID`, `Parent UUID`, …).
    pub(crate) fn btrfs_subvolume_show(&self, path: &str) -> Result<HashMap<String, String>> {
        let out = self.call(&["btrfs-subvolume-show", path])?;
        Ok(out
            .lines()
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }

    /// Open the augmented configuration editor on the guest root.
    pub(crate) fn aug_init(&self) -> Result<()> {
        self.call_unit(&["aug-init", "/", "0"])
    }

    /// Remove all nodes matching an augeas path expression.
    pub(crate) fn aug_rm(&self, expr: &str) -> Result<()> {
        self.call_unit(&["aug-rm", expr])
    }

    pub(crate) fn aug_save(&self) -> Result<()> {
        self.call_unit(&["aug-save"])
    }

    pub(crate) fn aug_close(&self) -> Result<()> {
        self.call_unit(&["aug-close"])
    }

    /// Run a command inside the guest.
    pub(crate) fn command(&self, argv: &[&str]) -> Result<String> {
        let mut args = vec!["command"];
        args.extend_from_slice(argv);
        self.call(&args)
    }

    pub(crate) fn umount_all(&self) -> Result<()> {
        self.call_unit(&["umount-all"])
    }

    /// Unmount, stop the appliance and release the handle.
    #[context("Shutting down filesystem service")]
    pub(crate) fn shutdown(mut self) -> Result<()> {
        self.call_unit(&["shutdown"])?;
        self.call_unit(&["exit"])?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for GuestHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.call(&["exit"]);
        }
    }
}

fn parse_i64(v: &str) -> i64 {
    v.trim().parse().unwrap_or_default()
}

/// Parse one or more printed stat structures.  Fields arrive as
/// `st_xxx: value` lines; a repeated `st_dev` starts the next
/// structure.
pub(crate) fn parse_statns_list(out: &str) -> Vec<Stat> {
    let mut stats = Vec::new();
    let mut cur: Option<Stat> = None;
    for line in out.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key == "st_dev" {
            if let Some(prev) = cur.take() {
                stats.push(prev);
            }
            cur = Some(Stat::default());
        }
        let Some(stat) = cur.as_mut() else { continue };
        match key {
            "st_dev" => stat.dev = parse_i64(value) as u64,
            "st_ino" => stat.ino = parse_i64(value) as u64,
            "st_mode" => stat.mode = parse_i64(value) as u32,
            "st_nlink" => stat.nlink = parse_i64(value) as u64,
            "st_uid" => stat.uid = parse_i64(value) as u64,
            "st_gid" => stat.gid = parse_i64(value) as u64,
            "st_rdev" => stat.rdev = parse_i64(value) as u64,
            "st_size" => stat.size = parse_i64(value) as u64,
            "st_atime_sec" => stat.atime.sec = parse_i64(value),
            "st_atime_nsec" => stat.atime.nsec = parse_i64(value),
            "st_mtime_sec" => stat.mtime.sec = parse_i64(value),
            "st_mtime_nsec" => stat.mtime.nsec = parse_i64(value),
            "st_ctime_sec" => stat.ctime.sec = parse_i64(value),
            "st_ctime_nsec" => stat.ctime.nsec = parse_i64(value),
            _ => {}
        }
    }
    if let Some(prev) = cur.take() {
        stats.push(prev);
    }
    stats
}

/// Parse printed xattr structures into (name, value) pairs.
fn parse_xattr_structs(out: &str) -> Vec<(String, Vec<u8>)> {
    let mut pairs = Vec::new();
    let mut name: Option<String> = None;
    for line in out.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("attrname:") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("attrval:") {
            let value = rest.strip_prefix(' ').unwrap_or(rest);
            // Values are NUL-terminated on the wire.
            let value = value.strip_suffix('\0').unwrap_or(value);
            if let Some(name) = name.take() {
                pairs.push((name, value.as_bytes().to_vec()));
            }
        }
    }
    pairs
}

/// Group a batched xattr listing: each name contributes one
/// pseudo-entry whose value is the count of its xattrs, followed by
/// that many real entries.
fn parse_lxattrlist(out: &str) -> Result<Vec<Vec<Xattr>>> {
    let flat = parse_xattr_structs(out);
    let mut grouped = Vec::new();
    let mut it = flat.into_iter();
    while let Some((marker, count)) = it.next() {
        if !marker.is_empty() {
            return Err(anyhow!("Unexpected xattr batch marker {marker:?}"));
        }
        let count: usize = String::from_utf8_lossy(&count).trim().parse().unwrap_or(0);
        let mut xattrs = Vec::with_capacity(count);
        for _ in 0..count {
            let (name, value) = it
                .next()
                .ok_or_else(|| anyhow!("Truncated xattr batch"))?;
            xattrs.push(Xattr { name, value });
        }
        grouped.push(xattrs);
    }
    Ok(grouped)
}

/// Reads file bytes out of the guest by staging them in host
/// temporary files, for layer emission.
#[derive(Debug)]
pub(crate) struct GuestContent<'a> {
    guest: &'a GuestHandle,
}

impl<'a> GuestContent<'a> {
    pub(crate) fn new(guest: &'a GuestHandle) -> Self {
        Self { guest }
    }
}

struct TempFileReader {
    file: std::fs::File,
    _path: tempfile::TempPath,
}

impl Read for TempFileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl crate::tree::diff::ContentSource for GuestContent<'_> {
    #[context("Fetching {}", path)]
    fn open(&mut self, path: &Utf8Path) -> Result<Box<dyn Read + '_>> {
        let tmp = tempfile::NamedTempFile::new()?;
        let tmp_path = tmp.into_temp_path();
        self.guest.download(path.as_str(), &tmp_path)?;
        let file = std::fs::File::open(&tmp_path)?;
        Ok(Box::new(TempFileReader {
            file,
            _path: tmp_path,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statns_list() {
        let out = "[0] = {\n  st_dev: 64768\n  st_ino: 2\n  st_mode: 16877\n  st_nlink: 1\n  st_uid: 0\n  st_gid: 0\n  st_rdev: 0\n  st_size: 236\n  st_blksize: 4096\n  st_blocks: 0\n  st_atime_sec: 10\n  st_atime_nsec: 1\n  st_mtime_sec: 20\n  st_mtime_nsec: 2\n  st_ctime_sec: 30\n  st_ctime_nsec: 3\n}\n[1] = {\n  st_dev: 64768\n  st_ino: 257\n  st_mode: 33188\n  st_nlink: 2\n  st_uid: 1000\n  st_gid: 1000\n  st_rdev: 0\n  st_size: 5\n  st_atime_sec: 0\n  st_atime_nsec: 0\n  st_mtime_sec: 0\n  st_mtime_nsec: 0\n  st_ctime_sec: 0\n  st_ctime_nsec: 0\n}\n";
        let stats = parse_statns_list(out);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].ino, 2);
        assert_eq!(stats[0].mode, 0o40755);
        assert_eq!(stats[0].mtime, Timespec { sec: 20, nsec: 2 });
        assert_eq!(stats[1].nlink, 2);
        assert_eq!(stats[1].uid, 1000);
    }

    #[test]
    fn test_parse_lxattrlist() {
        let out = "[0] = {\n  attrname: \n  attrval: 0\n}\n[1] = {\n  attrname: \n  attrval: 2\n}\n[2] = {\n  attrname: security.selinux\n  attrval: system_u:object_r:etc_t:s0\n}\n[3] = {\n  attrname: user.foo\n  attrval: bar\n}\n";
        let grouped = parse_lxattrlist(out).unwrap();
        assert_eq!(grouped.len(), 2);
        assert!(grouped[0].is_empty());
        assert_eq!(grouped[1].len(), 2);
        assert_eq!(grouped[1][0].name, "security.selinux");
        assert_eq!(grouped[1][1].value, b"bar");
    }

    #[test]
    fn test_parse_mountpoints_shape() {
        // Mirrors the mountpoint table parse in mount_first_linux_os.
        let out = "/: /dev/sda2\n/boot: /dev/sda1\n";
        let mut mounts: Vec<(String, String)> = out
            .lines()
            .filter_map(|l| l.split_once(": "))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        mounts.sort();
        assert_eq!(
            mounts,
            vec![
                ("/".to_string(), "/dev/sda2".to_string()),
                ("/boot".to_string(), "/dev/sda1".to_string())
            ]
        );
    }
}
