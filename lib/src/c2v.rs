//! Container image → VM disk image pipeline.
//!
//! Replays each layer of an OCI archive onto a freshly created
//! qcow2/btrfs disk, snapshotting the filesystem after every layer,
//! and synthesises an init script from the image's execution config.

use std::io::Read;

use anyhow::Context;
use camino::Utf8Path;
use fn_error_context::context;
use oci_spec::image::ImageConfiguration;

use crate::guest::GuestHandle;
use crate::ociarchive::reader::{self, LayerSource};
use crate::tree::layer::{normalize_entry_name, parse_pax_meta, stat_from_entry};
use crate::tree::{major, minor, Entry, WalkFlags};
use crate::Result;

/// Floor for the created disk: enough for an initialised btrfs plus
/// headroom for the layer snapshots.
const MIN_DISK_SIZE: u64 = 114_294_784;

/// Write granularity for regular file contents.
const PWRITE_CHUNK: usize = 4000 * 1024;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Persistent state directory on the produced disk.
const STATE_DIR: &str = "/.c2v";
const LAYERS_DIR: &str = "/.c2v/layers";
const INIT_PATH: &str = "/.c2v/init";

/// Execution-record overrides shared by both pipelines
/// (`--cmd`, `--entrypoint`, `--env`, `--user`, `--working-dir`).
#[derive(Debug, Default, Clone)]
pub(crate) struct ExecOverrides {
    pub(crate) cmd: Vec<String>,
    pub(crate) entrypoint: Vec<String>,
    pub(crate) env: Vec<String>,
    pub(crate) user: Option<String>,
    pub(crate) workdir: Option<String>,
}

/// Options for the container → VM conversion.
#[derive(Debug, Default)]
pub(crate) struct ContainerToVmOpts {
    pub(crate) exec: ExecOverrides,
    pub(crate) source_date_epoch: Option<i64>,
}

fn split_dir_base(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

fn under_state_dir(path: &str) -> bool {
    path == &STATE_DIR[1..] || path.starts_with(&format!("{}/", &STATE_DIR[1..]))
}

fn target_disk_size(estimated: u64) -> u64 {
    (estimated * 2).max(MIN_DISK_SIZE)
}

fn reset_epoch(g: &GuestHandle, epoch: Option<i64>) -> Result<()> {
    let Some(sec) = epoch else { return Ok(()) };
    let t = crate::tree::Timespec { sec, nsec: 0 };
    for path in ["/", STATE_DIR, LAYERS_DIR] {
        g.utimens(path, &t, &t)?;
    }
    Ok(())
}

/// Replay a layer's whiteout markers live against the target
/// filesystem.  Anything under the state directory is off limits.
#[context("Replaying whiteouts")]
fn whiteout_pass(g: &GuestHandle, layer: &mut dyn LayerSource) -> Result<()> {
    let mut archive = layer.open()?;
    for entry in archive.entries()? {
        let entry = entry?;
        let raw = entry.path()?;
        let raw = raw
            .to_str()
            .with_context(|| format!("Invalid non-utf8 path {raw:?}"))?
            .to_owned();
        let path = normalize_entry_name(&raw);
        let (dir, base) = split_dir_base(&path);
        if !base.starts_with(WHITEOUT_PREFIX) || base == ".wh..c2v" {
            continue;
        }
        if under_state_dir(&path) {
            continue;
        }
        let abs_dir = format!("/{dir}");
        if base == OPAQUE_WHITEOUT {
            if !g.is_dir(&abs_dir)? {
                continue;
            }
            for child in g.ls(&abs_dir)? {
                if dir.is_empty() && child == ".c2v" {
                    continue;
                }
                g.rm_rf(&format!("{}/{}", abs_dir.trim_end_matches('/'), child))?;
            }
        } else {
            let victim = &base[WHITEOUT_PREFIX.len()..];
            if victim.is_empty() {
                continue;
            }
            g.rm_rf(&format!("{}/{}", abs_dir.trim_end_matches('/'), victim))?;
        }
    }
    Ok(())
}

fn read_full(src: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream one regular file into the guest in chunks, leaving holes
/// for all-zero chunks (the file is pre-truncated to full size).
fn write_file_content(
    g: &GuestHandle,
    entry: &mut impl Read,
    abs: &str,
    stage: &std::path::Path,
) -> Result<()> {
    let mut buf = vec![0u8; PWRITE_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = read_full(entry, &mut buf)?;
        if n == 0 {
            break;
        }
        if buf[..n].iter().any(|b| *b != 0) {
            std::fs::write(stage, &buf[..n])?;
            g.upload_offset(stage, abs, offset)?;
        }
        offset += n as u64;
    }
    Ok(())
}

/// Replay a layer's content entries onto the target filesystem.
#[context("Replaying layer contents")]
fn data_pass(g: &GuestHandle, layer: &mut dyn LayerSource) -> Result<()> {
    let stage = tempfile::NamedTempFile::new()?.into_temp_path();
    let mut archive = layer.open()?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?;
        let raw = raw
            .to_str()
            .with_context(|| format!("Invalid non-utf8 path {raw:?}"))?
            .to_owned();
        let path = normalize_entry_name(&raw);
        if path.is_empty() || under_state_dir(&path) {
            continue;
        }
        let (_, base) = split_dir_base(&path);
        if base.starts_with(WHITEOUT_PREFIX) {
            continue;
        }
        let abs = format!("/{path}");

        if entry.header().entry_type() == tar::EntryType::Link {
            let target = entry
                .link_name()?
                .with_context(|| format!("Invalid empty hardlink {path}"))?;
            let target = normalize_entry_name(
                target
                    .to_str()
                    .context("Invalid non-utf8 hardlink target")?,
            );
            g.ln(&format!("/{target}"), &abs)?;
            continue;
        }

        let meta = parse_pax_meta(&mut entry)?;
        let stat = stat_from_entry(&entry, &meta)?;
        let mode = stat.mode;
        let is_dir = mode & libc::S_IFMT == libc::S_IFDIR;
        if !is_dir {
            g.rm_rf(&abs)?;
        } else if let Err(e) = g.rm_f(&abs) {
            // An existing directory is fine; rm-f only needed to
            // clear a non-directory conflict.
            tracing::debug!("rm-f {abs}: {e}");
        }

        match mode & libc::S_IFMT {
            libc::S_IFLNK => {
                let target = entry
                    .link_name()?
                    .with_context(|| format!("Invalid symlink {path}"))?;
                let target = target
                    .to_str()
                    .context("Invalid non-utf8 symlink target")?
                    .to_owned();
                g.ln_s(&target, &abs)?;
            }
            libc::S_IFREG => {
                g.mknod(mode, major(stat.rdev), minor(stat.rdev), &abs)?;
                g.truncate_size(&abs, stat.size)?;
                write_file_content(g, &mut entry, &abs, &stage)?;
            }
            libc::S_IFDIR => {
                if g.is_dir(&abs)? {
                    g.chmod(mode & 0o7777, &abs)?;
                } else {
                    g.mkdir_mode(&abs, mode & 0o7777)?;
                }
            }
            libc::S_IFCHR | libc::S_IFBLK | libc::S_IFIFO | libc::S_IFSOCK => {
                g.mknod(mode, major(stat.rdev), minor(stat.rdev), &abs)?;
            }
            _ => {
                tracing::warn!("Unrecognized file type at {path}");
                continue;
            }
        }

        g.lchown(stat.uid, stat.gid, &abs)?;
        g.utimens(&abs, &stat.atime, &stat.mtime)?;
        for xattr in &meta.xattrs {
            g.lsetxattr(xattr, &abs)?;
        }
        // The mode bits above the permission mask are dropped by the
        // creation calls; re-apply setuid/setgid/sticky.
        if mode & libc::S_IFMT != libc::S_IFLNK && mode & 0o7000 != 0 {
            g.chmod(mode & 0o7777, &abs)?;
        }
    }
    Ok(())
}

/// Content operations clobber every touched directory's mtime; walk
/// the layer's tree bottom-up and put them back.
fn restore_dir_mtimes(g: &GuestHandle, tree: &Entry) -> Result<()> {
    fn visit(g: &GuestHandle, path: &str, entry: &Entry) -> Result<()> {
        let inode = entry.inode.borrow();
        let Some(children) = inode.children() else {
            return Ok(());
        };
        for child in children {
            let child_path = format!("{}/{}", path.trim_end_matches('/'), child.name);
            visit(g, &child_path, child)?;
        }
        if path != "/" {
            g.utimens(path, &inode.stat.atime, &inode.stat.mtime)?;
        }
        Ok(())
    }
    visit(g, "/", tree)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Render the init script from the image config plus CLI overrides.
fn render_init_script(config: &ImageConfiguration, exec: &ExecOverrides) -> String {
    let mut script = String::new();
    let cconf = config.config().as_ref();

    let config_env = cconf
        .and_then(|c| c.env().as_ref())
        .map(|v| v.as_slice())
        .unwrap_or_default();
    for var in config_env.iter().chain(exec.env.iter()) {
        match var.split_once('=') {
            Some((k, v)) => script.push_str(&format!("export {}={}\n", k, shell_quote(v))),
            None => script.push_str(&format!("export {}=''\n", var)),
        }
    }

    let workdir = exec
        .workdir
        .as_deref()
        .or_else(|| cconf.and_then(|c| c.working_dir().as_deref()));
    if let Some(workdir) = workdir.filter(|w| !w.is_empty()) {
        script.push_str(&format!("_WORKDIR={}\n", shell_quote(workdir)));
    }
    let user = exec
        .user
        .as_deref()
        .or_else(|| cconf.and_then(|c| c.user().as_deref()));
    if let Some(user) = user.filter(|u| !u.is_empty()) {
        script.push_str(&format!("_UIDGID={}\n", shell_quote(user)));
    }

    let entrypoint: &[String] = if !exec.entrypoint.is_empty() {
        &exec.entrypoint
    } else {
        cconf
            .and_then(|c| c.entrypoint().as_ref())
            .map(|v| v.as_slice())
            .unwrap_or_default()
    };
    let cmd: &[String] = if !exec.cmd.is_empty() {
        &exec.cmd
    } else {
        cconf
            .and_then(|c| c.cmd().as_ref())
            .map(|v| v.as_slice())
            .unwrap_or_default()
    };

    let default_init = ["/sbin/init".to_string()];
    let args: Vec<&String> = if entrypoint.is_empty() && cmd.is_empty() {
        default_init.iter().collect()
    } else {
        entrypoint.iter().chain(cmd.iter()).collect()
    };
    script.push_str("set --");
    for arg in args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }
    script.push('\n');
    script
}

#[context("Installing init script")]
fn write_init_script(
    g: &GuestHandle,
    config: &ImageConfiguration,
    exec: &ExecOverrides,
    epoch: Option<i64>,
) -> Result<()> {
    let script = render_init_script(config, exec);
    let tmp = tempfile::NamedTempFile::new()?;
    std::fs::write(tmp.path(), script.as_bytes())?;
    g.upload(tmp.path(), INIT_PATH)?;
    g.chmod(0o400, INIT_PATH)?;
    if let Some(sec) = epoch {
        let t = crate::tree::Timespec { sec, nsec: 0 };
        g.utimens(INIT_PATH, &t, &t)?;
    }
    Ok(())
}

/// Convert an OCI archive into a bootable qcow2 disk image.
#[context("Converting {} to VM image", input)]
pub(crate) fn run(input: &Utf8Path, output: &Utf8Path, opts: &ContainerToVmOpts) -> Result<()> {
    let archive = input.as_std_path();
    let index = reader::read_index(archive)?;
    let manifest_digest = reader::native_manifest_digest(&index)?;
    let manifest = reader::read_manifest(archive, &manifest_digest)?;
    let config = reader::read_config(archive, &manifest)?;

    // Build a tree per layer up front: the sum of their disk usage
    // sizes the target, and directory mtimes are restored from them
    // after each replay.
    let mut layer_trees = Vec::new();
    let mut estimated = 0u64;
    for (i, desc) in manifest.layers().iter().enumerate() {
        let mut layer = reader::BlobLayer::from_manifest(archive, &manifest, i)?;
        let tree = crate::tree::layer::from_oci_layer(&mut layer, &WalkFlags::default())?;
        estimated += tree.disk_usage();
        layer_trees.push((desc.digest().clone(), tree));
    }
    tracing::debug!("estimated layer usage: {estimated} bytes");

    let epoch = opts.source_date_epoch;
    let g = GuestHandle::create_qcow2_btrfs(output, target_disk_size(estimated))?;
    g.umask(0)?;
    g.mkdir_mode(STATE_DIR, 0o500)?;
    g.mkdir_mode(LAYERS_DIR, 0o500)?;
    reset_epoch(&g, epoch)?;
    g.btrfs_snapshot_ro("/", &format!("{LAYERS_DIR}/base"))?;
    // Snapshot creation touches the parents.
    reset_epoch(&g, epoch)?;

    for (i, (digest, tree)) in layer_trees.iter().enumerate() {
        let mut layer = reader::BlobLayer::from_manifest(archive, &manifest, i)?;
        whiteout_pass(&g, &mut layer)?;
        data_pass(&g, &mut layer)?;
        restore_dir_mtimes(&g, tree)?;
        g.btrfs_snapshot_ro("/", &format!("{LAYERS_DIR}/{digest}"))?;
        reset_epoch(&g, epoch)?;
    }

    write_init_script(&g, &config, &opts.exec, epoch)?;
    g.umount_all()?;
    g.shutdown()?;
    Ok(())
}
