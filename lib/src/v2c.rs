//! VM disk image → container image pipeline.
//!
//! Mounts the guest, scrubs mount-specific and service state that
//! only makes sense inside a VM, captures the filesystem as a tree
//! and emits it as an OCI archive: either one self-contained layer,
//! or a source image's layers plus one delta layer when reusing
//! them ships fewer bytes.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use oci_spec::image::{
    Descriptor, ImageConfiguration, ImageManifestBuilder, MediaType, RootFsBuilder,
    SCHEMA_VERSION,
};

use crate::c2v::ExecOverrides;
use crate::guest::{GuestContent, GuestHandle};
use crate::ociarchive::layer::LayerBuilder;
use crate::ociarchive::reader::{self, BlobLayer, NATIVE_GOARCH};
use crate::ociarchive::writer::{BlobSource, ImageWriter};
use crate::ociarchive::Compression;
use crate::tree::diff::{build_layer, estimate_layer};
use crate::tree::{for_each_inode, Entry, Timespec, WalkFlags};
use crate::Result;

/// Init units which tie the guest to virtual hardware; disabled
/// before capture unless the caller opts out.
const DISABLED_UNITS: &[&str] = &[
    "networking.service",
    "multipathd.service",
    "auditd.service",
];
const MASKED_UNITS: &[&str] = &["systemd-rfkill.socket"];

/// Options for the VM → container conversion.
#[derive(Debug)]
pub(crate) struct VmToContainerOpts {
    pub(crate) exec: ExecOverrides,
    pub(crate) compression: Compression,
    pub(crate) compression_level: Option<i32>,
    pub(crate) no_systemd_cleanup: bool,
    pub(crate) layer_reuse: Option<Utf8PathBuf>,
    pub(crate) skip_btrfs_snapshots: bool,
    pub(crate) source_date_epoch: Option<i64>,
}

impl Default for VmToContainerOpts {
    fn default() -> Self {
        Self {
            exec: ExecOverrides::default(),
            compression: Compression::Zstd,
            compression_level: None,
            no_systemd_cleanup: false,
            layer_reuse: None,
            skip_btrfs_snapshots: false,
            source_date_epoch: None,
        }
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Timestamps we touched ourselves (between `start` and `end`) are
/// clamped to the reproducible epoch.
fn clamp_timestamps(tree: &Entry, start: i64, end: i64, epoch: i64) {
    let clamp = |t: &mut Timespec| {
        if t.sec >= start && t.sec <= end {
            *t = Timespec {
                sec: epoch,
                nsec: 0,
            };
        }
    };
    for_each_inode(tree, &mut |inode| {
        let mut inode = inode.borrow_mut();
        clamp(&mut inode.stat.atime);
        clamp(&mut inode.stat.mtime);
        clamp(&mut inode.stat.ctime);
    });
}

/// `SIGPWR` asks sysvinit-style inits to shut down; systemd wants
/// `SIGRTMIN+3` instead.
fn stop_signal_for(tree: &Entry) -> &'static str {
    if let Some(init) = tree.lookup("/sbin/init") {
        let init = init.borrow();
        if let crate::tree::Body::Symlink { target } = &init.body {
            if target.ends_with("systemd") {
                return "SIGRTMIN+3";
            }
        }
    }
    "SIGPWR"
}

/// Assemble the image config's execution record: CLI overrides win,
/// then the reuse source's config, then nothing.
fn build_exec_config(
    exec: &ExecOverrides,
    source: Option<&ImageConfiguration>,
    stop_signal: &str,
) -> Result<oci_spec::image::Config> {
    let src = source.and_then(|c| c.config().as_ref());
    let mut b = oci_spec::image::ConfigBuilder::default();
    let user = exec
        .user
        .clone()
        .or_else(|| src.and_then(|c| c.user().clone()));
    if let Some(user) = user {
        b = b.user(user);
    }
    let cmd = if !exec.cmd.is_empty() {
        Some(exec.cmd.clone())
    } else {
        src.and_then(|c| c.cmd().clone())
    };
    if let Some(cmd) = cmd {
        b = b.cmd(cmd);
    }
    let entrypoint = if !exec.entrypoint.is_empty() {
        Some(exec.entrypoint.clone())
    } else {
        src.and_then(|c| c.entrypoint().clone())
    };
    if let Some(entrypoint) = entrypoint {
        b = b.entrypoint(entrypoint);
    }
    let env = if !exec.env.is_empty() {
        Some(exec.env.clone())
    } else {
        src.and_then(|c| c.env().clone())
    };
    if let Some(env) = env {
        b = b.env(env);
    }
    let workdir = exec
        .workdir
        .clone()
        .or_else(|| src.and_then(|c| c.working_dir().clone()));
    if let Some(workdir) = workdir {
        b = b.working_dir(workdir);
    }
    Ok(b.stop_signal(stop_signal).build()?)
}

/// Remove fstab rules for everything we mounted, then disable init
/// units that are meaningless in a container.  Unit failures are
/// logged and ignored; the guest may not run systemd at all.
#[context("Cleaning guest state")]
fn clean_guest_state(g: &GuestHandle, mounts: &[(String, String)], systemd_cleanup: bool) -> Result<()> {
    g.aug_init()?;
    for (mountpath, _) in mounts {
        g.aug_rm(&format!("/files/etc/fstab/*[file = \"{mountpath}\"]"))?;
    }
    g.aug_save()?;
    g.aug_close()?;

    if systemd_cleanup {
        for &unit in DISABLED_UNITS {
            if let Err(e) = g.command(&["systemctl", "disable", unit]) {
                tracing::warn!("disabling {unit}: {e}");
            }
        }
        for &unit in MASKED_UNITS {
            if let Err(e) = g.command(&["systemctl", "mask", unit]) {
                tracing::warn!("masking {unit}: {e}");
            }
        }
    }
    Ok(())
}

struct ReuseSource {
    archive: Utf8PathBuf,
    layers: Vec<Descriptor>,
    config: ImageConfiguration,
    tree: Entry,
}

/// Flatten a source archive's layer stack into its effective tree.
#[context("Loading reuse source {}", archive)]
fn load_reuse_source(archive: &Utf8Path) -> Result<ReuseSource> {
    let std_path = archive.as_std_path();
    let index = reader::read_index(std_path)?;
    let manifest_digest = reader::native_manifest_digest(&index)?;
    let manifest = reader::read_manifest(std_path, &manifest_digest)?;
    let config = reader::read_config(std_path, &manifest)?;
    let flags = WalkFlags {
        checksum: true,
        ..Default::default()
    };
    let mut tree: Option<Entry> = None;
    for i in 0..manifest.layers().len() {
        let mut layer = BlobLayer::from_manifest(std_path, &manifest, i)?;
        match tree.as_mut() {
            None => tree = Some(crate::tree::layer::from_oci_layer(&mut layer, &flags)?),
            Some(t) => crate::tree::layer::apply_oci_layer(t, &mut layer, &flags)?,
        }
    }
    Ok(ReuseSource {
        archive: archive.to_owned(),
        layers: manifest.layers().clone(),
        config,
        tree: tree.unwrap_or_else(Entry::new_root),
    })
}

/// Convert a disk image into an OCI archive.
#[context("Converting {} to container image", input)]
pub(crate) fn run(input: &Utf8Path, output: &Utf8Path, opts: &VmToContainerOpts) -> Result<()> {
    let g = GuestHandle::open_image(input, false)?;
    let mounts = g.mount_first_linux_os()?;

    let modification_start = now_secs();
    clean_guest_state(&g, &mounts, !opts.no_systemd_cleanup)?;
    let modification_end = now_secs();

    let flags = WalkFlags {
        checksum: true,
        skip_btrfs_snapshots: opts.skip_btrfs_snapshots,
    };
    let guest_tree = crate::tree::guest::from_guest(&g, &flags)?;
    if let Some(epoch) = opts.source_date_epoch {
        clamp_timestamps(&guest_tree, modification_start, modification_end, epoch);
    }

    // Reuse pays off when the delta layer against the source's tree
    // is estimated smaller than a full self-contained layer.
    let mut reuse: Option<ReuseSource> = None;
    if let Some(src) = &opts.layer_reuse {
        let source = load_reuse_source(src)?;
        let baseline = estimate_layer(None, &guest_tree)?;
        let with_reuse = estimate_layer(Some(&source.tree), &guest_tree)?;
        tracing::debug!("layer estimate: baseline {baseline}, with reuse {with_reuse}");
        if with_reuse < baseline {
            reuse = Some(source);
        }
    }

    let mut image = ImageWriter::new(output.as_std_path())?;
    let mut layer_descriptors: Vec<Descriptor> = Vec::new();
    let mut diff_ids: Vec<String> = Vec::new();
    if let Some(reuse) = &reuse {
        for desc in &reuse.layers {
            let blob = BlobSource::from_archive_entry(reuse.archive.as_std_path(), desc);
            layer_descriptors.push(image.add_blob(&blob)?);
        }
        diff_ids.extend(reuse.config.rootfs().diff_ids().iter().cloned());
    }

    let mut lb = LayerBuilder::new(opts.compression, opts.compression_level)?;
    let mut content = GuestContent::new(&g);
    let baseline_tree = reuse.as_ref().map(|r| &r.tree);
    build_layer(baseline_tree, &guest_tree, &mut lb, &mut content)?;
    let finished = lb.finish()?;
    let blob = finished.blob_source();
    layer_descriptors.push(image.add_blob(&blob)?);
    diff_ids.push(finished.diff_id_digest());

    let stop_signal = stop_signal_for(&guest_tree);
    let exec_config =
        build_exec_config(&opts.exec, reuse.as_ref().map(|r| &r.config), stop_signal)?;
    let image_config = oci_spec::image::ImageConfigurationBuilder::default()
        .architecture(goarch_arch()?)
        .os(linux_os()?)
        .rootfs(
            RootFsBuilder::default()
                .typ("layers")
                .diff_ids(diff_ids)
                .build()?,
        )
        .config(exec_config)
        .build()?;
    let config_blob =
        BlobSource::from_bytes(MediaType::ImageConfig, serde_json::to_vec(&image_config)?)?;
    let config_desc = image.add_blob(&config_blob)?;

    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .config(config_desc)
        .layers(layer_descriptors)
        .build()?;
    let manifest_blob =
        BlobSource::from_bytes(MediaType::ImageManifest, serde_json::to_vec(&manifest)?)?;
    image.add_manifest(&manifest_blob)?;
    image.finish()?;

    g.umount_all()?;
    g.shutdown()?;
    Ok(())
}

fn goarch_arch() -> Result<oci_spec::image::Arch> {
    serde_json::from_value(serde_json::Value::String(NATIVE_GOARCH.to_string()))
        .context("Mapping native architecture")
}

fn linux_os() -> Result<oci_spec::image::Os> {
    serde_json::from_value(serde_json::Value::String("linux".to_string()))
        .context("Mapping native os")
}
