//! # Commandline parsing
//!
//! The CLI definitions live in the library so that the thin binary
//! crate (and any project embedding the conversion tools) can reuse
//! them directly.

use std::ffi::OsString;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use clap::{Args, Parser};

use crate::c2v::{self, ContainerToVmOpts, ExecOverrides};
use crate::filter;
use crate::guest::GuestHandle;
use crate::ociarchive::Compression;
use crate::tree::WalkFlags;
use crate::v2c::{self, VmToContainerOpts};
use crate::Result;

/// Execution-record options shared by both conversion directions.
#[derive(Debug, Args)]
pub struct ExecConfigOpts {
    /// Extra args to entrypoint, set once for each arg
    #[clap(long)]
    cmd: Vec<String>,

    /// Entrypoint, set once for each argument
    #[clap(long)]
    entrypoint: Vec<String>,

    /// Environment variables, set once for each KEY=VAL
    #[clap(long)]
    env: Vec<String>,

    /// User and group, name or numeric id
    #[clap(long, value_name = "USER[:GROUP]")]
    user: Option<String>,

    /// Working directory
    #[clap(long)]
    working_dir: Option<String>,
}

impl ExecConfigOpts {
    fn overrides(&self) -> ExecOverrides {
        ExecOverrides {
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            env: self.env.clone(),
            user: self.user.clone(),
            workdir: self.working_dir.clone(),
        }
    }
}

/// `--compression=zstd|gzip|none[:level]`
#[derive(Debug, Clone)]
struct CompressionSpec {
    compression: Compression,
    level: Option<i32>,
}

impl FromStr for CompressionSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (codec, level) = match s.split_once(':') {
            Some((codec, level)) => (
                codec,
                Some(level.parse::<i32>().context("Invalid compression level")?),
            ),
            None => (s, None),
        };
        let compression = match codec {
            "zstd" => Compression::Zstd,
            "gzip" => Compression::Gzip,
            "none" => Compression::None,
            o => return Err(anyhow!("Unknown compression {}", o)),
        };
        Ok(Self { compression, level })
    }
}

/// Convert an OCI image archive into a bootable VM disk image.
#[derive(Debug, Parser)]
#[clap(name = "c2v", version)]
pub struct C2vOpts {
    #[clap(flatten)]
    exec: ExecConfigOpts,

    /// Input OCI archive
    input: Utf8PathBuf,

    /// Output qcow2 disk image
    output: Utf8PathBuf,
}

/// Convert a VM disk image into an OCI image archive.
#[derive(Debug, Parser)]
#[clap(name = "v2c", version)]
pub struct V2cOpts {
    #[clap(flatten)]
    exec: ExecConfigOpts,

    /// Layer compression, optionally with a level
    #[clap(long, default_value = "zstd", value_name = "zstd|gzip|none[:lvl]")]
    compression: CompressionSpec,

    /// Do not disable VM-specific init units on the guest
    #[clap(long)]
    no_systemd_cleanup: bool,

    /// Reuse layer blobs from this source OCI archive when doing so
    /// is estimated to ship fewer bytes
    #[clap(long, value_name = "ARCHIVE")]
    layer_reuse: Option<Utf8PathBuf>,

    /// Do not descend into btrfs snapshots when capturing the guest
    #[clap(long)]
    skip_btrfs_snapshots: bool,

    /// Input qcow2 disk image
    input: Utf8PathBuf,

    /// Output OCI archive
    output: Utf8PathBuf,
}

/// Summarise a container image as a membership sketch of its files.
#[derive(Debug, Parser)]
#[clap(name = "v2c-mkfindlayerfilter", version)]
pub struct MkFindLayerFilterOpts {
    /// Input OCI archive
    input: Utf8PathBuf,

    /// Output filter file (must not exist)
    output: Utf8PathBuf,
}

/// Find the best container image for a VM image for v2c layer reuse.
#[derive(Debug, Parser)]
#[clap(name = "v2c-findcontainer", version)]
pub struct FindContainerOpts {
    /// Print only the best container image name, instead of all
    /// considered image names and estimated reused bytes
    #[clap(short = 'b', long)]
    best_only: bool,

    /// Use DIR as data directory instead of .
    #[clap(short = 'd', long, default_value = ".", value_name = "DIR")]
    data: Utf8PathBuf,

    /// Do not try to ignore btrfs snapshots
    #[clap(long)]
    keep_btrfs_snapshots: bool,

    /// Input disk image
    input: Utf8PathBuf,
}

/// `SOURCE_DATE_EPOCH` (integer seconds) turns on the
/// reproducible-timestamp passes.
fn source_date_epoch() -> Result<Option<i64>> {
    match std::env::var("SOURCE_DATE_EPOCH") {
        Ok(v) => Ok(Some(
            v.parse::<i64>().context("Invalid SOURCE_DATE_EPOCH")?,
        )),
        Err(_) => Ok(None),
    }
}

/// Parse arguments and run the container → VM conversion.
pub fn run_c2v_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let opts = C2vOpts::parse_from(args);
    let pipeline_opts = ContainerToVmOpts {
        exec: opts.exec.overrides(),
        source_date_epoch: source_date_epoch()?,
    };
    c2v::run(&opts.input, &opts.output, &pipeline_opts)
}

/// Parse arguments and run the VM → container conversion.
pub fn run_v2c_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let opts = V2cOpts::parse_from(args);
    let pipeline_opts = VmToContainerOpts {
        exec: opts.exec.overrides(),
        compression: opts.compression.compression,
        compression_level: opts.compression.level,
        no_systemd_cleanup: opts.no_systemd_cleanup,
        layer_reuse: opts.layer_reuse.clone(),
        skip_btrfs_snapshots: opts.skip_btrfs_snapshots,
        source_date_epoch: source_date_epoch()?,
    };
    v2c::run(&opts.input, &opts.output, &pipeline_opts)
}

/// Parse arguments and build a filter file from an image.
pub fn run_mkfindlayerfilter_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let opts = MkFindLayerFilterOpts::parse_from(args);
    filter::build_filter_file(opts.input.as_std_path(), opts.output.as_std_path())
}

/// Parse arguments and rank a filter library against a disk image.
pub fn run_findcontainer_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let opts = FindContainerOpts::parse_from(args);
    let g = GuestHandle::open_image(&opts.input, true)?;
    g.mount_first_linux_os()?;
    let flags = WalkFlags {
        checksum: true,
        skip_btrfs_snapshots: !opts.keep_btrfs_snapshots,
    };
    let tree = crate::tree::guest::from_guest(&g, &flags)?;
    let scorer = filter::TreeScorer::new(&tree)?;
    let results = filter::score_directory(&scorer, opts.data.as_std_path())?;
    if opts.best_only {
        if let Some(best) = results.first() {
            println!("{}", best.image);
        }
    } else {
        for result in &results {
            println!("{}: {}", result.image, result.estimated_reuse);
        }
    }
    g.umount_all()?;
    g.shutdown()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_spec() {
        let spec: CompressionSpec = "zstd".parse().unwrap();
        assert_eq!(spec.compression, Compression::Zstd);
        assert_eq!(spec.level, None);
        let spec: CompressionSpec = "gzip:9".parse().unwrap();
        assert_eq!(spec.compression, Compression::Gzip);
        assert_eq!(spec.level, Some(9));
        let spec: CompressionSpec = "none".parse().unwrap();
        assert_eq!(spec.compression, Compression::None);
        assert!("lzma".parse::<CompressionSpec>().is_err());
        assert!("zstd:fast".parse::<CompressionSpec>().is_err());
    }

    #[test]
    fn test_parse_v2c_opts() {
        let opts = V2cOpts::parse_from([
            "v2c",
            "--compression=gzip:7",
            "--env",
            "A=1",
            "--env",
            "B=2",
            "--layer-reuse=src.tar",
            "--skip-btrfs-snapshots",
            "disk.qcow2",
            "out.tar",
        ]);
        assert_eq!(opts.compression.compression, Compression::Gzip);
        assert_eq!(opts.compression.level, Some(7));
        assert_eq!(opts.exec.env, vec!["A=1", "B=2"]);
        assert_eq!(opts.layer_reuse.as_deref(), Some("src.tar".into()));
        assert!(opts.skip_btrfs_snapshots);
        assert!(!opts.no_systemd_cleanup);
        assert_eq!(opts.input, "disk.qcow2");
        assert_eq!(opts.output, "out.tar");
    }

    #[test]
    fn test_parse_findcontainer_opts() {
        let opts =
            FindContainerOpts::parse_from(["v2c-findcontainer", "-b", "-d", "/lib", "in.qcow2"]);
        assert!(opts.best_only);
        assert_eq!(opts.data, "/lib");
        assert!(!opts.keep_btrfs_snapshots);
    }
}
