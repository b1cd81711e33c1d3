//! Writing a new layer: a pax tar stream accumulated in a temporary
//! file, then digested and optionally compressed into a blob.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::PathBuf;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use oci_spec::image::MediaType;
use tempfile::NamedTempFile;

use super::writer::BlobSource;
use super::Compression;
use crate::digest::{sha256_hex_of_file, Sha256Writer, SHA256_PREFIX};
use crate::tree::{major, minor, Body, Inode, Timespec};
use crate::Result;

const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// Yields exactly `remaining` bytes: the inner reader's data first,
/// then zeros.  Keeps short reads (sparse tails) from corrupting the
/// tar stream, and implements hole padding on re-emission.
struct PadReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for PadReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            buf[..want].fill(0);
            self.remaining -= want as u64;
            return Ok(want);
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn pax_time(t: &Timespec) -> Vec<u8> {
    if t.nsec != 0 {
        format!("{}.{:09}", t.sec, t.nsec).into_bytes()
    } else {
        format!("{}", t.sec).into_bytes()
    }
}

/// An open layer stream being written.
pub(crate) struct LayerBuilder {
    builder: tar::Builder<BufWriter<NamedTempFile>>,
    compression: Compression,
    level: Option<i32>,
    // Maps (dev, ino) of multiply-linked inodes to the first path
    // emitted for them; later references become tar hardlinks.
    seen_links: HashMap<(u64, u64), Utf8PathBuf>,
}

impl std::fmt::Debug for LayerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerBuilder")
            .field("compression", &self.compression)
            .field("level", &self.level)
            .finish()
    }
}

/// A closed layer: the blob file plus both digests.
#[derive(Debug)]
pub(crate) struct FinishedLayer {
    /// Hex sha256 of the uncompressed tar stream.
    pub(crate) diff_id: String,
    blob_hex: String,
    blob_size: u64,
    media_type: MediaType,
    blob_file: tempfile::TempPath,
}

impl FinishedLayer {
    /// The diff-id in `sha256:<hex>` form, for `rootfs.diff_ids`.
    pub(crate) fn diff_id_digest(&self) -> String {
        format!("{}{}", SHA256_PREFIX, self.diff_id)
    }

    /// The blob, ready to be copied into an image archive.  The
    /// underlying temp file lives as long as this value.
    pub(crate) fn blob_source(&self) -> BlobSource {
        BlobSource::File {
            media_type: self.media_type.clone(),
            path: PathBuf::from(&*self.blob_file),
            digest: format!("{}{}", SHA256_PREFIX, self.blob_hex),
            size: self.blob_size,
        }
    }
}

fn strip_root(path: &Utf8Path) -> &str {
    let s = path.as_str();
    s.strip_prefix('/').unwrap_or(s)
}

impl LayerBuilder {
    /// Open a new layer stream writing to a temp file under
    /// `$TMPDIR`.
    #[context("Creating layer temp file")]
    pub(crate) fn new(compression: Compression, level: Option<i32>) -> Result<Self> {
        let tmp = NamedTempFile::new()?;
        Ok(Self {
            builder: tar::Builder::new(BufWriter::new(tmp)),
            compression,
            level,
            seen_links: HashMap::new(),
        })
    }

    /// Whether this multiply-linked inode was already emitted, so
    /// the next append becomes a tar hardlink needing no content.
    pub(crate) fn is_seen_link(&self, inode: &Inode) -> bool {
        inode.stat.nlink > 1
            && !inode.is_dir()
            && self
                .seen_links
                .contains_key(&(inode.stat.dev, inode.stat.ino))
    }

    fn base_header(&self, inode: &Inode, entry_type: tar::EntryType) -> tar::Header {
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(entry_type);
        h.set_mode(inode.stat.mode & 0o7777);
        h.set_uid(inode.stat.uid);
        h.set_gid(inode.stat.gid);
        h.set_mtime(inode.stat.mtime.sec.max(0) as u64);
        h.set_size(0);
        h
    }

    fn append_pax_records(&mut self, inode: &Inode) -> Result<()> {
        let mut records: Vec<(String, Vec<u8>)> = Vec::new();
        if !inode.stat.atime.is_zero() {
            records.push(("atime".to_string(), pax_time(&inode.stat.atime)));
        }
        if inode.stat.mtime.nsec != 0 || inode.stat.mtime.sec < 0 {
            records.push(("mtime".to_string(), pax_time(&inode.stat.mtime)));
        }
        if !inode.stat.ctime.is_zero() {
            records.push(("ctime".to_string(), pax_time(&inode.stat.ctime)));
        }
        for xattr in &inode.xattrs {
            records.push((
                format!("{}{}", PAX_XATTR_PREFIX, xattr.name),
                xattr.value.clone(),
            ));
        }
        if records.is_empty() {
            return Ok(());
        }
        self.builder
            .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), v.as_slice())))?;
        Ok(())
    }

    /// Serialise one inode at `path` (guest-absolute).  Regular file
    /// contents are drawn from `content` and zero-padded to the
    /// declared size.  A second sighting of a multiply-linked inode
    /// emits a tar hardlink to the first.
    #[context("Appending {}", path)]
    pub(crate) fn append_inode(
        &mut self,
        path: &Utf8Path,
        inode: &Inode,
        content: Option<&mut dyn Read>,
    ) -> Result<()> {
        let rel = strip_root(path);
        if inode.stat.nlink > 1 && !inode.is_dir() {
            let key = (inode.stat.dev, inode.stat.ino);
            if let Some(first) = self.seen_links.get(&key) {
                let first = first.clone();
                let mut h = self.base_header(inode, tar::EntryType::Link);
                self.append_pax_records(inode)?;
                self.builder.append_link(&mut h, rel, first.as_str())?;
                return Ok(());
            }
            self.seen_links.insert(key, Utf8PathBuf::from(rel));
        }
        self.append_pax_records(inode)?;
        match &inode.body {
            Body::Directory { .. } => {
                let mut h = self.base_header(inode, tar::EntryType::Directory);
                self.builder.append_data(&mut h, rel, std::io::empty())?;
            }
            Body::Symlink { target } => {
                let mut h = self.base_header(inode, tar::EntryType::Symlink);
                self.builder.append_link(&mut h, rel, target.as_str())?;
            }
            Body::Regular { .. } => {
                let mut h = self.base_header(inode, tar::EntryType::Regular);
                h.set_size(inode.stat.size);
                let content = content.context("No content for regular file")?;
                let padded = PadReader {
                    inner: content.take(inode.stat.size),
                    remaining: inode.stat.size,
                };
                self.builder.append_data(&mut h, rel, padded)?;
            }
            Body::Other => {
                let entry_type = match inode.stat.mode & libc::S_IFMT {
                    libc::S_IFCHR => tar::EntryType::Char,
                    libc::S_IFBLK => tar::EntryType::Block,
                    libc::S_IFIFO => tar::EntryType::Fifo,
                    _ => {
                        // tar has no representation for sockets.
                        tracing::warn!("Skipping unrepresentable node {path}");
                        return Ok(());
                    }
                };
                let mut h = self.base_header(inode, entry_type);
                h.set_device_major(major(inode.stat.rdev) as u32)?;
                h.set_device_minor(minor(inode.stat.rdev) as u32)?;
                self.builder.append_data(&mut h, rel, std::io::empty())?;
            }
        }
        Ok(())
    }

    /// Emit a whiteout marker `<dir>/.wh.<name>`.
    pub(crate) fn append_whiteout(&mut self, dir: &Utf8Path, name: &str) -> Result<()> {
        let rel = Utf8Path::new(strip_root(dir)).join(format!(".wh.{name}"));
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Regular);
        h.set_mode(0);
        h.set_uid(0);
        h.set_gid(0);
        h.set_mtime(0);
        h.set_size(0);
        self.builder.append_data(&mut h, rel, std::io::empty())?;
        Ok(())
    }

    /// Close the stream: compute the diff-id, compress if requested,
    /// and hand back the finished blob.
    #[context("Closing layer")]
    pub(crate) fn finish(self) -> Result<FinishedLayer> {
        let compression = self.compression;
        let level = self.level;
        let tmp = self.builder.into_inner()?.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_data().ok();
        let diff_id = sha256_hex_of_file(tmp.path())?;
        let media_type = compression.layer_media_type();

        match compression {
            Compression::None => {
                let blob_size = tmp.as_file().metadata()?.len();
                Ok(FinishedLayer {
                    blob_hex: diff_id.clone(),
                    diff_id,
                    blob_size,
                    media_type,
                    blob_file: tmp.into_temp_path(),
                })
            }
            Compression::Gzip => {
                let out = NamedTempFile::new()?;
                let mut src = BufReader::new(File::open(tmp.path())?);
                let sink = Sha256Writer::new(out)?;
                let gz_level = level
                    .map(|l| flate2::Compression::new(l as u32))
                    .unwrap_or_default();
                let mut enc = flate2::write::GzEncoder::new(sink, gz_level);
                std::io::copy(&mut src, &mut enc)?;
                let (out, blob_hex, blob_size) = enc.finish()?.finish()?;
                Ok(FinishedLayer {
                    diff_id,
                    blob_hex,
                    blob_size,
                    media_type,
                    blob_file: out.into_temp_path(),
                })
            }
            Compression::Zstd => {
                let out = NamedTempFile::new()?;
                let mut src = BufReader::new(File::open(tmp.path())?);
                let sink = Sha256Writer::new(out)?;
                let mut enc = zstd::stream::write::Encoder::new(sink, level.unwrap_or(0))?;
                std::io::copy(&mut src, &mut enc)?;
                let (out, blob_hex, blob_size) = enc.finish()?.finish()?;
                Ok(FinishedLayer {
                    diff_id,
                    blob_hex,
                    blob_size,
                    media_type,
                    blob_file: out.into_temp_path(),
                })
            }
        }
    }
}
