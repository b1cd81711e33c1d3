//! Writing an OCI image archive.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fn_error_context::context;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageIndexBuilder, MediaType, SCHEMA_VERSION,
};

use super::seek;
use crate::digest::{sha256_hex_of_slice, SHA256_PREFIX};
use crate::Result;

const OCI_LAYOUT: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;

/// A blob to be copied into an image archive.  Blobs originate in
/// memory (configs, manifests), in a file on disk (freshly written
/// layers), or as an entry of another archive (reused layers).
#[derive(Debug)]
pub(crate) enum BlobSource {
    /// An in-memory JSON document.
    Memory {
        /// Descriptor mediaType.
        media_type: MediaType,
        /// The serialised bytes.
        bytes: Vec<u8>,
        /// `sha256:<hex>` of `bytes`.
        digest: String,
    },
    /// A finished blob file on disk.
    File {
        /// Descriptor mediaType.
        media_type: MediaType,
        /// Path of the blob contents.
        path: PathBuf,
        /// `sha256:<hex>` of the file.
        digest: String,
        /// Byte length of the file.
        size: u64,
    },
    /// A blob stored inside another OCI archive, copied verbatim.
    ArchiveEntry {
        /// Descriptor mediaType.
        media_type: MediaType,
        /// The source archive.
        archive: PathBuf,
        /// Blob digest (also names the source entry).
        digest: String,
        /// Byte length of the blob.
        size: u64,
    },
}

impl BlobSource {
    /// Wrap serialised JSON, computing its digest.
    pub(crate) fn from_bytes(media_type: MediaType, bytes: Vec<u8>) -> Result<Self> {
        let digest = format!("{}{}", SHA256_PREFIX, sha256_hex_of_slice(&bytes)?);
        Ok(BlobSource::Memory {
            media_type,
            bytes,
            digest,
        })
    }

    /// Reference a blob of another archive by its descriptor.
    pub(crate) fn from_archive_entry(archive: &Path, desc: &Descriptor) -> Self {
        BlobSource::ArchiveEntry {
            media_type: desc.media_type().clone(),
            archive: archive.to_owned(),
            digest: desc.digest().clone(),
            size: desc.size() as u64,
        }
    }

    pub(crate) fn media_type(&self) -> &MediaType {
        match self {
            BlobSource::Memory { media_type, .. } => media_type,
            BlobSource::File { media_type, .. } => media_type,
            BlobSource::ArchiveEntry { media_type, .. } => media_type,
        }
    }

    pub(crate) fn digest(&self) -> &str {
        match self {
            BlobSource::Memory { digest, .. } => digest,
            BlobSource::File { digest, .. } => digest,
            BlobSource::ArchiveEntry { digest, .. } => digest,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        match self {
            BlobSource::Memory { bytes, .. } => bytes.len() as u64,
            BlobSource::File { size, .. } => *size,
            BlobSource::ArchiveEntry { size, .. } => *size,
        }
    }

    /// The OCI descriptor for this blob.
    pub(crate) fn descriptor(&self) -> Result<Descriptor> {
        Ok(DescriptorBuilder::default()
            .media_type(self.media_type().clone())
            .digest(self.digest().to_string())
            .size(self.size() as i64)
            .build()?)
    }

    fn reader<'a>(&'a self) -> Result<Box<dyn Read + 'a>> {
        let r: Box<dyn Read> = match self {
            BlobSource::Memory { bytes, .. } => Box::new(std::io::Cursor::new(bytes.as_slice())),
            BlobSource::File { path, .. } => {
                Box::new(File::open(path).with_context(|| format!("Opening {path:?}"))?)
            }
            BlobSource::ArchiveEntry {
                archive, digest, ..
            } => {
                let name = seek::digest_to_blob_name(digest)?;
                Box::new(seek::open_entry(archive, &name)?)
            }
        };
        Ok(r)
    }
}

/// Streams an OCI image layout into a tar file.  Constructing the
/// writer emits `oci-layout` and the blob directories; `finish`
/// emits `index.json` from the registered manifest descriptors.
pub(crate) struct ImageWriter {
    builder: tar::Builder<BufWriter<File>>,
    manifests: Vec<Descriptor>,
}

fn base_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut h = tar::Header::new_ustar();
    h.set_entry_type(entry_type);
    h.set_mode(mode);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h.set_size(size);
    h
}

impl std::fmt::Debug for ImageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageWriter")
            .field("manifests", &self.manifests)
            .finish()
    }
}

impl ImageWriter {
    /// Create the output archive and write the layout preamble.
    #[context("Creating image archive {}", path.display())]
    pub(crate) fn new(path: &Path) -> Result<Self> {
        let f = BufWriter::new(File::create(path)?);
        let mut builder = tar::Builder::new(f);
        let mut h = base_header(tar::EntryType::Regular, 0o644, OCI_LAYOUT.len() as u64);
        builder.append_data(&mut h, "oci-layout", OCI_LAYOUT)?;
        for dir in ["blobs", "blobs/sha256"] {
            let mut h = base_header(tar::EntryType::Directory, 0o755, 0);
            builder.append_data(&mut h, dir, std::io::empty())?;
        }
        Ok(Self {
            builder,
            manifests: Vec::new(),
        })
    }

    /// Copy a blob into `blobs/sha256/` and return its descriptor.
    #[context("Writing blob {}", blob.digest())]
    pub(crate) fn add_blob(&mut self, blob: &BlobSource) -> Result<Descriptor> {
        let name = seek::digest_to_blob_name(blob.digest())?;
        let mut h = base_header(tar::EntryType::Regular, 0o644, blob.size());
        self.builder.append_data(&mut h, name, blob.reader()?)?;
        blob.descriptor()
    }

    /// Write a manifest blob and register it in the index.
    pub(crate) fn add_manifest(&mut self, blob: &BlobSource) -> Result<()> {
        let desc = self.add_blob(blob)?;
        self.manifests.push(desc);
        Ok(())
    }

    /// Emit `index.json` and flush the archive.
    #[context("Closing image archive")]
    pub(crate) fn finish(mut self) -> Result<()> {
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .manifests(std::mem::take(&mut self.manifests))
            .build()?;
        let data = serde_json::to_vec(&index)?;
        let mut h = base_header(tar::EntryType::Regular, 0o644, data.len() as u64);
        self.builder.append_data(&mut h, "index.json", data.as_slice())?;
        self.builder.into_inner()?.flush()?;
        Ok(())
    }
}
