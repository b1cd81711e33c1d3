//! Reading the index, manifest, config and layers of an OCI archive.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use fn_error_context::context;
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest, MediaType};

use super::seek;
use super::Compression;
use crate::Result;

/// The Go-style architecture name this build targets; used both for
/// selecting a manifest from a multi-platform index and for the
/// `architecture` field of emitted configs.
// See https://golang.org/doc/install/source#environment
pub(crate) const NATIVE_GOARCH: &str = if cfg!(target_arch = "x86_64") {
    "amd64"
} else if cfg!(target_arch = "x86") {
    "386"
} else if cfg!(target_arch = "aarch64") {
    "arm64"
} else if cfg!(target_arch = "arm") {
    "arm"
} else if cfg!(all(target_arch = "powerpc64", target_endian = "little")) {
    "ppc64le"
} else if cfg!(all(target_arch = "powerpc64", target_endian = "big")) {
    "ppc64"
} else if cfg!(all(target_arch = "mips64", target_endian = "little")) {
    "mips64le"
} else if cfg!(all(target_arch = "mips64", target_endian = "big")) {
    "mips64"
} else if cfg!(all(target_arch = "mips", target_endian = "little")) {
    "mipsle"
} else if cfg!(all(target_arch = "mips", target_endian = "big")) {
    "mips"
} else if cfg!(target_arch = "s390x") {
    "s390x"
} else if cfg!(target_arch = "riscv64") {
    "riscv64"
} else {
    "unknown"
};

const NATIVE_OS: &str = "linux";

/// Read and validate `index.json`.
#[context("Reading index")]
pub(crate) fn read_index(path: &Path) -> Result<ImageIndex> {
    let index: ImageIndex = seek::json_from_archive(path, "index.json")?;
    if index.schema_version() != 2 {
        return Err(anyhow!(
            "Unsupported index schemaVersion {}",
            index.schema_version()
        ));
    }
    Ok(index)
}

/// Select the manifest for the build's native platform: the first
/// image-manifest descriptor either carrying no platform constraint
/// or matching (NATIVE_GOARCH, linux).
pub(crate) fn native_manifest_digest(index: &ImageIndex) -> Result<String> {
    for desc in index.manifests() {
        if !matches!(desc.media_type(), MediaType::ImageManifest) {
            continue;
        }
        match desc.platform() {
            None => return Ok(desc.digest().clone()),
            Some(p) => {
                if p.architecture().to_string() == NATIVE_GOARCH
                    && p.os().to_string() == NATIVE_OS
                {
                    return Ok(desc.digest().clone());
                }
            }
        }
    }
    Err(anyhow!("No manifest for {}/{}", NATIVE_GOARCH, NATIVE_OS))
}

/// Read and validate a manifest blob.
#[context("Reading manifest {}", digest)]
pub(crate) fn read_manifest(path: &Path, digest: &str) -> Result<ImageManifest> {
    let name = seek::digest_to_blob_name(digest)?;
    let manifest: ImageManifest = seek::json_from_archive(path, &name)?;
    if manifest.schema_version() != 2 {
        return Err(anyhow!(
            "Unsupported manifest schemaVersion {}",
            manifest.schema_version()
        ));
    }
    Ok(manifest)
}

/// Read the config blob named by a manifest.
#[context("Reading config")]
pub(crate) fn read_config(path: &Path, manifest: &ImageManifest) -> Result<ImageConfiguration> {
    let desc = manifest.config();
    if !matches!(desc.media_type(), MediaType::ImageConfig) {
        return Err(anyhow!("Unhandled config mediaType {}", desc.media_type()));
    }
    let name = seek::digest_to_blob_name(desc.digest())?;
    seek::json_from_archive(path, &name)
}

/// A rewindable stream of tar entries from one layer.
///
/// Layers are read twice per application (whiteout pass, then data
/// pass); every `open` call restarts the stream from the beginning.
pub(crate) trait LayerSource {
    /// Open (or reopen, rewinding) the layer's tar stream.
    fn open<'a>(&'a mut self) -> Result<tar::Archive<Box<dyn Read + 'a>>>;
}

/// A layer stored as a blob inside an OCI archive on disk.
#[derive(Debug)]
pub(crate) struct BlobLayer {
    archive: PathBuf,
    entry_name: String,
    compression: Compression,
}

impl BlobLayer {
    /// Reference the layer blob `digest` inside `archive`, to be
    /// decoded per `compression` (from the manifest mediaType).
    pub(crate) fn new(archive: &Path, digest: &str, compression: Compression) -> Result<Self> {
        Ok(Self {
            archive: archive.to_owned(),
            entry_name: seek::digest_to_blob_name(digest)?,
            compression,
        })
    }

    /// Look up layer `index` of a manifest.
    pub(crate) fn from_manifest(
        archive: &Path,
        manifest: &ImageManifest,
        index: usize,
    ) -> Result<Self> {
        let desc = manifest
            .layers()
            .get(index)
            .ok_or_else(|| anyhow!("No layer {} in manifest", index))?;
        let compression = Compression::from_layer_media_type(desc.media_type())?;
        Self::new(archive, desc.digest(), compression)
    }
}

impl LayerSource for BlobLayer {
    fn open<'a>(&'a mut self) -> Result<tar::Archive<Box<dyn Read + 'a>>> {
        let raw = seek::open_entry(&self.archive, &self.entry_name)?;
        // Keep the intermediate buffering bounded rather than
        // materialising the decompressed blob.
        let raw = BufReader::with_capacity(4096, raw);
        let src: Box<dyn Read> = match self.compression {
            Compression::None => Box::new(raw),
            Compression::Gzip => Box::new(flate2::read::GzDecoder::new(raw)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(raw)?),
        };
        Ok(tar::Archive::new(src))
    }
}

/// An in-memory layer tar, used by tests as a synthetic layer.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemLayer(pub(crate) Vec<u8>);

#[cfg(test)]
impl LayerSource for MemLayer {
    fn open<'a>(&'a mut self) -> Result<tar::Archive<Box<dyn Read + 'a>>> {
        Ok(tar::Archive::new(Box::new(std::io::Cursor::new(
            self.0.as_slice(),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{DescriptorBuilder, ImageIndexBuilder, PlatformBuilder, SCHEMA_VERSION};

    fn desc(media_type: MediaType, digest: &str, arch: Option<&str>) -> oci_spec::image::Descriptor {
        let b = DescriptorBuilder::default()
            .media_type(media_type)
            .digest(format!("sha256:{}", digest.repeat(64)))
            .size(1234i64);
        let b = if let Some(arch) = arch {
            let arch: oci_spec::image::Arch =
                serde_json::from_value(serde_json::json!(arch)).unwrap();
            let os: oci_spec::image::Os =
                serde_json::from_value(serde_json::json!("linux")).unwrap();
            let platform = PlatformBuilder::default()
                .architecture(arch)
                .os(os)
                .build()
                .unwrap();
            b.platform(platform)
        } else {
            b
        };
        b.build().unwrap()
    }

    #[test]
    fn test_native_manifest_selection() {
        // A platformless manifest descriptor always matches.
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .manifests(vec![
                desc(MediaType::ImageConfig, "0", None),
                desc(MediaType::ImageManifest, "1", None),
            ])
            .build()
            .unwrap();
        let digest = native_manifest_digest(&index).unwrap();
        assert_eq!(digest, format!("sha256:{}", "1".repeat(64)));

        // Mismatched platforms are skipped, matching ones accepted.
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .manifests(vec![
                desc(MediaType::ImageManifest, "2", Some("wasm")),
                desc(MediaType::ImageManifest, "3", Some(NATIVE_GOARCH)),
            ])
            .build()
            .unwrap();
        let digest = native_manifest_digest(&index).unwrap();
        assert_eq!(digest, format!("sha256:{}", "3".repeat(64)));

        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .manifests(vec![desc(MediaType::ImageManifest, "4", Some("wasm"))])
            .build()
            .unwrap();
        assert!(native_manifest_digest(&index).is_err());
    }

    #[test]
    fn test_native_goarch() {
        // The table must resolve on every supported build target.
        assert_ne!(NATIVE_GOARCH, "unknown");
    }
}
