//! Reading and writing OCI image archives.
//!
//! An OCI archive here is an uncompressed tar holding the standard
//! image layout: `oci-layout`, `blobs/sha256/<hex>` and
//! `index.json`.  The reader side walks index → manifest → config →
//! layers; the writer side produces the same layout from blobs that
//! may live in memory, in a file on disk, or inside another archive.

use anyhow::anyhow;
use oci_spec::image::MediaType;

use crate::Result;

pub(crate) mod layer;
pub(crate) mod reader;
pub(crate) mod seek;
pub(crate) mod writer;

/// Layer blob compression, as encoded in the layer mediaType.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    /// Plain tar.
    None,
    /// tar+gzip
    Gzip,
    /// tar+zstd
    Zstd,
}

impl Compression {
    /// The mediaType emitted for new layers of this compression.
    pub(crate) fn layer_media_type(&self) -> MediaType {
        match self {
            Compression::None => MediaType::ImageLayer,
            Compression::Gzip => MediaType::ImageLayerGzip,
            Compression::Zstd => MediaType::ImageLayerZstd,
        }
    }

    /// Recover the compression from a manifest layer descriptor,
    /// including the `nondistributable` siblings.
    pub(crate) fn from_layer_media_type(mt: &MediaType) -> Result<Self> {
        let r = match mt {
            MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => Compression::None,
            MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => {
                Compression::Gzip
            }
            MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => {
                Compression::Zstd
            }
            o => return Err(anyhow!("Unhandled layer mediaType {}", o)),
        };
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_media_types() {
        for (mt, c) in [
            (MediaType::ImageLayer, Compression::None),
            (MediaType::ImageLayerGzip, Compression::Gzip),
            (MediaType::ImageLayerZstd, Compression::Zstd),
            (
                MediaType::ImageLayerNonDistributable,
                Compression::None,
            ),
            (
                MediaType::ImageLayerNonDistributableGzip,
                Compression::Gzip,
            ),
            (
                MediaType::ImageLayerNonDistributableZstd,
                Compression::Zstd,
            ),
        ] {
            assert_eq!(Compression::from_layer_media_type(&mt).unwrap(), c);
        }
        assert!(Compression::from_layer_media_type(&MediaType::ImageConfig).is_err());
    }
}
