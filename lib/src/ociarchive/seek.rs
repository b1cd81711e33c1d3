//! Positioning readers over entries of an outer tar archive.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{anyhow, Context};
use fn_error_context::context;
use serde::de::DeserializeOwned;

use crate::digest::parse_sha256_digest;
use crate::Result;

/// Find a named entry in a tar archive, returning its data offset
/// and size.
#[context("Locating {} in {}", name, path.display())]
fn locate_entry(path: &Path, name: &str) -> Result<(u64, u64)> {
    let f = File::open(path)?;
    let mut archive = tar::Archive::new(f);
    for entry in archive.entries()? {
        let entry = entry?;
        let p = entry.path()?;
        let p = p.to_str().unwrap_or_default();
        // Accept both `name` and `./name` spellings.
        if p == name || p.strip_prefix("./") == Some(name) {
            return Ok((entry.raw_file_position(), entry.header().size()?));
        }
    }
    Err(anyhow!("No entry {} in archive", name))
}

/// Open a bounded reader over the data of a named archive entry.
/// Calling this again for the same name is the rewind operation.
pub(crate) fn open_entry(path: &Path, name: &str) -> Result<impl Read> {
    let (pos, size) = locate_entry(path, name)?;
    let mut f = File::open(path)?;
    f.seek(SeekFrom::Start(pos))?;
    Ok(f.take(size))
}

/// Read a named archive entry into memory and parse it as JSON.
#[context("Parsing {}", name)]
pub(crate) fn json_from_archive<T: DeserializeOwned>(path: &Path, name: &str) -> Result<T> {
    let mut buf = Vec::new();
    open_entry(path, name)?
        .read_to_end(&mut buf)
        .context("Reading entry")?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Map a `sha256:<hex>` digest to its `blobs/sha256/<hex>` entry name.
pub(crate) fn digest_to_blob_name(digest: &str) -> Result<String> {
    let hex = parse_sha256_digest(digest)?;
    Ok(format!("blobs/sha256/{hex}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_archive() -> Result<tempfile::NamedTempFile> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        {
            let mut b = tar::Builder::new(&mut tmp);
            for (name, data) in [
                ("oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#.as_slice()),
                ("index.json", br#"{"schemaVersion":2,"manifests":[]}"#.as_slice()),
            ] {
                let mut h = tar::Header::new_ustar();
                h.set_entry_type(tar::EntryType::Regular);
                h.set_size(data.len() as u64);
                h.set_mode(0o644);
                b.append_data(&mut h, name, data)?;
            }
            b.finish()?;
        }
        tmp.flush()?;
        Ok(tmp)
    }

    #[test]
    fn test_open_entry() -> Result<()> {
        let tmp = test_archive()?;
        let mut buf = String::new();
        open_entry(tmp.path(), "oci-layout")?.read_to_string(&mut buf)?;
        assert_eq!(buf, r#"{"imageLayoutVersion":"1.0.0"}"#);
        assert!(open_entry(tmp.path(), "missing").is_err());
        Ok(())
    }

    #[test]
    fn test_json_from_archive() -> Result<()> {
        let tmp = test_archive()?;
        let index: oci_spec::image::ImageIndex = json_from_archive(tmp.path(), "index.json")?;
        assert_eq!(index.schema_version(), 2);
        assert!(index.manifests().is_empty());
        Ok(())
    }

    #[test]
    fn test_digest_to_blob_name() {
        let hex = "a86d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964";
        assert_eq!(
            digest_to_blob_name(&format!("sha256:{hex}")).unwrap(),
            format!("blobs/sha256/{hex}")
        );
        assert!(digest_to_blob_name(hex).is_err());
        assert!(digest_to_blob_name("md5:abcd").is_err());
    }
}
