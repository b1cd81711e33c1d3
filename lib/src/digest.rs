//! SHA-256 digest helpers shared by the blob writers and the tree
//! builders.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::anyhow;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};

use crate::Result;

/// The `<algo>:` prefix this crate produces and accepts.
pub(crate) const SHA256_PREFIX: &str = "sha256:";

const READ_BUFSZ: usize = 128 * 1024;

pub(crate) fn new_sha256_hasher() -> Result<Hasher> {
    Ok(Hasher::new(MessageDigest::sha256())?)
}

/// A pass-through writer which computes the sha256 of everything
/// written through it.
pub(crate) struct Sha256Writer<W> {
    inner: W,
    hash: Hasher,
    size: u64,
}

impl<W: Write> Sha256Writer<W> {
    pub(crate) fn new(inner: W) -> Result<Self> {
        Ok(Self {
            inner,
            hash: new_sha256_hasher()?,
            size: 0,
        })
    }

    /// Consume the writer, returning the inner sink, the hex digest
    /// and the number of bytes written.
    pub(crate) fn finish(mut self) -> Result<(W, String, u64)> {
        let digest = hex::encode(self.hash.finish()?);
        Ok((self.inner, digest, self.size))
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hash.update(&buf[..n])?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Compute the hex sha256 of a byte slice.
pub(crate) fn sha256_hex_of_slice(buf: &[u8]) -> Result<String> {
    let mut hash = new_sha256_hasher()?;
    hash.update(buf)?;
    Ok(hex::encode(hash.finish()?))
}

/// Compute the hex sha256 of a file's contents, streaming.
#[context("Hashing {}", path.display())]
pub(crate) fn sha256_hex_of_file(path: &Path) -> Result<String> {
    let mut src = BufReader::new(File::open(path)?);
    let mut hash = new_sha256_hasher()?;
    let mut buf = vec![0u8; READ_BUFSZ];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n])?;
    }
    Ok(hex::encode(hash.finish()?))
}

/// Validate a bare hex sha256 (no algorithm prefix).
pub(crate) fn validate_sha256(input: &str) -> Result<&str> {
    if input.len() != 64 {
        return Err(anyhow!("Invalid sha256 checksum (len) {}", input));
    }
    if !input.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(anyhow!("Invalid sha256 checksum {}", input));
    }
    Ok(input)
}

/// Strip the `sha256:` prefix from a digest, validating the rest.
pub(crate) fn parse_sha256_digest(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix(SHA256_PREFIX)
        .ok_or_else(|| anyhow!("Unsupported digest algorithm {}", digest))?;
    validate_sha256(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_writer() -> Result<()> {
        let mut w = Sha256Writer::new(Vec::new())?;
        w.write_all(b"hello world")?;
        let (buf, digest, size) = w.finish()?;
        assert_eq!(buf, b"hello world");
        assert_eq!(size, 11);
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(digest, sha256_hex_of_slice(b"hello world")?);
        Ok(())
    }

    #[test]
    fn test_validate_sha256() {
        let err_cases = &[
            "a86d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b9644",
            "a86d80a3E9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964",
        ];
        for input in err_cases {
            validate_sha256(input).unwrap_err();
        }
        validate_sha256("a86d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964")
            .unwrap();
    }

    #[test]
    fn test_parse_digest() {
        assert!(parse_sha256_digest("sha512:00").is_err());
        assert!(parse_sha256_digest("00").is_err());
        let hex = "a86d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964";
        assert_eq!(
            parse_sha256_digest(&format!("sha256:{hex}")).unwrap(),
            hex
        );
    }
}
