//! Bloom-filter sketches of container images, and matching a VM
//! tree against a library of them to pick a reuse source.
//!
//! The per-entry hash covers the path and everything the layer diff
//! would compare; integer fields are serialised in native width, so
//! filters are only meaningful between builds of the same target.

use std::path::Path;

use anyhow::{anyhow, Context};
use fn_error_context::context;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;

use crate::ociarchive::reader::{self, BlobLayer};
use crate::tree::{Body, Entry, Inode, InodeRef, WalkFlags};
use crate::Result;

/// Target false-positive rate.
const FALSE_POSITIVE_RATE: f64 = 1e-5;

/// How many keyed hashes are memoised per file when scoring a tree
/// against many filters.
const PRE_HASH_LEN: usize = 15;

const USTAR_RECORD: u64 = 512;

/// Keyed hash of one regular-file entry at `path` (relative, no
/// leading slash).  `key` selects one of the filter's hash
/// functions.
fn entry_hash(path: &str, inode: &Inode, key: u8) -> Result<u32> {
    let pkey = PKey::hmac(&[key])?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(path.as_bytes())?;
    signer.update(&[0u8])?;
    signer.update(&(inode.stat.mode).to_ne_bytes())?;
    signer.update(&(inode.stat.uid as u32).to_ne_bytes())?;
    signer.update(&(inode.stat.gid as u32).to_ne_bytes())?;
    signer.update(&(inode.stat.size as i64).to_ne_bytes())?;
    signer.update(&inode.stat.mtime.sec.to_ne_bytes())?;
    let sha = match &inode.body {
        Body::Regular { sha256: Some(sum) } => *sum,
        _ => [0u8; 32],
    };
    signer.update(&sha)?;
    for xattr in &inode.xattrs {
        signer.update(xattr.name.as_bytes())?;
        signer.update(&[0u8])?;
        signer.update(&xattr.value.len().to_ne_bytes())?;
        signer.update(&xattr.value)?;
    }
    let digest = signer.sign_to_vec()?;
    Ok(u32::from_le_bytes(digest[..4].try_into().unwrap()))
}

/// The smallest power-of-two bit count (as its log2) able to hold
/// `entries` at the target false-positive rate, floored at 8 bits.
fn bloom_log2m(entries: u64, p: f64) -> u32 {
    let ln2 = std::f64::consts::LN_2;
    let wanted = ((-(entries as f64) * p.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
    let mut log2m = 3;
    let mut bits = 8u64;
    while bits < wanted {
        bits <<= 1;
        log2m += 1;
    }
    log2m
}

/// Optimal hash count for `bits` over `entries`, capped at one byte.
fn bloom_hashes(bits: u64, entries: u64) -> u8 {
    let k = ((bits as f64 / entries as f64) * std::f64::consts::LN_2).round();
    k.clamp(1.0, 255.0) as u8
}

fn bit_index(hash: u32, log2m: u32) -> usize {
    (hash as u64 & ((1u64 << log2m) - 1)) as usize
}

/// A regular file flattened out of a tree, with its memoised hash
/// prefix.
struct ScoredFile {
    path: String,
    inode: InodeRef,
    pre: [u32; PRE_HASH_LEN],
}

/// A tree prepared for scoring against many filters.
pub(crate) struct TreeScorer {
    files: Vec<ScoredFile>,
}

fn collect_regular_files(entry: &Entry, prefix: &str, out: &mut Vec<(String, InodeRef)>) {
    let inode = entry.inode.borrow();
    match &inode.body {
        Body::Regular { .. } => {
            out.push((format!("{prefix}{}", entry.name), entry.inode.clone()));
        }
        Body::Directory { children } => {
            let child_prefix = if entry.name == "/" {
                prefix.to_string()
            } else {
                format!("{prefix}{}/", entry.name)
            };
            for child in children {
                collect_regular_files(child, &child_prefix, out);
            }
        }
        _ => {}
    }
}

impl TreeScorer {
    /// Flatten the tree's regular files and precompute their hash
    /// prefixes.
    #[context("Preparing tree for matching")]
    pub(crate) fn new(tree: &Entry) -> Result<Self> {
        let mut flat = Vec::new();
        collect_regular_files(tree, "", &mut flat);
        let mut files = Vec::with_capacity(flat.len());
        for (path, inode) in flat {
            let mut pre = [0u32; PRE_HASH_LEN];
            {
                let inode = inode.borrow();
                for (i, slot) in pre.iter_mut().enumerate() {
                    *slot = entry_hash(&path, &inode, i as u8)?;
                }
            }
            files.push(ScoredFile { path, inode, pre });
        }
        Ok(Self { files })
    }

    /// Estimated tar bytes reusable from the image this filter
    /// summarises: header plus rounded payload for every file whose
    /// bits are all present.
    pub(crate) fn score(&self, filter: &FilterFile) -> Result<u64> {
        let mut total = 0u64;
        'files: for file in &self.files {
            let inode = file.inode.borrow();
            for i in 0..filter.k {
                let hash = if (i as usize) < PRE_HASH_LEN {
                    file.pre[i as usize]
                } else {
                    entry_hash(&file.path, &inode, i)?
                };
                if !filter.contains_bit(bit_index(hash, filter.log2m)) {
                    continue 'files;
                }
            }
            total += inode.stat.size.div_ceil(USTAR_RECORD) * USTAR_RECORD + USTAR_RECORD;
        }
        Ok(total)
    }
}

/// A loaded membership sketch: one byte of hash count, then the bit
/// array.
pub(crate) struct FilterFile {
    k: u8,
    log2m: u32,
    bits: Vec<u8>,
}

impl FilterFile {
    /// Parse filter bytes, validating the length shape (1 + a power
    /// of two).
    pub(crate) fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < 2 || !(data.len() - 1).is_power_of_two() {
            return Err(anyhow!("Mis-sized filter ({} bytes)", data.len()));
        }
        let log2m = (data.len() - 1).trailing_zeros() + 3;
        let mut bits = data;
        let k = bits.remove(0);
        Ok(Self { k, log2m, bits })
    }

    #[context("Loading filter {}", path.display())]
    pub(crate) fn load(path: &Path) -> Result<Self> {
        Self::parse(std::fs::read(path)?)
    }

    fn contains_bit(&self, index: usize) -> bool {
        self.bits[index >> 3] & (1 << (index & 7)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.bits[index >> 3] |= 1 << (index & 7);
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.bits.len());
        out.push(self.k);
        out.extend_from_slice(&self.bits);
        out
    }
}

/// Build the membership sketch of a tree's regular files.
#[context("Building filter")]
pub(crate) fn build_filter(tree: &Entry) -> Result<FilterFile> {
    let mut flat = Vec::new();
    collect_regular_files(tree, "", &mut flat);
    let entries = (flat.len() as u64).max(1);
    let log2m = bloom_log2m(entries, FALSE_POSITIVE_RATE);
    let k = bloom_hashes(1u64 << log2m, entries);
    let mut filter = FilterFile {
        k,
        log2m,
        bits: vec![0u8; 1usize << (log2m - 3)],
    };
    for (path, inode) in flat {
        let inode = inode.borrow();
        for i in 0..k {
            let hash = entry_hash(&path, &inode, i)?;
            filter.set_bit(bit_index(hash, log2m));
        }
    }
    Ok(filter)
}

/// Flatten an OCI archive's layer stack into its effective tree,
/// with content checksums.
#[context("Flattening image {}", archive.display())]
pub(crate) fn flatten_image_tree(archive: &Path) -> Result<Entry> {
    let index = reader::read_index(archive)?;
    let manifest_digest = reader::native_manifest_digest(&index)?;
    let manifest = reader::read_manifest(archive, &manifest_digest)?;
    let flags = WalkFlags {
        checksum: true,
        ..Default::default()
    };
    let mut tree: Option<Entry> = None;
    for i in 0..manifest.layers().len() {
        let mut layer = BlobLayer::from_manifest(archive, &manifest, i)?;
        match tree.as_mut() {
            None => tree = Some(crate::tree::layer::from_oci_layer(&mut layer, &flags)?),
            Some(t) => crate::tree::layer::apply_oci_layer(t, &mut layer, &flags)?,
        }
    }
    Ok(tree.unwrap_or_else(Entry::new_root))
}

/// Summarise an OCI archive as a filter file.  The output must not
/// already exist.
#[context("Writing filter {}", output.display())]
pub(crate) fn build_filter_file(archive: &Path, output: &Path) -> Result<()> {
    let tree = flatten_image_tree(archive)?;
    let filter = build_filter(&tree)?;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .context("Failed to create filter")?;
    std::io::Write::write_all(&mut f, &filter.to_bytes())?;
    Ok(())
}

/// One scored candidate image.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FilterMatch {
    pub(crate) image: String,
    pub(crate) estimated_reuse: u64,
}

/// Rebuild an image reference from a filter's path under the data
/// directory: the last `/` becomes `:`, or `@` when the tail
/// already carries a digest algorithm.
fn reconstruct_image_ref(rel: &str) -> String {
    match rel.rfind('/') {
        None => rel.to_string(),
        Some(pos) => {
            let tail = &rel[pos + 1..];
            let sep = if tail.contains(':') { '@' } else { ':' };
            format!("{}{}{}", &rel[..pos], sep, tail)
        }
    }
}

/// Walk `data_dir` for `*.filter` files and score the tree against
/// each, ranked by descending estimated reuse (ties by name).
#[context("Scoring filter library {}", data_dir.display())]
pub(crate) fn score_directory(scorer: &TreeScorer, data_dir: &Path) -> Result<Vec<FilterMatch>> {
    let mut results = Vec::new();
    for entry in walkdir::WalkDir::new(data_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(".filter") {
            continue;
        }
        let filter = match FilterFile::load(entry.path()) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("skipping {}: {e}", entry.path().display());
                continue;
            }
        };
        let rel = entry
            .path()
            .strip_prefix(data_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        let image = reconstruct_image_ref(rel.trim_end_matches(".filter"));
        results.push(FilterMatch {
            image,
            estimated_reuse: scorer.score(&filter)?,
        });
    }
    results.sort_by(|a, b| {
        b.estimated_reuse
            .cmp(&a.estimated_reuse)
            .then_with(|| a.image.cmp(&b.image))
    });
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testutil::{attach, regular};
    use crate::tree::Timespec;

    fn sample_tree(n: u64) -> Entry {
        let root = Entry::new_root();
        let d = crate::tree::Inode::new_dir(0o755);
        attach(&root.inode, "data", d.clone());
        for i in 0..n {
            let f = regular(i + 1, 100 + i, Some([i as u8; 32]));
            f.borrow_mut().stat.mtime = Timespec {
                sec: 1000 + i as i64,
                nsec: 0,
            };
            attach(&d, &format!("file{i}"), f);
        }
        root
    }

    #[test]
    fn test_bloom_parameters() {
        // n=1000, p=1e-5 needs 23963 bits, rounded up to 2^15.
        assert_eq!(bloom_log2m(1000, 1e-5), 15);
        assert_eq!(bloom_hashes(1 << 15, 1000), 23);
        // Tiny populations are floored at 8 bits worth of shape.
        assert!(bloom_log2m(1, 0.5) >= 3);
    }

    #[test]
    fn test_filter_soundness() -> Result<()> {
        let tree = sample_tree(20);
        let filter = build_filter(&tree)?;
        let scorer = TreeScorer::new(&tree)?;
        let score = scorer.score(&filter)?;
        // Every file fits in one payload record here.
        assert_eq!(score, 20 * (512 + 512));
        Ok(())
    }

    #[test]
    fn test_filter_rejects_other_tree() -> Result<()> {
        let filter = build_filter(&sample_tree(50))?;
        let other = Entry::new_root();
        let f = regular(1, 4096, Some([0xaa; 32]));
        attach(&other.inode, "unrelated", f);
        let scorer = TreeScorer::new(&other)?;
        // One unrelated file against a 50-file sketch; at p=1e-5 a
        // false positive here would be vanishingly unlikely.
        assert_eq!(scorer.score(&filter)?, 0);
        Ok(())
    }

    #[test]
    fn test_hash_covers_metadata() -> Result<()> {
        let a = regular(1, 100, Some([1; 32]));
        let b = regular(1, 100, Some([1; 32]));
        b.borrow_mut().stat.uid = 1000;
        let ha = entry_hash("etc/passwd", &a.borrow(), 0)?;
        let hb = entry_hash("etc/passwd", &b.borrow(), 0)?;
        let hc = entry_hash("etc/passwd", &a.borrow(), 1)?;
        assert_ne!(ha, hb);
        assert_ne!(ha, hc);
        assert_eq!(ha, entry_hash("etc/passwd", &a.borrow(), 0)?);
        Ok(())
    }

    #[test]
    fn test_filter_file_shape() {
        // 1 + 16 bytes: valid (m = 128 bits).
        let f = FilterFile::parse(vec![0u8; 17]).unwrap();
        assert_eq!(f.log2m, 7);
        // Even length or non-power-of-two remainder: rejected.
        assert!(FilterFile::parse(vec![0u8; 18]).is_err());
        assert!(FilterFile::parse(vec![0u8; 1]).is_err());
        assert!(FilterFile::parse(vec![0u8; 24]).is_err());
    }

    #[test]
    fn test_reconstruct_image_ref() {
        assert_eq!(
            reconstruct_image_ref("docker.io/library/ubuntu/latest"),
            "docker.io/library/ubuntu:latest"
        );
        assert_eq!(
            reconstruct_image_ref("quay.io/app/sha256:0011"),
            "quay.io/app@sha256:0011"
        );
        assert_eq!(reconstruct_image_ref("plain"), "plain");
    }

    #[test]
    fn test_score_directory_ranking() -> Result<()> {
        let tree = sample_tree(10);
        let scorer = TreeScorer::new(&tree)?;
        let dir = tempfile::tempdir()?;
        let full = build_filter(&tree)?;
        std::fs::create_dir_all(dir.path().join("images/good"))?;
        std::fs::write(dir.path().join("images/good/latest.filter"), full.to_bytes())?;
        // An empty sketch of the right shape matches nothing.
        let empty = FilterFile {
            k: full.k,
            log2m: full.log2m,
            bits: vec![0u8; full.bits.len()],
        };
        std::fs::write(dir.path().join("images/empty.filter"), empty.to_bytes())?;
        // Junk that fails shape validation is skipped.
        std::fs::write(dir.path().join("images/bad.filter"), vec![0u8; 6])?;

        let results = score_directory(&scorer, dir.path())?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].image, "images/good:latest");
        assert_eq!(results[0].estimated_reuse, 10 * 1024);
        assert_eq!(results[1].image, "images:empty");
        assert_eq!(results[1].estimated_reuse, 0);
        Ok(())
    }
}
