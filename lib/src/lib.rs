//! # Convert between OCI container images and VM disk images
//!
//! This crate converts OCI container image archives into bootable
//! qcow2 disk images carrying a btrfs filesystem (with one read-only
//! snapshot per layer), and converts such disk images back into OCI
//! archives, optionally reusing layer blobs from a source image.
//! Two auxiliary tools summarise an image as a Bloom-filter sketch
//! of its files and score a disk image against a library of such
//! sketches.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
type Result<T> = anyhow::Result<T>;

mod c2v;
pub mod cli;
pub(crate) mod digest;
pub(crate) mod filter;
pub(crate) mod guest;
pub(crate) mod ociarchive;
pub(crate) mod tree;
mod v2c;
