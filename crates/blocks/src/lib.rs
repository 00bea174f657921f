#![deny(unsafe_code)]

//! Fixed-size, content-hashed block lists.
//!
//! A file is compared against another version of itself as an ordered list of
//! [`Block`]s. Every block except the last covers exactly `block_size` bytes
//! and is identified by the SHA-256 [`BlockDigest`] of its contents. Two
//! [`FileVersion`]s with the same digests in the same order describe the same
//! bytes.
//!
//! # See also
//!
//! - `inplace` crate for the planner and apply engine that consume these lists

mod block;
mod digest;
mod version;

pub use block::Block;
pub use digest::{BlockDigest, DIGEST_LEN, ParseDigestError};
pub use version::{BlockError, DEFAULT_BLOCK_SIZE, FileVersion};
