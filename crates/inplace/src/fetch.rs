//! Network pulls for blocks no local file can provide.
//!
//! A [`BlockFetcher`] accepts requests and answers each one exactly once by
//! sending a [`PullDelivery`] on the reply channel, possibly from another
//! thread. [`fetch_all`] issues every pull of a plan, waits for the answers
//! under one deadline and verifies each block against its digest. All pulls
//! resolve before the destination is touched, so a missing block costs
//! nothing but a later retry.

use std::time::{Duration, Instant};

use blocks::{BlockDigest, FileVersion};
use crossbeam_channel::{RecvTimeoutError, Sender};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::error::InPlaceError;
use crate::key::FileKey;
use crate::plan::DeltaPlan;
use crate::trace;

/// One block wanted from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PullRequest {
    /// Digest of the wanted block.
    pub digest: BlockDigest,
    /// Destination block index.
    pub dest: usize,
    /// Expected length of the block.
    pub size: u32,
}

/// Why a peer could not provide a block.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PullFailure {
    /// No peer has the block.
    #[error("block unavailable")]
    Unavailable,
    /// The transfer failed.
    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// Answer to one [`PullRequest`].
#[derive(Clone, Debug)]
pub struct PullDelivery {
    /// Destination block index of the request.
    pub dest: usize,
    /// Block bytes, or the reason they are missing.
    pub result: Result<Vec<u8>, PullFailure>,
}

/// Source of block data held by peers.
pub trait BlockFetcher: Send + Sync {
    /// Starts fetching `request` for `key`; the answer is sent on `reply`.
    ///
    /// Implementations must send at most one delivery per request. A request
    /// that is never answered counts as unresolved once the pull timeout
    /// elapses.
    fn fetch(&self, key: &FileKey, request: PullRequest, reply: Sender<PullDelivery>);
}

/// Fetcher serving blocks from memory, keyed by digest.
#[derive(Clone, Debug, Default)]
pub struct LocalFetcher {
    blocks: FxHashMap<BlockDigest, Vec<u8>>,
}

impl LocalFetcher {
    /// Creates an empty fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves every block of `data` cut at `block_size`.
    #[must_use]
    pub fn from_bytes(data: &[u8], block_size: u32) -> Self {
        let mut fetcher = Self::new();
        if block_size > 0 {
            for chunk in data.chunks(block_size as usize) {
                fetcher.insert(chunk.to_vec());
            }
        }
        fetcher
    }

    /// Serves `data` under its digest.
    pub fn insert(&mut self, data: Vec<u8>) {
        self.blocks.insert(BlockDigest::of(&data), data);
    }

    /// Returns the number of distinct blocks served.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Reports whether no block is served.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockFetcher for LocalFetcher {
    fn fetch(&self, _key: &FileKey, request: PullRequest, reply: Sender<PullDelivery>) {
        let result = self
            .blocks
            .get(&request.digest)
            .cloned()
            .ok_or(PullFailure::Unavailable);
        // The receiver is gone only when the waiting side already gave up.
        let _ = reply.send(PullDelivery {
            dest: request.dest,
            result,
        });
    }
}

/// Verified pull results, keyed by destination block index.
#[derive(Clone, Debug, Default)]
pub struct PulledBlocks {
    by_dest: FxHashMap<usize, Vec<u8>>,
}

impl PulledBlocks {
    /// Returns the bytes fetched for destination `dest`.
    #[must_use]
    pub fn get(&self, dest: usize) -> Option<&[u8]> {
        self.by_dest.get(&dest).map(Vec::as_slice)
    }

    /// Returns the number of fetched blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_dest.len()
    }

    /// Reports whether nothing was fetched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_dest.is_empty()
    }

    /// Records `data` for `dest` without verification.
    pub fn insert(&mut self, dest: usize, data: Vec<u8>) {
        self.by_dest.insert(dest, data);
    }
}

/// Issues every pull of `plan` and waits up to `timeout` for the answers.
///
/// Blocks that fail, time out or arrive with the wrong digest are reported
/// together as [`InPlaceError::PullUnresolved`], sorted by index.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(level = "debug", skip_all, fields(file = %plan.key()))
)]
pub fn fetch_all(
    fetcher: &dyn BlockFetcher,
    plan: &DeltaPlan,
    timeout: Duration,
) -> Result<PulledBlocks, InPlaceError> {
    let mut pulled = PulledBlocks::default();
    if plan.pulls().is_empty() {
        return Ok(pulled);
    }

    let target = plan.target();
    let mut pending: FxHashMap<usize, PullRequest> = FxHashMap::default();
    let (reply, deliveries) = crossbeam_channel::bounded(plan.pulls().len());
    for pull in plan.pulls() {
        let request = PullRequest {
            digest: pull.digest,
            dest: pull.dest,
            size: expected_size(target, pull.dest),
        };
        pending.insert(pull.dest, request);
        fetcher.fetch(plan.key(), request, reply.clone());
    }
    drop(reply);

    let deadline = Instant::now() + timeout;
    let mut unresolved = Vec::new();
    while !pending.is_empty() {
        let delivery = match deliveries.recv_deadline(deadline) {
            Ok(delivery) => delivery,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
        };
        let Some(request) = pending.remove(&delivery.dest) else {
            continue;
        };
        match delivery.result {
            Ok(data) if data.len() == request.size as usize && request.digest.matches(&data) => {
                pulled.insert(request.dest, data);
            }
            Ok(_) => {
                let failure = PullFailure::Transfer("digest mismatch".into());
                trace::pull_failed(plan.key(), request.dest, &failure);
                unresolved.push(request.dest);
            }
            Err(failure) => {
                trace::pull_failed(plan.key(), request.dest, &failure);
                unresolved.push(request.dest);
            }
        }
    }

    unresolved.extend(pending.into_keys());
    if unresolved.is_empty() {
        Ok(pulled)
    } else {
        unresolved.sort_unstable();
        Err(InPlaceError::PullUnresolved { blocks: unresolved })
    }
}

fn expected_size(target: &FileVersion, dest: usize) -> u32 {
    target.block(dest).map_or(0, |block| block.size())
}
