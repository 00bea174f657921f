mod common;

use std::sync::Arc;
use std::time::Duration;

use blocks::FileVersion;
use common::{BLOCK, config, folders, job, request, version};
use inplace::{
    CancelToken, Dependencies, ErrorCategory, FileKey, FolderId, IneligibleReason, InPlaceError,
    LocalFetcher, LockSet, LockTable, MemoryBlockIndex, Pipeline, PullState, UpdateJob,
    UpdateOutcome, UpdateRequest,
};
use proptest::prelude::*;
use test_support::{FolderTree, blocks_of};

fn block() -> usize {
    BLOCK as usize
}

#[test]
fn reordered_blocks_commit_with_one_scratch_read() {
    let tree = FolderTree::new().expect("tree");
    let current = blocks_of(&[1, 2, 3, 4], block());
    let target = blocks_of(&[1, 3, 2, 4, 5], block());
    tree.write("doc", &current).expect("write");
    let job = job(
        Arc::new(folders(&tree)),
        MemoryBlockIndex::new(),
        LocalFetcher::from_bytes(&target, BLOCK),
    );

    let report = job.run(&request(&FileKey::new("f", "doc"), &current, &target));
    let UpdateOutcome::Committed(stats) = report.outcome else {
        panic!("unexpected outcome {:?}", report.outcome);
    };
    assert_eq!(stats.identity, 2);
    assert_eq!(stats.local, 2);
    assert_eq!(stats.from_scratch, 1);
    assert_eq!(stats.pulled, 1);
    assert_eq!(stats.staged_bytes, 2 * BLOCK as u64);
    assert_eq!(tree.read("doc").expect("read"), target);
}

#[test]
fn blocks_of_other_files_are_copied_not_pulled() {
    let tree = FolderTree::new().expect("tree");
    let current = blocks_of(&[1, 2, 3], block());
    let other = blocks_of(&[7, 8], block());
    let target = blocks_of(&[1, 8, 3, 7], block());
    tree.write("doc", &current).expect("write");
    tree.write("other", &other).expect("write");

    let mut index = MemoryBlockIndex::new();
    index.insert_file(FileKey::new("f", "other"), &version(&other));
    let job = job(Arc::new(folders(&tree)), index, LocalFetcher::new());

    let report = job.run(&request(&FileKey::new("f", "doc"), &current, &target));
    let UpdateOutcome::Committed(stats) = report.outcome else {
        panic!("unexpected outcome {:?}", report.outcome);
    };
    assert_eq!(stats.external, 2);
    assert_eq!(stats.pulled, 0);
    assert_eq!(tree.read("doc").expect("read"), target);
    assert_eq!(tree.read("other").expect("read"), other);
}

#[test]
fn sources_indexed_at_another_block_size_are_read_at_their_offset() {
    let tree = FolderTree::new().expect("tree");
    let head = blocks_of(&[1], block());
    let current = [head.as_slice(), b"bb"].concat();
    let target = [head.as_slice(), b"XY"].concat();
    tree.write("doc", &current).expect("write");
    tree.write("other", b"ZZXY").expect("write");

    let mut index = MemoryBlockIndex::new();
    let other = FileVersion::from_bytes(b"ZZXY", 2).expect("hash");
    index.insert_file(FileKey::new("f", "other"), &other);
    let job = job(Arc::new(folders(&tree)), index, LocalFetcher::new());

    let report = job.run(&request(&FileKey::new("f", "doc"), &current, &target));
    let UpdateOutcome::Committed(stats) = report.outcome else {
        panic!("unexpected outcome {:?}", report.outcome);
    };
    assert_eq!(stats.external, 1);
    assert_eq!(stats.pulled, 0);
    assert_eq!(tree.read("doc").expect("read"), target);
}

#[test]
fn changed_external_sources_are_pulled_instead() {
    let tree = FolderTree::new().expect("tree");
    let current = blocks_of(&[1, 2, 3], block());
    let other = blocks_of(&[7, 8], block());
    let target = blocks_of(&[1, 8, 3, 7], block());
    tree.write("doc", &current).expect("write");
    tree.write("other", &other).expect("write");

    let mut index = MemoryBlockIndex::new();
    index.insert_file(FileKey::new("f", "other"), &version(&other));
    tree.write("other", &blocks_of(&[7, 9], block())).expect("rewrite");
    let job = job(
        Arc::new(folders(&tree)),
        index,
        LocalFetcher::from_bytes(&target, BLOCK),
    );

    let report = job.run(&request(&FileKey::new("f", "doc"), &current, &target));
    let UpdateOutcome::Committed(stats) = report.outcome else {
        panic!("unexpected outcome {:?}", report.outcome);
    };
    assert_eq!(stats.external, 1);
    assert_eq!(stats.pulled, 1);
    assert_eq!(tree.read("doc").expect("read"), target);
}

#[test]
fn unavailable_pulls_fall_back_without_touching_the_file() {
    let tree = FolderTree::new().expect("tree");
    let current = blocks_of(&[1, 2, 3, 4], block());
    let target = blocks_of(&[1, 2, 3, 9], block());
    tree.write("doc", &current).expect("write");
    let job = job(Arc::new(folders(&tree)), MemoryBlockIndex::new(), LocalFetcher::new());

    let report = job.run(&request(&FileKey::new("f", "doc"), &current, &target));
    let UpdateOutcome::Aborted(error) = report.outcome else {
        panic!("unexpected outcome {:?}", report.outcome);
    };
    assert_eq!(error.category(), ErrorCategory::Fallback);
    assert!(matches!(error, InPlaceError::PullUnresolved { ref blocks } if blocks == &[3]));
    assert_eq!(tree.read("doc").expect("read"), current);
}

#[test]
fn missing_current_file_is_routed_to_full_rewrite() {
    let tree = FolderTree::new().expect("tree");
    let job = job(Arc::new(folders(&tree)), MemoryBlockIndex::new(), LocalFetcher::new());
    let state = PullState::new(FileKey::new("f", "new"), None, version(&blocks_of(&[1], block())));
    let report = job.run(&UpdateRequest::new(Arc::new(state), CancelToken::new()));
    assert!(matches!(
        report.outcome,
        UpdateOutcome::NotEligible(IneligibleReason::NoCurrentFile)
    ));
}

#[test]
fn held_destination_lock_times_out() {
    let tree = FolderTree::new().expect("tree");
    let current = blocks_of(&[1, 2], block());
    let target = blocks_of(&[2, 1], block());
    tree.write("doc", &current).expect("write");
    let locks = LockTable::new();
    let job = UpdateJob::new(
        config().with_lock_timeout(Duration::from_millis(30)),
        Dependencies {
            index: Arc::new(MemoryBlockIndex::new()),
            fetcher: Arc::new(LocalFetcher::new()),
            opener: Arc::new(folders(&tree)),
            locks: Arc::clone(&locks),
            candidates: vec![FolderId::new("f")],
        },
    );

    let mut set = LockSet::new();
    set.shared(FileKey::new("f", "doc"));
    let reader = locks.acquire(&set, Duration::from_secs(1)).expect("reader");

    let report = job.run(&request(&FileKey::new("f", "doc"), &current, &target));
    let UpdateOutcome::Aborted(error) = report.outcome else {
        panic!("unexpected outcome {:?}", report.outcome);
    };
    assert!(matches!(error, InPlaceError::LockTimeout { .. }));
    assert_eq!(error.category(), ErrorCategory::Retry);
    assert_eq!(tree.read("doc").expect("read"), current);

    drop(reader);
    let report = job.run(&request(&FileKey::new("f", "doc"), &current, &target));
    assert!(report.outcome.is_committed());
    assert_eq!(tree.read("doc").expect("read"), target);
}

#[test]
fn files_copying_from_each_other_never_deadlock() {
    let tree = FolderTree::new().expect("tree");
    let a = blocks_of(&[1, 2, 3], block());
    let b = blocks_of(&[4, 5, 6], block());
    let a_target = blocks_of(&[1, 2, 5], block());
    let b_target = blocks_of(&[4, 5, 2], block());
    tree.write("a", &a).expect("write");
    tree.write("b", &b).expect("write");

    let mut index = MemoryBlockIndex::new();
    index.insert_file(FileKey::new("f", "a"), &version(&a));
    index.insert_file(FileKey::new("f", "b"), &version(&b));
    let pipeline = Pipeline::spawn(
        config().with_workers(2),
        Dependencies {
            index: Arc::new(index),
            fetcher: Arc::new(LocalFetcher::new()),
            opener: Arc::new(folders(&tree)),
            locks: LockTable::new(),
            candidates: vec![FolderId::new("f")],
        },
    )
    .expect("spawn");

    pipeline
        .submit(request(&FileKey::new("f", "a"), &a, &a_target))
        .expect("submit a");
    pipeline
        .submit(request(&FileKey::new("f", "b"), &b, &b_target))
        .expect("submit b");
    let reports = pipeline.shutdown();
    assert_eq!(reports.len(), 2);

    // Block 2 of `a` and block 1 of `b` are untouched by either patch, so
    // both updates find valid sources regardless of which commits first.
    for report in &reports {
        assert!(report.outcome.is_committed(), "{:?}", report.outcome);
    }
    assert_eq!(tree.read("a").expect("read"), a_target);
    assert_eq!(tree.read("b").expect("read"), b_target);
}

#[test]
fn cancelled_folder_leaves_files_alone() {
    let tree = FolderTree::new().expect("tree");
    let current = blocks_of(&[1, 2], block());
    tree.write("doc", &current).expect("write");
    let job = job(Arc::new(folders(&tree)), MemoryBlockIndex::new(), LocalFetcher::new());
    let request = request(&FileKey::new("f", "doc"), &current, &blocks_of(&[2, 1], block()));
    request.cancel.cancel();
    let report = job.run(&request);
    assert!(matches!(report.outcome, UpdateOutcome::Aborted(InPlaceError::PlanningAborted(_))));
    assert_eq!(tree.read("doc").expect("read"), current);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn admitted_updates_always_produce_the_target(
        current in prop::collection::vec(0u8..6, 1..10),
        target in prop::collection::vec(0u8..8, 1..10),
        tail in 0usize..8,
    ) {
        let tree = FolderTree::new().expect("tree");
        let current = blocks_of(&current, block());
        let mut target = blocks_of(&target, block());
        target.truncate(target.len() - tail);
        tree.write("doc", &current).expect("write");
        let job = job(
            Arc::new(folders(&tree)),
            MemoryBlockIndex::new(),
            LocalFetcher::from_bytes(&target, BLOCK),
        );

        let report = job.run(&request(&FileKey::new("f", "doc"), &current, &target));
        let on_disk = tree.read("doc").expect("read");
        match report.outcome {
            UpdateOutcome::Committed(_) => prop_assert_eq!(on_disk, target),
            UpdateOutcome::NotEligible(_) => prop_assert_eq!(on_disk, current),
            UpdateOutcome::Aborted(error) => prop_assert!(false, "aborted: {}", error),
        }
        prop_assert!(tree.list(".inplace").expect("list").is_empty());
    }
}
