use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blocks::FileVersion;
use inplace::{
    CancelToken, DeltaPlan, Dependencies, FileKey, FileOpener, FolderId, Folders, InPlaceConfig,
    InPlaceError, LocalFetcher, LockTable, MemoryBlockIndex, Planner, PullState, RecoveryOutcome,
    UpdateJob, UpdateOutcome, UpdateRequest, admission, recover_folder,
};

use crate::command::{Action, Invocation, UpdateArgs};
use crate::error::CliError;
use crate::{EXIT_ABORTED, EXIT_NOT_ELIGIBLE, EXIT_OK, FOLDER_ID};

pub(crate) fn execute<Out: Write>(
    invocation: &Invocation,
    stdout: &mut Out,
) -> Result<i32, CliError> {
    match &invocation.action {
        Action::Plan(args) => plan(args, &invocation.config, stdout),
        Action::Apply(args) => apply(args, &invocation.config, stdout),
        Action::Recover { root } => recover(root, &invocation.config, stdout),
    }
}

/// Everything hashed and indexed for one update.
struct Prepared {
    folders: Folders,
    state: PullState,
    index: MemoryBlockIndex,
    target: Vec<u8>,
}

fn prepare(args: &UpdateArgs, config: &InPlaceConfig) -> Result<Prepared, CliError> {
    let folders = Folders::new(config.scratch_dir_name.clone()).with_folder(FOLDER_ID, &args.root);
    let key = FileKey::new(FOLDER_ID, args.file.as_str());
    let dest = resolve(&folders, &key)?;
    let current = if dest.exists() {
        Some(hash_path(&dest, config.block_size)?)
    } else {
        None
    };

    let target = fs::read(&args.target).map_err(|source| CliError::Io {
        path: args.target.clone(),
        source,
    })?;
    let target_version =
        FileVersion::from_bytes(&target, config.block_size).map_err(|source| CliError::Hash {
            path: args.target.clone(),
            source,
        })?;

    let mut index = MemoryBlockIndex::new();
    for relative in &args.also {
        let other = FileKey::new(FOLDER_ID, relative.as_str());
        let path = resolve(&folders, &other)?;
        let version = hash_path(&path, config.block_size)?;
        index.insert_file(other, &version);
    }

    Ok(Prepared {
        folders,
        state: PullState::new(key, current, target_version),
        index,
        target,
    })
}

fn plan<Out: Write>(
    args: &UpdateArgs,
    config: &InPlaceConfig,
    stdout: &mut Out,
) -> Result<i32, CliError> {
    let prepared = prepare(args, config)?;
    let state = &prepared.state;
    state.count_local_matches();
    let admission = admission::evaluate(state);

    let candidates = [FolderId::new(FOLDER_ID)];
    let cancel = CancelToken::new();
    let planned = Planner::new(&prepared.index, &candidates, &cancel)
        .with_max_scratch_bytes(config.max_scratch_bytes)
        .plan(state);

    let out = |result: std::io::Result<()>| {
        result.map_err(|source| CliError::Io {
            path: PathBuf::from("<stdout>"),
            source,
        })
    };
    out(writeln!(stdout, "file        {}", state.key()))?;
    match &admission {
        Ok(estimate) => out(writeln!(
            stdout,
            "admission   cost {} of {}: accepted",
            estimate.estimated_cost, estimate.budget
        ))?,
        Err(reason) => out(writeln!(stdout, "admission   rejected: {reason}"))?,
    }

    match planned {
        Ok(plan) => {
            out(render_plan(&plan, stdout))?;
            Ok(if admission.is_ok() { EXIT_OK } else { EXIT_NOT_ELIGIBLE })
        }
        Err(InPlaceError::NotEligible(reason)) => {
            out(writeln!(stdout, "plan        not eligible: {reason}"))?;
            Ok(EXIT_NOT_ELIGIBLE)
        }
        Err(error) => {
            out(writeln!(stdout, "plan        aborted: {error}"))?;
            Ok(EXIT_ABORTED)
        }
    }
}

fn render_plan<Out: Write>(plan: &DeltaPlan, stdout: &mut Out) -> std::io::Result<()> {
    let identity = plan.copies().iter().filter(|copy| copy.is_identity()).count();
    writeln!(
        stdout,
        "blocks      {} current, {} target (block size {})",
        plan.current().block_count(),
        plan.target().block_count(),
        plan.block_size()
    )?;
    writeln!(
        stdout,
        "copies      {} ({} identity, {} from scratch)",
        plan.copies().len(),
        identity,
        plan.scratch_reads()
    )?;
    writeln!(stdout, "external    {}", plan.external().len())?;
    writeln!(stdout, "pulls       {}", plan.pulls().len())?;
    writeln!(stdout, "staged      {} bytes", plan.staged_bytes())?;

    for copy in plan.copies().iter().filter(|copy| !copy.is_identity()) {
        let origin = if copy.from_scratch { " (scratch)" } else { "" };
        writeln!(stdout, "  copy      {} -> {}{}", copy.source, copy.dest, origin)?;
    }
    for copy in plan.external() {
        writeln!(
            stdout,
            "  external  {}#{} -> {}",
            copy.source_file, copy.source, copy.dest
        )?;
    }
    for pull in plan.pulls() {
        writeln!(stdout, "  pull      {:?} -> {}", pull.digest, pull.dest)?;
    }
    Ok(())
}

fn apply<Out: Write>(
    args: &UpdateArgs,
    config: &InPlaceConfig,
    stdout: &mut Out,
) -> Result<i32, CliError> {
    let prepared = prepare(args, config)?;
    let key = prepared.state.key().clone();
    let job = UpdateJob::new(
        config.clone(),
        Dependencies {
            index: Arc::new(prepared.index),
            fetcher: Arc::new(LocalFetcher::from_bytes(&prepared.target, config.block_size)),
            opener: Arc::new(prepared.folders),
            locks: LockTable::new(),
            candidates: vec![FolderId::new(FOLDER_ID)],
        },
    );
    let report = job.run(&UpdateRequest::new(Arc::new(prepared.state), CancelToken::new()));

    let (line, code) = match &report.outcome {
        UpdateOutcome::Committed(stats) => (
            format!(
                "{key}: committed ({} moved, {} external, {} pulled, {} bytes written)",
                stats.local, stats.external, stats.pulled, stats.bytes_written
            ),
            EXIT_OK,
        ),
        UpdateOutcome::NotEligible(reason) => (
            format!("{key}: not eligible: {reason}"),
            EXIT_NOT_ELIGIBLE,
        ),
        UpdateOutcome::Aborted(error) => (
            format!("{key}: aborted ({:?}): {error}", error.category()),
            EXIT_ABORTED,
        ),
    };
    writeln!(stdout, "{line}").map_err(|source| CliError::Io {
        path: PathBuf::from("<stdout>"),
        source,
    })?;
    Ok(code)
}

fn recover<Out: Write>(
    root: &Path,
    config: &InPlaceConfig,
    stdout: &mut Out,
) -> Result<i32, CliError> {
    let folders = Folders::new(config.scratch_dir_name.clone()).with_folder(FOLDER_ID, root);
    let outcomes = recover_folder(&folders, &FolderId::new(FOLDER_ID), config.fsync)?;
    let io_error = |source| CliError::Io {
        path: PathBuf::from("<stdout>"),
        source,
    };
    if outcomes.is_empty() {
        writeln!(stdout, "nothing to recover").map_err(io_error)?;
    }
    for outcome in outcomes {
        let line = match outcome {
            RecoveryOutcome::Clean => continue,
            RecoveryOutcome::RolledBack { key } => format!("{key}: restored original content"),
            RecoveryOutcome::AlreadyCommitted { key } => format!("{key}: patch was complete"),
            RecoveryOutcome::DiscardedOrphan { path } => {
                format!("removed orphan {}", path.display())
            }
        };
        writeln!(stdout, "{line}").map_err(io_error)?;
    }
    Ok(EXIT_OK)
}

fn resolve(folders: &Folders, key: &FileKey) -> Result<PathBuf, CliError> {
    folders.path_of(key).map_err(|source| CliError::Io {
        path: key.path().to_path_buf(),
        source,
    })
}

fn hash_path(path: &Path, block_size: u32) -> Result<FileVersion, CliError> {
    FileVersion::from_path(path, block_size).map_err(|source| CliError::Hash {
        path: path.to_path_buf(),
        source,
    })
}
