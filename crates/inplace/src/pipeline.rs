//! Worker pool that drives updates from admission to commit.
//!
//! Requests enter a bounded queue; each worker takes one, runs it end to end
//! and publishes an [`UpdateReport`]. Workers share the lock table, so
//! updates that touch disjoint files run concurrently while updates that
//! share a file serialize on its lock.
//!
//! ```text
//! submit ──▶ [bounded queue] ──▶ worker 0 ─┐
//!                            └─▶ worker 1 ─┴──▶ reports
//! ```

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::admission;
use crate::apply::{ApplyPhase, ApplyStats, apply_plan, stale_external_copies};
use crate::cancel::CancelToken;
use crate::config::InPlaceConfig;
use crate::error::{IneligibleReason, InPlaceError, PlanningAbortCause};
use crate::fetch::{BlockFetcher, fetch_all};
use crate::index::BlockIndex;
use crate::key::{FileKey, FolderId};
use crate::lock::LockTable;
use crate::plan::Planner;
use crate::state::PullState;
use crate::storage::FileOpener;
use crate::trace;

/// One file to update.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Current and target versions of the file.
    pub state: Arc<PullState>,
    /// Cancellation shared with the owning folder.
    pub cancel: CancelToken,
}

impl UpdateRequest {
    /// Creates a request for `state`.
    #[must_use]
    pub fn new(state: Arc<PullState>, cancel: CancelToken) -> Self {
        Self { state, cancel }
    }
}

/// Result of one update.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The destination now holds the target.
    Committed(ApplyStats),
    /// The file must be rewritten in full instead.
    NotEligible(IneligibleReason),
    /// The update stopped; see [`InPlaceError::category`] for what to do.
    Aborted(InPlaceError),
}

impl UpdateOutcome {
    /// Short name of the outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Committed(_) => "committed",
            Self::NotEligible(_) => "not-eligible",
            Self::Aborted(_) => "aborted",
        }
    }

    /// Reports whether the update committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Outcome of one request, tagged with its file.
#[derive(Debug)]
pub struct UpdateReport {
    /// File the request was for.
    pub key: FileKey,
    /// What happened.
    pub outcome: UpdateOutcome,
}

/// Collaborators every update needs.
#[derive(Clone)]
pub struct Dependencies {
    /// Index of blocks held by other local files.
    pub index: Arc<dyn BlockIndex>,
    /// Source of blocks held by peers.
    pub fetcher: Arc<dyn BlockFetcher>,
    /// File access.
    pub opener: Arc<dyn FileOpener>,
    /// Lock table shared by all workers.
    pub locks: Arc<LockTable>,
    /// Folders the planner may take external copies from.
    pub candidates: Vec<FolderId>,
}

/// Runs single updates synchronously.
#[derive(Clone)]
pub struct UpdateJob {
    config: InPlaceConfig,
    deps: Dependencies,
}

impl UpdateJob {
    /// Creates a job runner.
    #[must_use]
    pub fn new(config: InPlaceConfig, deps: Dependencies) -> Self {
        Self { config, deps }
    }

    /// Runs `request` to completion on the calling thread.
    pub fn run(&self, request: &UpdateRequest) -> UpdateReport {
        let key = request.state.key().clone();
        let outcome = match self.execute(request) {
            Ok(stats) => UpdateOutcome::Committed(stats),
            Err(InPlaceError::NotEligible(reason)) => UpdateOutcome::NotEligible(reason),
            Err(error) => UpdateOutcome::Aborted(error),
        };
        let report = UpdateReport { key, outcome };
        trace::report(&report);
        report
    }

    fn execute(&self, request: &UpdateRequest) -> Result<ApplyStats, InPlaceError> {
        let state = &request.state;
        let cancel = &request.cancel;
        cancel.check()?;

        state.count_local_matches();
        admission::evaluate(state)?;

        let mut plan = Planner::new(self.deps.index.as_ref(), &self.deps.candidates, cancel)
            .with_max_scratch_bytes(self.config.max_scratch_bytes)
            .plan(state)?;
        trace::phase(plan.key(), ApplyPhase::Planned);
        let guard = self
            .deps
            .locks
            .acquire(&plan.lock_set(), self.config.lock_timeout)?;

        // Sources may have changed since they were indexed.
        let stale = stale_external_copies(&plan, self.deps.opener.as_ref());
        if !stale.is_empty() {
            trace::external_demoted(plan.key(), &stale);
            plan.demote_to_pulls(&stale);
        }
        let pulled = fetch_all(self.deps.fetcher.as_ref(), &plan, self.config.pull_timeout)?;
        if cancel.is_cancelled() {
            return Err(PlanningAbortCause::Cancelled.into());
        }

        let stats = apply_plan(&plan, &guard, &pulled, self.deps.opener.as_ref(), &self.config)?;
        drop(guard);
        state.set_current(Some(plan.target().clone()));
        Ok(stats)
    }
}

/// Bounded queue of update requests served by a fixed set of workers.
pub struct Pipeline {
    requests: Option<Sender<UpdateRequest>>,
    reports: Receiver<UpdateReport>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Starts `config.workers` worker threads.
    pub fn spawn(config: InPlaceConfig, deps: Dependencies) -> io::Result<Self> {
        let (request_tx, request_rx) =
            crossbeam_channel::bounded::<UpdateRequest>(config.queue_capacity.max(1));
        let (report_tx, report_rx) = crossbeam_channel::unbounded();
        let job = UpdateJob::new(config.clone(), deps);

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for worker in 0..config.workers.max(1) {
            let requests = request_rx.clone();
            let reports = report_tx.clone();
            let job = job.clone();
            let handle = thread::Builder::new()
                .name(format!("inplace-worker-{worker}"))
                .spawn(move || {
                    trace::worker_started(worker);
                    for request in requests {
                        // Reports are dropped once the pipeline owner is gone.
                        let _ = reports.send(job.run(&request));
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            requests: Some(request_tx),
            reports: report_rx,
            workers,
        })
    }

    /// Queues `request`, blocking while the queue is full.
    ///
    /// Returns the request when the pipeline no longer accepts work.
    pub fn submit(&self, request: UpdateRequest) -> Result<(), UpdateRequest> {
        match &self.requests {
            Some(sender) => sender.send(request).map_err(|error| error.into_inner()),
            None => Err(request),
        }
    }

    /// Queues `request` if there is room.
    pub fn try_submit(&self, request: UpdateRequest) -> Result<(), UpdateRequest> {
        match &self.requests {
            Some(sender) => sender.try_send(request).map_err(|error| match error {
                TrySendError::Full(request) | TrySendError::Disconnected(request) => request,
            }),
            None => Err(request),
        }
    }

    /// Returns the stream of finished updates.
    #[must_use]
    pub const fn reports(&self) -> &Receiver<UpdateReport> {
        &self.reports
    }

    /// Stops accepting requests, waits for queued work to finish and returns
    /// every report not yet received.
    pub fn shutdown(mut self) -> Vec<UpdateReport> {
        self.close();
        self.reports.try_iter().collect()
    }

    fn close(&mut self) {
        self.requests.take();
        for handle in self.workers.drain(..) {
            // A panicking worker has already lost its request; the rest of
            // the queue is served by the others.
            let _ = handle.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}
