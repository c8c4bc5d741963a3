//! Parallel batch processing over a fixed-size worker pool.
//!
//! A [`WorkPool`] maps every item of a batch through a per-item function,
//! keeping at most `job_count` items in flight. The pool only exists for the
//! duration of one [`WorkPool::run`] call: every worker it starts has been
//! joined by the time `run` returns, whether the batch succeeded or not.
//!
//! Results come back in completion order, not submission order. Callers that
//! care which output belongs to which input should look at
//! [`WorkOutput::id`].

use std::{future::Future, panic::AssertUnwindSafe};

use clap::ValueEnum;
use futures::FutureExt as _;
use indicatif::ProgressBar;
use tokio::task::JoinSet;

use crate::{async_utils::panic_message, errors::ItemError, prelude::*, ui::Ui};

/// One unit of batch work.
#[derive(Debug)]
pub struct WorkItem<T> {
    /// The unique ID of the work item. We use the input file name.
    pub id: String,

    /// The input data for the work item.
    pub data: T,
}

/// How did a successful work item get its output?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkStatus {
    /// We computed the output.
    Ok,

    /// We reused a valid artifact from an earlier run.
    Cached,
}

/// Output of a successful work item.
#[derive(Clone, Debug)]
pub struct WorkOutput<T> {
    /// The ID of the work item.
    pub id: String,

    /// How the output was produced.
    pub status: WorkStatus,

    /// Non-fatal problems, such as an optional artifact we couldn't write.
    pub warnings: Vec<String>,

    /// The output data for the work item.
    pub data: T,
}

impl<T> WorkOutput<T> {
    /// A freshly computed output.
    pub fn new(id: String, data: T) -> Self {
        Self {
            id,
            status: WorkStatus::Ok,
            warnings: vec![],
            data,
        }
    }

    /// An output loaded from an existing artifact.
    pub fn cached(id: String, data: T) -> Self {
        Self {
            status: WorkStatus::Cached,
            ..Self::new(id, data)
        }
    }
}

/// A work item that failed, when running with [`FailurePolicy::Skip`].
#[derive(Debug)]
pub struct ItemFailure {
    /// The ID of the work item.
    pub id: String,

    /// What went wrong.
    pub error: ItemError,
}

/// What should we do when an item fails?
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FailurePolicy {
    /// Stop submitting work, wait for running items, and fail the batch.
    #[default]
    Abort,

    /// Record the failure and keep going.
    Skip,
}

/// The results of a batch, in completion order.
#[derive(Debug)]
pub struct BatchResult<T> {
    /// Successful outputs.
    pub outputs: Vec<WorkOutput<T>>,

    /// Failed items. Always empty under [`FailurePolicy::Abort`].
    pub failures: Vec<ItemFailure>,
}

impl<T> BatchResult<T> {
    /// How many outputs were reused from earlier runs?
    pub fn cached_count(&self) -> usize {
        self.outputs
            .iter()
            .filter(|o| o.status == WorkStatus::Cached)
            .count()
    }

    /// How many non-fatal warnings did we collect?
    pub fn warning_count(&self) -> usize {
        self.outputs.iter().map(|o| o.warnings.len()).sum()
    }

    /// Display a summary of the batch to the user.
    pub fn report(&self, ui: &Ui) {
        let cached = self.cached_count();
        ui.display_message(
            "📊",
            &format!(
                "{} items processed ({} reused from earlier runs)",
                self.outputs.len(),
                cached,
            ),
        );
        let warning_count = self.warning_count();
        if warning_count > 0 {
            ui.display_message(
                "⚠️",
                &format!("{warning_count} non-fatal errors encountered"),
            );
        }
        if !self.failures.is_empty() {
            ui.display_message(
                "❌",
                &format!("{} items could not be processed:", self.failures.len()),
            );
            for failure in &self.failures {
                ui.display_message("  ", &format!("{}: {}", failure.id, failure.error));
            }
        }
    }
}

/// A fixed-size pool of workers, scoped to a single batch.
#[derive(Clone, Debug)]
pub struct WorkPool {
    /// Maximum number of items in flight at once.
    job_count: usize,

    /// What to do when an item fails.
    failure_policy: FailurePolicy,
}

impl WorkPool {
    /// Create a new pool description. No workers exist until [`Self::run`].
    pub fn new(job_count: usize, failure_policy: FailurePolicy) -> Self {
        Self {
            job_count: job_count.max(1),
            failure_policy,
        }
    }

    /// Map every item through `work_fn`, with at most `job_count` running at
    /// once, and advance `pb` as items complete.
    ///
    /// Items are submitted in the order given. Under [`FailurePolicy::Abort`],
    /// the first failure stops submission; items already running are allowed
    /// to finish (and write their artifacts), then the failure is returned.
    #[instrument(level = "debug", skip_all, fields(jobs = self.job_count))]
    pub async fn run<I, T, F, Fut>(
        &self,
        items: Vec<WorkItem<I>>,
        pb: &ProgressBar,
        work_fn: F,
    ) -> Result<BatchResult<T>>
    where
        F: Fn(WorkItem<I>) -> Fut,
        Fut: Future<Output = Result<WorkOutput<T>, ItemError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut pending = items.into_iter();
        let mut in_flight = JoinSet::new();
        let mut outputs = vec![];
        let mut failures = vec![];
        let mut first_failure: Option<ItemFailure> = None;

        loop {
            // Keep the pool full, unless we're shutting down.
            while first_failure.is_none() && in_flight.len() < self.job_count {
                let Some(item) = pending.next() else {
                    break;
                };
                let id = item.id.clone();
                trace!(item = %id, "Submitting item");
                let work = work_fn(item);
                in_flight.spawn(async move {
                    let result = AssertUnwindSafe(work).catch_unwind().await.unwrap_or_else(
                        |payload| Err(ItemError::WorkerPanic(panic_message(payload.as_ref()))),
                    );
                    (id, result)
                });
            }

            // Wait for the next worker to finish. `None` means the pool is
            // empty and there is nothing left to submit.
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(err) => (
                    "<unknown>".to_owned(),
                    Err(ItemError::WorkerPanic(err.to_string())),
                ),
            };
            pb.inc(1);

            match result {
                Ok(output) => {
                    for warning in &output.warnings {
                        warn!(item = %id, "{}", warning);
                    }
                    outputs.push(output);
                }
                Err(error) => match self.failure_policy {
                    FailurePolicy::Skip => {
                        warn!(item = %id, "Skipping failed item: {}", error);
                        failures.push(ItemFailure { id, error });
                    }
                    FailurePolicy::Abort if first_failure.is_none() => {
                        error!(item = %id, "Item failed, aborting batch: {}", error);
                        first_failure = Some(ItemFailure { id, error });
                    }
                    FailurePolicy::Abort => {
                        error!(item = %id, "Item failed while aborting: {}", error);
                    }
                },
            }
        }

        if let Some(ItemFailure { id, error }) = first_failure {
            let skipped = pending.len();
            return Err(anyhow::Error::new(error)).with_context(|| {
                format!("batch aborted because {id} failed ({skipped} items not started)")
            });
        }
        Ok(BatchResult { outputs, failures })
    }
}
