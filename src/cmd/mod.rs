//! Command-line entry points.

use clap::Args;

use crate::{
    prelude::*,
    queues::work::{BatchResult, FailurePolicy, WorkPool},
    ui::Ui,
};

pub mod extract;
pub mod ocr;
pub mod schema;

/// Common options for subcommands that process a directory of files.
#[derive(Debug, Clone, Args)]
pub struct BatchOpts {
    /// Max number of files to process at a time. Defaults to the number of
    /// CPUs.
    #[clap(short = 'j', long = "jobs")]
    pub job_count: Option<usize>,

    /// What to do when a file can't be processed.
    #[clap(long = "on-error", value_enum, default_value_t = FailurePolicy::Abort)]
    pub failure_policy: FailurePolicy,

    /// Reuse valid output files from an earlier run instead of recomputing
    /// them.
    #[clap(long)]
    pub skip_existing: bool,

    /// Limit processing to the first N files, in name order.
    #[clap(long)]
    pub take_first: Option<usize>,
}

impl BatchOpts {
    /// Build the worker pool for this batch.
    pub fn work_pool(&self) -> WorkPool {
        let job_count = self.job_count.unwrap_or_else(num_cpus::get);
        WorkPool::new(job_count, self.failure_policy)
    }

    /// Apply `--take-first` to our list of inputs.
    pub fn take(&self, mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
        if let Some(take_first) = self.take_first {
            paths.truncate(take_first);
        }
        paths
    }

    /// Warn if `--skip-existing` can't do anything.
    pub fn check_skip_existing(&self, output_dir: Option<&Path>, flag: &str) {
        if self.skip_existing && output_dir.is_none() {
            warn!("--skip-existing has no effect without {flag}");
        }
    }
}

/// Report on a finished batch.
pub fn finish_batch<T>(ui: &Ui, result: &BatchResult<T>) {
    result.report(ui);
    info!(
        processed = result.outputs.len(),
        cached = result.cached_count(),
        failed = result.failures.len(),
        "Batch finished"
    );
}
