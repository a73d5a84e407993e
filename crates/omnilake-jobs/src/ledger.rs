//! Job ledger execution wrapper.
//!
//! Every unit of engine work runs under a ledger job. [`JobLedger::execute`]
//! moves the job to IN_PROGRESS, runs the work, and records the outcome:
//! success completes the job, an error fails it and propagates the failure
//! to ancestors as configured.

use std::future::Future;
use std::sync::Arc;

use omnilake_core::{FailurePropagation, JobKey, JobRepository, Result};
use tracing::{debug, warn};

/// How [`JobLedger::execute`] records the job around the work.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Leave the job status alone before running (it is already IN_PROGRESS).
    pub skip_initialization: bool,
    /// Leave the job IN_PROGRESS on success; a later event completes it.
    pub skip_completion: bool,
    /// Message recorded on failure instead of the error text.
    pub failure_status_message: Option<String>,
    pub propagation: FailurePropagation,
}

impl ExecutionOptions {
    pub fn with_propagation(mut self, propagation: FailurePropagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn skipping_completion(mut self) -> Self {
        self.skip_completion = true;
        self
    }

    pub fn skipping_initialization(mut self) -> Self {
        self.skip_initialization = true;
        self
    }

    pub fn with_failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_status_message = Some(message.into());
        self
    }
}

/// Runs work under a ledger job.
#[derive(Clone)]
pub struct JobLedger {
    jobs: Arc<dyn JobRepository>,
}

impl JobLedger {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }

    /// Run `work` under the job `key`, recording its outcome.
    ///
    /// The work's error is returned unchanged after the job is failed.
    pub async fn execute<T, F>(&self, key: JobKey, options: ExecutionOptions, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !options.skip_initialization && !self.jobs.mark_in_progress(key).await? {
            debug!(job = %key, "Job was not pending when execution began");
        }

        match work.await {
            Ok(value) => {
                if !options.skip_completion {
                    self.jobs.complete(key, None).await?;
                }
                Ok(value)
            }
            Err(e) => {
                let message = options
                    .failure_status_message
                    .clone()
                    .unwrap_or_else(|| e.to_string());
                warn!(job = %key, error = %message, "Job failed");
                self.jobs.fail(key, &message, options.propagation).await?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnilake_core::{Error, Job, JobStatus, JobType};
    use omnilake_db::memory;

    #[tokio::test]
    async fn test_success_completes_job() {
        let repos = memory::repositories();
        let job = Job::new(JobType::LakeRequest);
        repos.jobs.create(&job).await.unwrap();
        let ledger = JobLedger::new(repos.jobs.clone());

        let value = ledger
            .execute(job.key(), ExecutionOptions::default(), async { Ok(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        let stored = repos.jobs.require(job.key()).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.started.is_some());
        assert!(stored.ended.is_some());
    }

    #[tokio::test]
    async fn test_skip_completion_leaves_job_running() {
        let repos = memory::repositories();
        let job = Job::new(JobType::LakeProcessorChain);
        repos.jobs.create(&job).await.unwrap();
        let ledger = JobLedger::new(repos.jobs.clone());

        ledger
            .execute(job.key(), ExecutionOptions::default().skipping_completion(), async {
                Ok(())
            })
            .await
            .unwrap();

        let stored = repos.jobs.require(job.key()).await.unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_failure_propagates_to_ancestors() {
        let repos = memory::repositories();
        let root = Job::new(JobType::LakeChainRequest);
        repos.jobs.create(&root).await.unwrap();
        let request = repos
            .jobs
            .create_child(root.key(), JobType::LakeRequest)
            .await
            .unwrap();
        let processor = repos
            .jobs
            .create_child(request.key(), JobType::LakeProcessorSummarizer)
            .await
            .unwrap();
        let ledger = JobLedger::new(repos.jobs.clone());

        let result: Result<()> = ledger
            .execute(
                processor.key(),
                ExecutionOptions::default().with_failure_message("model unavailable"),
                async { Err(Error::Inference("connection refused".into())) },
            )
            .await;

        assert!(matches!(result, Err(Error::Inference(_))));
        let failed = repos.jobs.require(processor.key()).await.unwrap();
        assert_eq!(failed.status_message.as_deref(), Some("model unavailable"));
        let parent = repos.jobs.require(request.key()).await.unwrap();
        assert_eq!(parent.status, JobStatus::Failed);
        assert_eq!(
            parent.status_message,
            Some(format!("{} failed: model unavailable", processor.key()))
        );
        let top = repos.jobs.require(root.key()).await.unwrap();
        assert_eq!(top.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_suppressed_failure_stays_local() {
        let repos = memory::repositories();
        let request = Job::new(JobType::LakeRequest);
        repos.jobs.create(&request).await.unwrap();
        let lookup = repos
            .jobs
            .create_child(request.key(), JobType::LakeLookup)
            .await
            .unwrap();
        let ledger = JobLedger::new(repos.jobs.clone());

        let _ = ledger
            .execute::<(), _>(
                lookup.key(),
                ExecutionOptions::default().with_propagation(FailurePropagation::Suppressed),
                async { Err(Error::Lookup("archive missing".into())) },
            )
            .await;

        let lookup = repos.jobs.require(lookup.key()).await.unwrap();
        assert_eq!(lookup.status, JobStatus::Failed);
        let parent = repos.jobs.require(request.key()).await.unwrap();
        assert_eq!(parent.status, JobStatus::Pending);
    }
}
