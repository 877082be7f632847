//! Review gate
//!
//! Without review settings (or without a provider) a passing candidate is
//! activated on the spot. With them, each attempt's candidate is committed to
//! a job branch, success opens a change request, and activation waits for the
//! request to be merged (or `resolve` to be called). A job that runs out of
//! attempts gets a `[FAIL]` request for inspection; it is never merged. The repository is the
//! source of truth: `resync` pulls merged/closed decisions and any edits made
//! directly on the primary branch back into the config.

use crate::error::{ReviewError, VcsError};
use crate::schema::CompiledSchema;
use crate::store::RunStore;
use crate::types::{
    Activation, ChangeRequest, ConfigId, JobId, JobStatus, OutputSchema, ProcessingJob, Program,
    RepoRef, ReviewSettings, ServiceConfig,
};
use crate::vcs::{ChangeRequestStatus, CommitRef, VersionControl};
use at_model::{retry_transport, BackoffConfig};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub const SCHEMA_FILE: &str = "output_schema.json";
pub const PROGRAM_FILE: &str = "service.py";

/// Commits made for one attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptCommits {
    pub program: Option<CommitRef>,
    pub schema: Option<CommitRef>,
}

/// Activation policy and version-control workflow
#[derive(Clone)]
pub struct ReviewGate {
    store: Arc<dyn RunStore>,
    vcs: Option<Arc<dyn VersionControl>>,
    backoff: BackoffConfig,
    base_url: Option<String>,
}

impl ReviewGate {
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, vcs: Option<Arc<dyn VersionControl>>) -> Self {
        Self {
            store,
            vcs,
            backoff: BackoffConfig::default(),
            base_url: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    /// Review settings and provider, when both exist
    fn enabled<'a>(
        &'a self,
        config: &'a ServiceConfig,
    ) -> Option<(&'a ReviewSettings, &'a Arc<dyn VersionControl>)> {
        Some((config.review.as_ref()?, self.vcs.as_ref()?))
    }

    #[must_use]
    pub fn is_enabled(&self, config: &ServiceConfig) -> bool {
        self.enabled(config).is_some()
    }

    #[must_use]
    pub fn job_branch(config: &ServiceConfig, job_id: JobId) -> String {
        format!("{}-{}", config.name, job_id)
    }

    #[must_use]
    pub fn schema_path(config: &ServiceConfig) -> String {
        format!("{}/{}", config.repo_folder(), SCHEMA_FILE)
    }

    #[must_use]
    pub fn program_path(config: &ServiceConfig) -> String {
        format!("{}/{}", config.repo_folder(), PROGRAM_FILE)
    }

    async fn vcs_call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, VcsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VcsError>>,
    {
        retry_transport(&self.backoff, operation, VcsError::is_retryable, op).await
    }

    async fn commit(
        &self,
        vcs: &Arc<dyn VersionControl>,
        repo: &RepoRef,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<CommitRef, VcsError> {
        self.vcs_call("commit file", || {
            vcs.commit_file(repo, branch, path, content, message)
        })
        .await
    }

    /// Create the job branch before the first attempt
    #[tracing::instrument(skip(self, config), fields(config_id = %config.id), err)]
    pub async fn begin_job(&self, config: &ServiceConfig, job_id: JobId) -> Result<(), ReviewError> {
        let Some((review, vcs)) = self.enabled(config) else {
            return Ok(());
        };
        let branch = Self::job_branch(config, job_id);
        self.vcs_call("create branch", || {
            vcs.create_branch(&review.repository, &branch, &review.primary_branch)
        })
        .await?;
        tracing::info!("created review branch {}", branch);
        Ok(())
    }

    /// Commit an attempt's candidate (and revised schema) to the job branch
    pub async fn commit_attempt(
        &self,
        config: &ServiceConfig,
        job_id: JobId,
        index: u32,
        code: &str,
        revised_schema: Option<&Value>,
    ) -> Result<AttemptCommits, ReviewError> {
        let Some((review, vcs)) = self.enabled(config) else {
            return Ok(AttemptCommits::default());
        };
        let branch = Self::job_branch(config, job_id);
        let mut commits = AttemptCommits::default();
        if let Some(schema) = revised_schema {
            let body = serde_json::to_string_pretty(schema)?;
            let message = format!("AutoTransform {} job={} attempt {}: revise schema", config.name, job_id, index);
            commits.schema = Some(
                self.commit(vcs, &review.repository, &branch, &Self::schema_path(config), &body, &message)
                    .await?,
            );
        }
        let message = format!("AutoTransform {} job={} attempt {}", config.name, job_id, index);
        commits.program = Some(
            self.commit(vcs, &review.repository, &branch, &Self::program_path(config), code, &message)
                .await?,
        );
        Ok(commits)
    }

    /// Settle a passing job: activate now, or open a change request
    #[tracing::instrument(skip(self, config, job, activation), fields(config_id = %config.id, job_id = %job.id), err)]
    pub async fn conclude(
        &self,
        config: &ServiceConfig,
        mut job: ProcessingJob,
        activation: Activation,
    ) -> Result<ProcessingJob, ReviewError> {
        let Some((review, vcs)) = self.enabled(config) else {
            self.store.activate(config.id, &activation).await?;
            job.status = JobStatus::Completed;
            return Ok(self.store.update_job(job).await?);
        };

        let branch = Self::job_branch(config, job.id);
        let title = format!("AutoTransform [PASS] {} job={}", config.name, job.id);
        let body = self.change_request_body(config, job.id, true);
        let request = self
            .vcs_call("open change request", || {
                vcs.open_change_request(&review.repository, &branch, &review.primary_branch, &title, &body)
            })
            .await?;
        tracing::info!("opened change request #{} ({})", request.number, request.url);
        job.change_request = Some(request.clone());

        if review.auto_merge {
            self.vcs_call("merge change request", || {
                vcs.merge_change_request(&review.repository, request.number)
            })
            .await?;
            self.store.activate(config.id, &activation).await?;
            job.status = JobStatus::Completed;
        } else {
            job.pending = Some(activation);
            job.status = JobStatus::AwaitingReview;
        }
        Ok(self.store.update_job(job).await?)
    }

    /// Open a `[FAIL]` change request for a job that exhausted its attempts
    ///
    /// Best effort: `None` when review is off or the host refuses.
    pub async fn report_failure(&self, config: &ServiceConfig, job_id: JobId) -> Option<ChangeRequest> {
        let (review, vcs) = self.enabled(config)?;
        let branch = Self::job_branch(config, job_id);
        let title = format!("AutoTransform [FAIL] {} job={}", config.name, job_id);
        let body = self.change_request_body(config, job_id, false);
        match self
            .vcs_call("open change request", || {
                vcs.open_change_request(&review.repository, &branch, &review.primary_branch, &title, &body)
            })
            .await
        {
            Ok(request) => {
                tracing::info!("opened failure change request #{} ({})", request.number, request.url);
                Some(request)
            }
            Err(e) => {
                tracing::warn!("could not open failure change request for job {}: {}", job_id, e);
                None
            }
        }
    }

    fn change_request_body(&self, config: &ServiceConfig, job_id: JobId, passed: bool) -> String {
        let mut body = if passed {
            format!(
                "Candidate program for `{}` passed validation on every record of job `{}`.",
                config.name, job_id
            )
        } else {
            format!(
                "Job `{}` for `{}` used every attempt without a passing program. Do not merge.",
                job_id, config.name
            )
        };
        if let Some(base) = &self.base_url {
            body.push_str(&format!(
                "\n\nDetails: {}/configs/{}/jobs/{}",
                base.trim_end_matches('/'),
                config.id,
                job_id
            ));
        }
        body
    }

    /// Apply an out-of-band review decision
    #[tracing::instrument(skip(self), err)]
    pub async fn resolve(&self, job_id: JobId, approved: bool) -> Result<ProcessingJob, ReviewError> {
        let mut job = self.store.get_job(job_id).await?;
        if job.status != JobStatus::AwaitingReview {
            return Err(ReviewError::NotAwaitingReview(job_id));
        }
        if approved {
            let pending = job.pending.take().ok_or(ReviewError::NoPending(job_id))?;
            self.store.activate(job.config_id, &pending).await?;
            job.status = JobStatus::Completed;
        } else {
            job.pending = None;
            job.status = JobStatus::Failed;
        }
        let job = self.store.update_job(job).await?;
        metrics::counter!("autotransform_jobs_total", "status" => job.status.as_str()).increment(1);
        tracing::info!("review resolved for job {}: {}", job_id, job.status);
        Ok(job)
    }

    /// Pull review decisions and primary-branch edits into the config
    #[tracing::instrument(skip(self), err)]
    pub async fn resync(&self, config_id: ConfigId) -> Result<ServiceConfig, ReviewError> {
        let config = self.store.get_config(config_id).await?;
        let Some((review, vcs)) = self.enabled(&config) else {
            return Ok(config);
        };

        if let Some(job) = self.store.latest_job(config_id).await? {
            if job.status == JobStatus::AwaitingReview {
                if let Some(request) = &job.change_request {
                    let status = self
                        .vcs_call("read change request", || {
                            vcs.change_request_status(&review.repository, request.number)
                        })
                        .await?;
                    match status {
                        ChangeRequestStatus::Merged => {
                            self.resolve(job.id, true).await?;
                        }
                        ChangeRequestStatus::Closed => {
                            self.resolve(job.id, false).await?;
                        }
                        ChangeRequestStatus::Open => {}
                    }
                }
            }
        }

        let config = self.store.get_config(config_id).await?;
        let schema_path = Self::schema_path(&config);
        let program_path = Self::program_path(&config);
        let remote_schema = self
            .vcs_call("read schema", || {
                vcs.read_file(&review.repository, &review.primary_branch, &schema_path)
            })
            .await?;
        let remote_program = self
            .vcs_call("read program", || {
                vcs.read_file(&review.repository, &review.primary_branch, &program_path)
            })
            .await?;

        let schema = remote_schema.and_then(|text| match serde_json::from_str::<Value>(&text) {
            Ok(schema) if schema == config.output_schema.schema => None,
            Ok(schema) => match CompiledSchema::compile(&schema) {
                Ok(_) => Some(schema),
                Err(e) => {
                    tracing::warn!("keeping current schema; remote one does not compile: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("ignoring unparseable remote schema: {}", e);
                None
            }
        });
        let current = config.active_program.as_ref().map(|p| p.code.as_str());
        let program = remote_program.filter(|code| current != Some(code.as_str()));
        if schema.is_none() && program.is_none() {
            return Ok(config);
        }

        let branch = review.primary_branch.clone();
        let updated = self
            .store
            .modify_config(
                config_id,
                Box::new(move |config| {
                    if let Some(schema) = schema {
                        tracing::info!("adopting output schema from {}", branch);
                        config.output_schema = OutputSchema::new(schema);
                    }
                    if let Some(code) = program {
                        tracing::info!("adopting program from {}", branch);
                        config.active_program = Some(Program::new(code));
                    }
                    config.updated_at = chrono::Utc::now();
                }),
            )
            .await?;
        Ok(updated)
    }

    /// Commit the config's schema and program to the primary branch
    #[tracing::instrument(skip(self, config), fields(config_id = %config.id), err)]
    pub async fn publish_config(&self, config: &mut ServiceConfig) -> Result<(), ReviewError> {
        let (review, vcs) = match self.enabled(config) {
            Some((review, vcs)) => (review.clone(), Arc::clone(vcs)),
            None => return Err(ReviewError::NotConfigured(config.id)),
        };
        let body = serde_json::to_string_pretty(&config.output_schema.schema)?;
        let message = format!("AutoTransform {}: update output schema", config.name);
        let commit = self
            .commit(
                &vcs,
                &review.repository,
                &review.primary_branch,
                &Self::schema_path(config),
                &body,
                &message,
            )
            .await?;
        config.output_schema.commit = Some(commit.url);

        let message = format!("AutoTransform {}: update program", config.name);
        let path = Self::program_path(config);
        if let Some(program) = config.active_program.as_mut() {
            let commit = self
                .commit(&vcs, &review.repository, &review.primary_branch, &path, &program.code, &message)
                .await?;
            program.commit = Some(commit.url);
        }
        Ok(())
    }
}
