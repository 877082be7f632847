//! Attempt controller
//!
//! Drives one job through synthesize → execute → validate → persist cycles
//! until a candidate passes every record, the attempt budget runs out, or a
//! stop request is observed at a cycle boundary. Admission is decided
//! synchronously in [`AttemptController::submit`]; the cycles themselves run
//! on a spawned task and report through the run store's event log.

use crate::error::{JobError, ReviewError, StoreError, SubmitError};
use crate::events::{JobEvent, Subscription};
use crate::executor::{ExecutorAdapter, Sandbox};
use crate::records::{Direction, RecordStore};
use crate::review::ReviewGate;
use crate::schema::CompiledSchema;
use crate::settings::Settings;
use crate::store::RunStore;
use crate::synthesis::{CodeConversation, CodeSynthesizer, SynthesisContext};
use crate::types::{
    Activation, Attempt, AttemptId, AttemptOutcome, ConfigId, ExampleRecord, InputRecord, JobId,
    JobStatus, OutputSchema, ProcessingJob, Program, ServiceConfig, Transcript,
};
use crate::validator::{LogicCheck, Validator};
use at_model::ModelClient;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Records of one job: the batch first, then every labeled example
struct Workload {
    batch_len: usize,
    examples: Vec<ExampleRecord>,
    records: Vec<InputRecord>,
    /// QA for the sampled batch records, the label for examples
    checks: Vec<LogicCheck>,
}

impl Workload {
    fn new(config: &ServiceConfig, batch: Vec<InputRecord>) -> Self {
        let examples: Vec<ExampleRecord> = config.labeled_examples().cloned().collect();
        let batch_len = batch.len();
        let mut checks = vec![LogicCheck::Skip; batch_len];
        for i in config.code_qa.sample(&batch) {
            checks[i] = LogicCheck::Qa;
        }
        checks.extend(examples.iter().map(|e| LogicCheck::Expected(e.output.clone())));
        let mut records = batch;
        records.extend(examples.iter().map(|e| e.input.clone()));
        Self {
            batch_len,
            examples,
            records,
            checks,
        }
    }

    fn batch(&self) -> &[InputRecord] {
        &self.records[..self.batch_len]
    }
}

/// State carried from one cycle to the next
struct CycleState {
    /// Candidate schema; starts as the config's and changes on revision
    schema: Value,
    schema_commit: Option<String>,
    conversation: Option<CodeConversation>,
    previous: Option<Attempt>,
}

/// A finished cycle before it is persisted
struct Cycle {
    attempt: Attempt,
    outputs: Vec<Option<Value>>,
    /// Positions whose output agreed with a QA answer
    qa_checked: Vec<usize>,
    reused: bool,
}

/// Runs jobs for service configs
pub struct AttemptController {
    store: Arc<dyn RunStore>,
    records: Arc<dyn RecordStore>,
    synthesizer: CodeSynthesizer,
    executor: ExecutorAdapter,
    validator: Validator,
    gate: ReviewGate,
    max_attempts: u32,
    debug_transcripts: bool,
}

impl AttemptController {
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        records: Arc<dyn RecordStore>,
        model: Arc<dyn ModelClient>,
        executor: ExecutorAdapter,
        gate: ReviewGate,
    ) -> Self {
        Self {
            store,
            records,
            synthesizer: CodeSynthesizer::new(model.clone()),
            executor,
            validator: Validator::new(model),
            gate,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            debug_transcripts: false,
        }
    }

    /// Wire a controller from deployment settings
    #[must_use]
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn RunStore>,
        records: Arc<dyn RecordStore>,
        model: Arc<dyn ModelClient>,
        sandbox: Arc<dyn Sandbox>,
        gate: ReviewGate,
    ) -> Self {
        let executor = ExecutorAdapter::new(
            sandbox,
            settings.record_timeout(),
            settings.execution_concurrency,
        );
        Self::new(store, records, model, executor, gate)
            .with_max_attempts(settings.max_attempts)
            .with_debug_transcripts(settings.debug_transcripts)
    }

    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_debug_transcripts(mut self, enabled: bool) -> Self {
        self.debug_transcripts = enabled;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn gate(&self) -> &ReviewGate {
        &self.gate
    }

    /// Admit a batch and start its job
    ///
    /// Returns the job as first persisted (`running`, or `completed` for an
    /// empty batch). Only malformed submissions and capacity conflicts are
    /// rejected here; everything else is reported on the job.
    #[tracing::instrument(skip(self, records), fields(count = records.len()), err)]
    pub async fn submit(
        self: &Arc<Self>,
        config_id: ConfigId,
        records: Vec<Value>,
    ) -> Result<ProcessingJob, SubmitError> {
        let batch = records
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                InputRecord::from_value(value)
                    .ok_or_else(|| SubmitError::Malformed(format!("record {i} is not a JSON object")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.store.get_config(config_id).await?;
        let config = self.gate.resync(config_id).await?;
        if let Some(latest) = self.store.latest_job(config_id).await? {
            if latest.status == JobStatus::AwaitingReview {
                return Err(SubmitError::AwaitingReview {
                    config_id,
                    job_id: latest.id,
                });
            }
        }

        let mut job = ProcessingJob::new(config_id, batch.len());
        if batch.is_empty() {
            if let Some(running) = self.store.running_job(config_id).await {
                return Err(SubmitError::Conflict { config_id, running });
            }
            self.store.insert_job(job.clone()).await?;
            job.status = JobStatus::Completed;
            let job = self.store.update_job(job).await?;
            metrics::counter!("autotransform_jobs_total", "status" => job.status.as_str()).increment(1);
            tracing::info!("job {} completed with an empty batch", job.id);
            return Ok(job);
        }

        self.store.try_claim(config_id, job.id).await?;
        if let Err(e) = self.admit(&job, &batch).await {
            self.store.release(config_id, job.id).await;
            return Err(e);
        }
        tracing::info!("job {} admitted with {} records", job.id, batch.len());

        let this = Arc::clone(self);
        let spawned = job.clone();
        tokio::spawn(async move { this.run_job(config, spawned, batch).await });
        Ok(job)
    }

    async fn admit(&self, job: &ProcessingJob, batch: &[InputRecord]) -> Result<(), SubmitError> {
        self.store.insert_job(job.clone()).await?;
        let values: Vec<Value> = batch.iter().map(InputRecord::to_value).collect();
        if let Err(e) = self
            .records
            .save(job.config_id, job.id, Direction::Input, &values)
            .await
        {
            let mut failed = job.clone();
            failed.status = JobStatus::Failed;
            if let Err(update) = self.store.update_job(failed).await {
                tracing::error!("could not fail job {}: {}", job.id, update);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Ask a running job to stop at its next cycle boundary
    ///
    /// `false` when the job had already settled.
    pub async fn stop(&self, job_id: JobId) -> Result<bool, StoreError> {
        let accepted = self.store.request_stop(job_id).await?;
        if accepted {
            tracing::info!("stop requested for job {}", job_id);
        }
        Ok(accepted)
    }

    pub async fn subscribe(&self, job_id: JobId) -> Result<Subscription, StoreError> {
        self.store.subscribe(job_id).await
    }

    /// Apply an out-of-band review decision to a job awaiting review
    pub async fn resolve_review(
        &self,
        job_id: JobId,
        approved: bool,
    ) -> Result<ProcessingJob, ReviewError> {
        self.gate.resolve(job_id, approved).await
    }

    #[tracing::instrument(skip_all, fields(config_id = %config.id, job_id = %job.id))]
    async fn run_job(self: Arc<Self>, config: ServiceConfig, job: ProcessingJob, batch: Vec<InputRecord>) {
        let (config_id, job_id) = (config.id, job.id);
        let status = match self.drive(&config, job, batch).await {
            Ok(job) => job.status,
            Err(e) => {
                tracing::error!("job {} aborted: {}", job_id, e);
                self.fail(job_id).await
            }
        };
        self.store.release(config_id, job_id).await;
        metrics::counter!("autotransform_jobs_total", "status" => status.as_str()).increment(1);
        tracing::info!("job {} settled as {}", job_id, status);
    }

    /// Best effort transition to `failed` after an abort
    async fn fail(&self, job_id: JobId) -> JobStatus {
        let mut job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("could not load job {}: {}", job_id, e);
                return JobStatus::Failed;
            }
        };
        if job.status.is_settled() {
            return job.status;
        }
        job.status = JobStatus::Failed;
        match self.store.update_job(job).await {
            Ok(job) => job.status,
            Err(e) => {
                tracing::error!("could not fail job {}: {}", job_id, e);
                JobStatus::Failed
            }
        }
    }

    async fn settle(&self, mut job: ProcessingJob, status: JobStatus) -> Result<ProcessingJob, JobError> {
        job.status = status;
        Ok(self.store.update_job(job).await?)
    }

    async fn drive(
        &self,
        config: &ServiceConfig,
        job: ProcessingJob,
        batch: Vec<InputRecord>,
    ) -> Result<ProcessingJob, JobError> {
        let work = Workload::new(config, batch);
        if let Err(e) = self.gate.begin_job(config, job.id).await {
            tracing::error!("could not prepare review branch: {}", e);
            return self.settle(job, JobStatus::Failed).await;
        }

        let mut state = CycleState {
            schema: config.output_schema.schema.clone(),
            schema_commit: config.output_schema.commit.clone(),
            conversation: None,
            previous: None,
        };
        let mut index = 0;
        loop {
            if index > 0 && self.store.stop_requested(job.id).await {
                tracing::info!("stopping job {} after {} attempts", job.id, index);
                return self.settle(job, JobStatus::Stopped).await;
            }
            if index >= self.max_attempts {
                tracing::info!("attempt budget of {} exhausted", self.max_attempts);
                let mut job = job;
                job.change_request = self.gate.report_failure(config, job.id).await;
                return self.settle(job, JobStatus::Failed).await;
            }
            index += 1;

            let cycle = self.run_cycle(config, job.id, index, &mut state, &work).await;
            let attempt = self.store.append_attempt(cycle.attempt.clone()).await?;
            metrics::counter!("autotransform_attempts_total", "outcome" => attempt.outcome.as_str())
                .increment(1);
            tracing::info!(
                "attempt {} {} with {} errors",
                attempt.index,
                attempt.outcome.as_str(),
                attempt.error_count()
            );

            match attempt.outcome {
                AttemptOutcome::Passed => {
                    return self.finish(config, job, &work, &attempt, &cycle, &state).await;
                }
                AttemptOutcome::InfrastructureFailed => {
                    return self.settle(job, JobStatus::Failed).await;
                }
                AttemptOutcome::Failed | AttemptOutcome::SynthesisFailed => {
                    state.previous = Some(attempt);
                }
            }
        }
    }

    #[tracing::instrument(skip(self, config, state, work), fields(job_id = %job_id))]
    async fn run_cycle(
        &self,
        config: &ServiceConfig,
        job_id: JobId,
        index: u32,
        state: &mut CycleState,
        work: &Workload,
    ) -> Cycle {
        let mut transcripts = Vec::new();
        let active_code = config.active_program.as_ref().map(|p| p.code.as_str());
        let reused = index == 1 && active_code.is_some();
        let mut revised_schema = None;

        let code = if let Some(code) = active_code.filter(|_| reused) {
            tracing::debug!("re-validating the active program");
            code.to_string()
        } else {
            let existing = state
                .previous
                .as_ref()
                .and_then(|p| p.program.as_deref())
                .or(active_code)
                .map(str::to_string);

            if config.schema_revision {
                if let Some(previous) = state
                    .previous
                    .as_ref()
                    .filter(|p| !p.output_schema_errors.is_empty())
                {
                    let ctx = SynthesisContext {
                        schema: &state.schema,
                        examples: &work.examples,
                        inputs: work.batch(),
                        existing_code: existing.as_deref(),
                    };
                    match self.synthesizer.revise_schema(&ctx, previous).await {
                        Ok((Some(schema), transcript)) => {
                            tracing::info!("schema revised for attempt {}", index);
                            transcripts.push(transcript);
                            state.schema = schema.clone();
                            state.schema_commit = None;
                            state.conversation = None;
                            revised_schema = Some(schema);
                        }
                        Ok((None, transcript)) => transcripts.push(transcript),
                        Err(e) => {
                            return self.infrastructure(job_id, index, state, None, e.to_string(), transcripts);
                        }
                    }
                }
            }

            let ctx = SynthesisContext {
                schema: &state.schema,
                examples: &work.examples,
                inputs: work.batch(),
                existing_code: existing.as_deref(),
            };
            let conversation = state
                .conversation
                .get_or_insert_with(|| self.synthesizer.start(&ctx));
            let proposal = self
                .synthesizer
                .propose(conversation, state.previous.as_ref())
                .await;
            transcripts.push(conversation.transcript());
            match proposal {
                Ok(candidate) => candidate.code,
                Err(e) if e.is_infrastructure() => {
                    return self.infrastructure(job_id, index, state, None, e.to_string(), transcripts);
                }
                Err(e) => {
                    tracing::warn!("attempt {} produced no program: {}", index, e);
                    let mut attempt = self.blank_attempt(job_id, index, state);
                    attempt.outcome = AttemptOutcome::SynthesisFailed;
                    attempt.failure = Some(e.to_string());
                    self.keep_transcripts(&mut attempt, transcripts);
                    return Cycle {
                        attempt,
                        outputs: Vec::new(),
                        qa_checked: Vec::new(),
                        reused,
                    };
                }
            }
        };

        let compiled = match CompiledSchema::compile(&state.schema) {
            Ok(compiled) => compiled,
            Err(e) => return self.infrastructure(job_id, index, state, Some(code), e.to_string(), transcripts),
        };
        let results = self.executor.execute(&code, &work.records).await;
        let report = match self
            .validator
            .validate(
                &state.schema,
                &compiled,
                &work.examples,
                &work.records,
                &work.checks,
                results,
            )
            .await
        {
            Ok(report) => report,
            Err(e) => {
                let message = format!("QA model unavailable: {e}");
                return self.infrastructure(job_id, index, state, Some(code), message, transcripts);
            }
        };

        let mut attempt = self.blank_attempt(job_id, index, state);
        attempt.outcome = if report.is_clean() {
            AttemptOutcome::Passed
        } else {
            AttemptOutcome::Failed
        };
        attempt.output_schema_errors = report.output_schema_errors;
        attempt.execution_errors = report.execution_errors;
        attempt.logic_errors = report.logic_errors;
        transcripts.extend(report.qa_transcripts);

        if !reused {
            match self
                .gate
                .commit_attempt(config, job_id, index, &code, revised_schema.as_ref())
                .await
            {
                Ok(commits) => {
                    attempt.commit = commits.program.map(|c| c.url);
                    if let Some(schema) = commits.schema {
                        state.schema_commit = Some(schema.url);
                    }
                }
                Err(e) => {
                    tracing::error!("could not commit attempt {}: {}", index, e);
                    attempt.outcome = AttemptOutcome::InfrastructureFailed;
                    attempt.failure = Some(e.to_string());
                }
            }
        }
        attempt.program = Some(code);
        self.keep_transcripts(&mut attempt, transcripts);
        Cycle {
            attempt,
            outputs: report.outputs,
            qa_checked: report.qa_checked,
            reused,
        }
    }

    fn blank_attempt(&self, job_id: JobId, index: u32, state: &CycleState) -> Attempt {
        Attempt {
            id: AttemptId::new(),
            job_id,
            index,
            schema: state.schema.clone(),
            program: None,
            output_schema_errors: Vec::new(),
            execution_errors: Vec::new(),
            logic_errors: Vec::new(),
            outcome: AttemptOutcome::Failed,
            failure: None,
            created_at: Utc::now(),
            transcripts: Vec::new(),
            commit: None,
        }
    }

    fn infrastructure(
        &self,
        job_id: JobId,
        index: u32,
        state: &CycleState,
        program: Option<String>,
        message: String,
        transcripts: Vec<Transcript>,
    ) -> Cycle {
        tracing::error!("attempt {} hit an infrastructure failure: {}", index, message);
        let mut attempt = self.blank_attempt(job_id, index, state);
        attempt.program = program;
        attempt.outcome = AttemptOutcome::InfrastructureFailed;
        attempt.failure = Some(message);
        self.keep_transcripts(&mut attempt, transcripts);
        Cycle {
            attempt,
            outputs: Vec::new(),
            qa_checked: Vec::new(),
            reused: false,
        }
    }

    fn keep_transcripts(&self, attempt: &mut Attempt, transcripts: Vec<Transcript>) {
        if self.debug_transcripts {
            attempt.transcripts = transcripts;
        }
    }

    /// Persist outputs and hand the passing candidate to the review gate
    ///
    /// Only QA-confirmed batch records become bot examples.
    async fn finish(
        &self,
        config: &ServiceConfig,
        mut job: ProcessingJob,
        work: &Workload,
        attempt: &Attempt,
        cycle: &Cycle,
        state: &CycleState,
    ) -> Result<ProcessingJob, JobError> {
        let produced: Vec<Value> = cycle
            .outputs
            .iter()
            .take(work.batch_len)
            .map(|o| o.clone().unwrap_or(Value::Null))
            .collect();
        job.output_count = produced.len();
        if let Err(e) = self
            .records
            .save(config.id, job.id, Direction::Output, &produced)
            .await
        {
            tracing::error!("could not store outputs of job {}: {}", job.id, e);
        }

        let bot_examples: Vec<ExampleRecord> = if config.append_bot_examples {
            cycle
                .qa_checked
                .iter()
                .filter(|&&i| i < work.batch_len)
                .map(|&i| ExampleRecord::new(work.records[i].clone(), produced[i].clone()))
                .collect()
        } else {
            Vec::new()
        };

        if cycle.reused {
            let added = if bot_examples.is_empty() {
                0
            } else {
                self.store.append_bot_examples(config.id, &bot_examples).await?
            };
            tracing::info!("active program still passes; {} bot examples added", added);
            return self.settle(job, JobStatus::Completed).await;
        }

        let activation = Activation {
            schema: OutputSchema {
                schema: state.schema.clone(),
                commit: state.schema_commit.clone(),
            },
            program: Program {
                code: attempt.program.clone().unwrap_or_default(),
                commit: attempt.commit.clone(),
            },
            bot_examples,
        };
        Ok(self.gate.conclude(config, job, activation).await?)
    }
}

/// How long [`wait_settled`] polls before giving up
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Follow a job's event log until it settles, returning the final job
///
/// `None` if the job is unknown or the timeout elapses first.
pub async fn wait_settled(
    controller: &AttemptController,
    job_id: JobId,
    timeout: Duration,
) -> Option<ProcessingJob> {
    let mut subscription = controller.subscribe(job_id).await.ok()?;
    let follow = async {
        let mut last = None;
        while let Some(event) = subscription.next().await {
            if let JobEvent::Status(job) | JobEvent::Snapshot { job, .. } = &event {
                last = Some(job.clone());
            }
            if event.is_settled() {
                break;
            }
        }
        last
    };
    tokio::time::timeout(timeout, follow).await.ok().flatten()
}
