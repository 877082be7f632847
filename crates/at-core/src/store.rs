//! Run store: configs, jobs, attempts and the running-job claim
//!
//! The store owns the only cross-job shared state: which job (if any) holds
//! each config. Claiming is an atomic check-and-set on that reference.

use crate::error::StoreError;
use crate::events::{EventLog, JobEvent, Subscription};
use crate::state_machine::validate_transition;
use crate::types::{
    Activation, Attempt, ConfigId, ExampleRecord, JobId, ProcessingJob, ServiceConfig,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

/// In-place change to one stored config
pub type ConfigEdit = Box<dyn FnOnce(&mut ServiceConfig) + Send>;

/// Durable-store contract used by the controller, review gate and config service
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_config(&self, config: ServiceConfig) -> Result<(), StoreError>;

    async fn get_config(&self, id: ConfigId) -> Result<ServiceConfig, StoreError>;

    /// Apply `edit` to the stored config in place and return the result
    ///
    /// Fields the edit leaves alone keep whatever concurrent writers put
    /// there, so callers change only what they own.
    async fn modify_config(&self, id: ConfigId, edit: ConfigEdit) -> Result<ServiceConfig, StoreError>;

    /// All configs, most recently updated first
    async fn list_configs(&self) -> Result<Vec<ServiceConfig>, StoreError>;

    /// Atomically swap the active schema/program and merge bot examples
    async fn activate(
        &self,
        id: ConfigId,
        activation: &Activation,
    ) -> Result<ServiceConfig, StoreError>;

    /// Merge bot examples without touching the active program; returns how many were added
    async fn append_bot_examples(
        &self,
        id: ConfigId,
        examples: &[ExampleRecord],
    ) -> Result<usize, StoreError>;

    /// Claim the config for `job_id`; fails with `Conflict` if held
    async fn try_claim(&self, config_id: ConfigId, job_id: JobId) -> Result<(), StoreError>;

    /// Release the claim if `job_id` holds it
    async fn release(&self, config_id: ConfigId, job_id: JobId);

    async fn running_job(&self, config_id: ConfigId) -> Option<JobId>;

    async fn insert_job(&self, job: ProcessingJob) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<ProcessingJob, StoreError>;

    /// Replace a job record; status changes must follow the state machine
    ///
    /// A job that leaves `running` gives up its claim on the config.
    async fn update_job(&self, job: ProcessingJob) -> Result<ProcessingJob, StoreError>;

    /// Jobs for a config, newest first
    async fn list_jobs(&self, config_id: ConfigId) -> Result<Vec<ProcessingJob>, StoreError>;

    async fn latest_job(&self, config_id: ConfigId) -> Result<Option<ProcessingJob>, StoreError> {
        Ok(self.list_jobs(config_id).await?.into_iter().next())
    }

    /// Append the next attempt; returns it as stored
    async fn append_attempt(&self, attempt: Attempt) -> Result<Attempt, StoreError>;

    /// Attempts in append order
    async fn list_attempts(&self, job_id: JobId) -> Result<Vec<Attempt>, StoreError>;

    /// Flag a running job to stop; `false` when it has already settled
    async fn request_stop(&self, job_id: JobId) -> Result<bool, StoreError>;

    async fn stop_requested(&self, job_id: JobId) -> bool;

    /// Snapshot then incremental events for a job
    async fn subscribe(&self, job_id: JobId) -> Result<Subscription, StoreError>;

    /// Log entries at or after `cursor`
    async fn events_since(&self, job_id: JobId, cursor: usize) -> Result<Vec<JobEvent>, StoreError>;
}

/// In-process store backed by concurrent maps
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    configs: DashMap<ConfigId, ServiceConfig>,
    jobs: DashMap<JobId, ProcessingJob>,
    attempts: DashMap<JobId, Vec<Attempt>>,
    running: DashMap<ConfigId, JobId>,
    stops: DashSet<JobId>,
    events: Arc<EventLog>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The log this store publishes to
    #[must_use]
    pub fn event_log(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_config(&self, config: ServiceConfig) -> Result<(), StoreError> {
        match self.configs.entry(config.id) {
            Entry::Occupied(_) => Err(StoreError::ConfigExists(config.id)),
            Entry::Vacant(slot) => {
                slot.insert(config);
                Ok(())
            }
        }
    }

    async fn get_config(&self, id: ConfigId) -> Result<ServiceConfig, StoreError> {
        self.configs
            .get(&id)
            .map(|c| c.clone())
            .ok_or(StoreError::ConfigNotFound(id))
    }

    async fn modify_config(&self, id: ConfigId, edit: ConfigEdit) -> Result<ServiceConfig, StoreError> {
        let mut slot = self.configs.get_mut(&id).ok_or(StoreError::ConfigNotFound(id))?;
        edit(&mut slot);
        Ok(slot.clone())
    }

    async fn list_configs(&self) -> Result<Vec<ServiceConfig>, StoreError> {
        let mut configs: Vec<_> = self.configs.iter().map(|c| c.clone()).collect();
        configs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(configs)
    }

    async fn activate(
        &self,
        id: ConfigId,
        activation: &Activation,
    ) -> Result<ServiceConfig, StoreError> {
        let mut slot = self.configs.get_mut(&id).ok_or(StoreError::ConfigNotFound(id))?;
        let added = slot.apply_activation(activation);
        tracing::info!("activated new program for config {} ({} bot examples added)", id, added);
        Ok(slot.clone())
    }

    async fn append_bot_examples(
        &self,
        id: ConfigId,
        examples: &[ExampleRecord],
    ) -> Result<usize, StoreError> {
        let mut slot = self.configs.get_mut(&id).ok_or(StoreError::ConfigNotFound(id))?;
        let added = slot.merge_bot_examples(examples);
        if added > 0 {
            slot.updated_at = Utc::now();
        }
        Ok(added)
    }

    async fn try_claim(&self, config_id: ConfigId, job_id: JobId) -> Result<(), StoreError> {
        match self.running.entry(config_id) {
            Entry::Occupied(held) => Err(StoreError::Conflict {
                config_id,
                running: *held.get(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(job_id);
                Ok(())
            }
        }
    }

    async fn release(&self, config_id: ConfigId, job_id: JobId) {
        self.running.remove_if(&config_id, |_, held| *held == job_id);
    }

    async fn running_job(&self, config_id: ConfigId) -> Option<JobId> {
        self.running.get(&config_id).map(|j| *j)
    }

    async fn insert_job(&self, job: ProcessingJob) -> Result<(), StoreError> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(StoreError::JobExists(job.id)),
            Entry::Vacant(slot) => {
                self.events.publish(job.id, JobEvent::Status(job.clone()));
                slot.insert(job);
                Ok(())
            }
        }
    }

    async fn get_job(&self, id: JobId) -> Result<ProcessingJob, StoreError> {
        self.jobs
            .get(&id)
            .map(|j| j.clone())
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn update_job(&self, mut job: ProcessingJob) -> Result<ProcessingJob, StoreError> {
        let mut slot = self.jobs.get_mut(&job.id).ok_or(StoreError::JobNotFound(job.id))?;
        if slot.status != job.status {
            validate_transition(slot.status, job.status)?;
        }
        job.updated_at = Utc::now();
        *slot = job.clone();
        drop(slot);
        // Settled jobs free their config before anyone can observe the status
        if job.status.is_settled() {
            self.running.remove_if(&job.config_id, |_, held| *held == job.id);
            self.stops.remove(&job.id);
        }
        self.events.publish(job.id, JobEvent::Status(job.clone()));
        Ok(job)
    }

    async fn list_jobs(&self, config_id: ConfigId) -> Result<Vec<ProcessingJob>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter(|j| j.config_id == config_id)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn append_attempt(&self, mut attempt: Attempt) -> Result<Attempt, StoreError> {
        if !self.jobs.contains_key(&attempt.job_id) {
            return Err(StoreError::JobNotFound(attempt.job_id));
        }
        let mut list = self.attempts.entry(attempt.job_id).or_default();
        let expected = u32::try_from(list.len()).unwrap_or(u32::MAX).saturating_add(1);
        if attempt.index != expected {
            return Err(StoreError::AttemptOrder {
                job_id: attempt.job_id,
                expected,
                got: attempt.index,
            });
        }
        if let Some(prev) = list.last() {
            if attempt.created_at <= prev.created_at {
                attempt.created_at = prev.created_at + Duration::microseconds(1);
            }
        }
        list.push(attempt.clone());
        self.events.publish(attempt.job_id, JobEvent::Attempt(attempt.clone()));
        Ok(attempt)
    }

    async fn list_attempts(&self, job_id: JobId) -> Result<Vec<Attempt>, StoreError> {
        if !self.jobs.contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(self
            .attempts
            .get(&job_id)
            .map(|a| a.clone())
            .unwrap_or_default())
    }

    async fn request_stop(&self, job_id: JobId) -> Result<bool, StoreError> {
        let job = self.jobs.get(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_settled() {
            return Ok(false);
        }
        self.stops.insert(job_id);
        Ok(true)
    }

    async fn stop_requested(&self, job_id: JobId) -> bool {
        self.stops.contains(&job_id)
    }

    async fn subscribe(&self, job_id: JobId) -> Result<Subscription, StoreError> {
        self.events
            .subscribe(job_id)
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn events_since(&self, job_id: JobId, cursor: usize) -> Result<Vec<JobEvent>, StoreError> {
        if !self.jobs.contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(self.events.events_since(job_id, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttemptId, AttemptOutcome, InputRecord, JobStatus, OutputSchema, Program};
    use serde_json::json;

    fn attempt(job_id: JobId, index: u32) -> Attempt {
        Attempt {
            id: AttemptId::new(),
            job_id,
            index,
            schema: json!({"type": "object"}),
            program: Some("def run_code(input):\n    return input".into()),
            output_schema_errors: vec![],
            execution_errors: vec![],
            logic_errors: vec![],
            outcome: AttemptOutcome::Failed,
            failure: None,
            created_at: Utc::now(),
            transcripts: vec![],
            commit: None,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_per_config() {
        let store = InMemoryRunStore::new();
        let config = ConfigId::new();
        let (first, second) = (JobId::new(), JobId::new());

        store.try_claim(config, first).await.unwrap();
        let err = store.try_claim(config, second).await.unwrap_err();
        assert!(err.is_conflict());

        store.release(config, second).await;
        assert_eq!(store.running_job(config).await, Some(first));

        store.release(config, first).await;
        store.try_claim(config, second).await.unwrap();
        store.try_claim(ConfigId::new(), first).await.unwrap();
    }

    #[tokio::test]
    async fn attempts_are_consecutive_and_time_ordered() {
        let store = InMemoryRunStore::new();
        let job = ProcessingJob::new(ConfigId::new(), 1);
        let id = job.id;
        store.insert_job(job).await.unwrap();

        let first = store.append_attempt(attempt(id, 1)).await.unwrap();
        let mut second = attempt(id, 2);
        second.created_at = first.created_at;
        let second = store.append_attempt(second).await.unwrap();
        assert!(second.created_at > first.created_at);

        let err = store.append_attempt(attempt(id, 4)).await.unwrap_err();
        assert!(matches!(err, StoreError::AttemptOrder { expected: 3, got: 4, .. }));
        assert_eq!(store.list_attempts(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_job_enforces_transitions() {
        let store = InMemoryRunStore::new();
        let mut job = ProcessingJob::new(ConfigId::new(), 0);
        store.insert_job(job.clone()).await.unwrap();

        job.status = JobStatus::Stopped;
        store.update_job(job.clone()).await.unwrap();

        job.status = JobStatus::Completed;
        let err = store.update_job(job).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn settling_releases_the_claim() {
        let store = InMemoryRunStore::new();
        let mut job = ProcessingJob::new(ConfigId::new(), 1);
        store.try_claim(job.config_id, job.id).await.unwrap();
        store.insert_job(job.clone()).await.unwrap();

        job.status = JobStatus::Failed;
        store.update_job(job.clone()).await.unwrap();
        assert_eq!(store.running_job(job.config_id).await, None);
    }

    #[tokio::test]
    async fn stop_after_settle_is_noop() {
        let store = InMemoryRunStore::new();
        let running = ProcessingJob::new(ConfigId::new(), 0);
        store.insert_job(running.clone()).await.unwrap();
        assert!(store.request_stop(running.id).await.unwrap());
        assert!(store.stop_requested(running.id).await);

        let mut done = ProcessingJob::new(ConfigId::new(), 0);
        store.insert_job(done.clone()).await.unwrap();
        done.status = JobStatus::Completed;
        store.update_job(done.clone()).await.unwrap();
        assert!(!store.request_stop(done.id).await.unwrap());
        assert!(!store.stop_requested(done.id).await);
    }

    #[tokio::test]
    async fn settling_clears_the_stop_flag() {
        let store = InMemoryRunStore::new();
        let mut job = ProcessingJob::new(ConfigId::new(), 1);
        store.insert_job(job.clone()).await.unwrap();
        assert!(store.request_stop(job.id).await.unwrap());

        job.status = JobStatus::Stopped;
        store.update_job(job.clone()).await.unwrap();
        assert!(!store.stop_requested(job.id).await);
        assert!(store.stops.is_empty());
    }

    #[tokio::test]
    async fn modify_config_keeps_fields_it_does_not_touch() {
        let store = InMemoryRunStore::new();
        let config = ServiceConfig::new("svc", json!({"type": "object"}));
        let id = config.id;
        let stale = config.clone();
        store.insert_config(config).await.unwrap();
        store
            .append_bot_examples(id, &[ExampleRecord::new(
                InputRecord::from_value(json!({"a": 1})).unwrap(),
                json!({"b": 1}),
            )])
            .await
            .unwrap();

        let name = format!("{}-renamed", stale.name);
        let updated = store
            .modify_config(id, Box::new(move |c| c.name = name))
            .await
            .unwrap();
        assert_eq!(updated.name, "svc-renamed");
        assert_eq!(updated.bot_examples.len(), 1);
        assert!(store.modify_config(ConfigId::new(), Box::new(|_| {})).await.is_err());
    }

    #[tokio::test]
    async fn jobs_listed_newest_first() {
        let store = InMemoryRunStore::new();
        let config = ConfigId::new();
        let older = ProcessingJob::new(config, 1);
        let mut newer = ProcessingJob::new(config, 2);
        newer.created_at = older.created_at + Duration::seconds(1);
        store.insert_job(older.clone()).await.unwrap();
        store.insert_job(newer.clone()).await.unwrap();
        store.insert_job(ProcessingJob::new(ConfigId::new(), 3)).await.unwrap();

        let jobs = store.list_jobs(config).await.unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![newer.id, older.id]);
        assert_eq!(store.latest_job(config).await.unwrap().map(|j| j.id), Some(newer.id));
    }

    #[tokio::test]
    async fn activate_replaces_program_atomically() {
        let store = InMemoryRunStore::new();
        let config = ServiceConfig::new("svc", json!({"type": "object"}));
        let id = config.id;
        store.insert_config(config).await.unwrap();

        let activation = Activation {
            schema: OutputSchema::new(json!({"type": "object", "required": ["x"]})),
            program: Program::new("def run_code(input):\n    return {'x': 1}"),
            bot_examples: vec![],
        };
        let updated = store.activate(id, &activation).await.unwrap();
        assert_eq!(updated.active_program, Some(activation.program.clone()));
        assert_eq!(store.get_config(id).await.unwrap().output_schema, activation.schema);
    }

    #[tokio::test]
    async fn subscription_sees_attempts_in_snapshot() {
        let store = InMemoryRunStore::new();
        let job = ProcessingJob::new(ConfigId::new(), 1);
        let id = job.id;
        store.insert_job(job).await.unwrap();
        store.append_attempt(attempt(id, 1)).await.unwrap();

        let mut sub = store.subscribe(id).await.unwrap();
        match sub.next().await {
            Some(JobEvent::Snapshot { attempts, .. }) => assert_eq!(attempts.len(), 1),
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(store.subscribe(JobId::new()).await.is_err());
    }
}
