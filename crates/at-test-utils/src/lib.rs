//! Testing utilities for the AutoTransform workspace
//!
//! Scripted model and sandbox doubles, an in-memory version-control host,
//! phone-number fixtures and a harness wiring them to a controller.

#![allow(missing_docs)]

pub mod fixtures;
pub mod model;
pub mod sandbox;
pub mod vcs;

pub use fixtures::*;
pub use model::{program, program_reply, QaAnswer, ScriptedModel};
pub use sandbox::{Behaviour, Hold, ScriptedSandbox};
pub use vcs::{HostedRequest, InMemoryVcs};

use at_core::{
    wait_settled, AttemptController, ConfigService, ExecutorAdapter, InMemoryRunStore, JobId,
    LocalRecordStore, ProcessingJob, ReviewGate, RunStore, VersionControl,
};
use at_model::BackoffConfig;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A controller over in-memory stores and scripted doubles
pub struct Harness {
    pub store: Arc<InMemoryRunStore>,
    pub records: Arc<LocalRecordStore>,
    pub model: Arc<ScriptedModel>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub vcs: Option<Arc<InMemoryVcs>>,
    pub controller: Arc<AttemptController>,
    pub configs: ConfigService,
    _dir: TempDir,
}

impl Harness {
    pub fn new(model: ScriptedModel, sandbox: ScriptedSandbox, max_attempts: u32) -> Self {
        Self::build(model, sandbox, max_attempts, None)
    }

    /// Same as [`Harness::new`] with the review gate backed by [`InMemoryVcs`]
    pub fn with_review(model: ScriptedModel, sandbox: ScriptedSandbox, max_attempts: u32) -> Self {
        Self::build(model, sandbox, max_attempts, Some(Arc::new(InMemoryVcs::new())))
    }

    fn build(
        model: ScriptedModel,
        sandbox: ScriptedSandbox,
        max_attempts: u32,
        vcs: Option<Arc<InMemoryVcs>>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(InMemoryRunStore::new());
        let records = Arc::new(LocalRecordStore::new(dir.path()));
        let model = Arc::new(model);
        let sandbox = Arc::new(sandbox);

        let run_store: Arc<dyn RunStore> = store.clone();
        let provider = vcs.clone().map(|v| v as Arc<dyn VersionControl>);
        let gate = ReviewGate::new(run_store.clone(), provider).with_backoff(BackoffConfig::immediate(2));
        let executor = ExecutorAdapter::new(sandbox.clone(), Duration::from_secs(30), 4);
        let controller = AttemptController::new(
            run_store.clone(),
            records.clone(),
            model.clone(),
            executor,
            gate.clone(),
        )
        .with_max_attempts(max_attempts)
        .with_debug_transcripts(true);

        Self {
            store,
            records,
            model,
            sandbox,
            vcs,
            controller: Arc::new(controller),
            configs: ConfigService::new(run_store, gate),
            _dir: dir,
        }
    }

    /// Wait for `job_id` to leave `running`
    pub async fn settle(&self, job_id: JobId) -> ProcessingJob {
        wait_settled(&self.controller, job_id, Duration::from_secs(30))
            .await
            .expect("job did not settle")
    }
}
