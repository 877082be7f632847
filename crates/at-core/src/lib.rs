//! AutoTransform Core - synthesis, validation and repair of record transformations
//!
//! Given a service config (output schema, labeled examples) and a batch of
//! input records, the core:
//! - Canonicalizes output schemas from a description or examples
//! - Asks a model for a candidate program and runs it per record in a sandbox
//! - Classifies every record's result (execution, schema, logic errors)
//! - Feeds the errors back for repair until the batch passes or the budget ends
//! - Activates the winner directly or through a version-control review
//!
//! # Example
//!
//! ```rust,ignore
//! use at_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(model: Arc<dyn at_model::ModelClient>, sandbox: Arc<dyn Sandbox>) -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::default();
//! let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
//! let records = Arc::new(LocalRecordStore::new(&settings.data_dir));
//! let gate = ReviewGate::new(store.clone(), None);
//! let configs = ConfigService::new(store.clone(), gate.clone());
//! let controller = Arc::new(AttemptController::from_settings(
//!     &settings, store, records, model, sandbox, gate,
//! ));
//!
//! let config = configs
//!     .upsert(UpsertConfig::new("phones", serde_json::json!({"type": "object"})))
//!     .await?;
//! let job = controller
//!     .submit(config.id, vec![serde_json::json!({"phone_entry": "415-854-9030"})])
//!     .await?;
//! let done = wait_settled(&controller, job.id, DEFAULT_SETTLE_TIMEOUT).await;
//! println!("{:?}", done.map(|job| job.status));
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod configs;
pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod hash;
pub mod prompts;
pub mod records;
pub mod review;
pub mod schema;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod synthesis;
pub mod types;
pub mod validator;
pub mod vcs;

pub use configs::{ConfigDescription, ConfigService, ConfigSummary, UpsertConfig};
pub use controller::{wait_settled, AttemptController, DEFAULT_MAX_ATTEMPTS, DEFAULT_SETTLE_TIMEOUT};
pub use error::{
    ConfigError, JobError, RecordStoreError, ReviewError, SandboxError, SchemaError,
    SettingsError, StoreError, SubmitError, SynthesisError, VcsError,
};
pub use events::{EventLog, JobEvent, Subscription};
pub use executor::{ExecutorAdapter, RecordResult, Sandbox};
pub use hash::{canonical_json, ContentHash};
pub use records::{Direction, LocalRecordStore, RecordStore};
pub use review::{AttemptCommits, ReviewGate};
pub use schema::{check_examples, CanonicalSchema, CompiledSchema, SchemaCanonicalizer, SchemaSource};
pub use settings::{LogSettings, Settings, VcsSettings};
pub use state_machine::{allowed_transitions, validate_transition};
pub use store::{ConfigEdit, InMemoryRunStore, RunStore};
pub use synthesis::{Candidate, CodeConversation, CodeSynthesizer, SynthesisContext};
pub use types::{
    Activation, Attempt, AttemptId, AttemptOutcome, ChangeRequest, CodeQa, ConfigId, ExampleRecord,
    ExecutionError, InputRecord, JobId, JobStatus, LogicError, OutputSchema, OutputSchemaError,
    ProcessingJob, Program, RepoRef, ReviewSettings, ServiceConfig, Transcript, TranscriptPurpose,
};
pub use validator::{LogicCheck, ValidationReport, Validator};
pub use vcs::{ChangeRequestStatus, CommitRef, VcsProvider, VersionControl};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running AutoTransform jobs
    pub use crate::{
        wait_settled, AttemptController, ConfigService, InMemoryRunStore, JobEvent, JobStatus,
        LocalRecordStore, ProcessingJob, ReviewGate, RunStore, Sandbox, ServiceConfig, Settings,
        UpsertConfig, DEFAULT_SETTLE_TIMEOUT,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
