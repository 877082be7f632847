//! Core domain types
//!
//! - Identifiers for configs, jobs and attempts
//! - Records and labeled examples
//! - Service configuration with its active program and schema
//! - Processing jobs, attempts and their per-record error lists

use crate::hash::ContentHash;
use at_model::ChatMessage;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

/// Service configuration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(pub Uuid);

impl ConfigId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First four characters, used in repository paths
    #[must_use]
    pub fn prefix(&self) -> String {
        self.0.to_string().chars().take(4).collect()
    }
}

impl Default for ConfigId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConfigId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Processing job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Attempt identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub Ulid);

impl AttemptId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One input record: always a JSON object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputRecord(Map<String, Value>);

impl InputRecord {
    #[inline]
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// `None` unless `value` is an object
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Stable across key order
    #[must_use]
    pub fn record_id(&self) -> String {
        ContentHash::of_json(&self.to_value()).short()
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// A labeled input/output pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleRecord {
    pub input: InputRecord,
    pub output: Value,
}

impl ExampleRecord {
    #[must_use]
    pub fn new(input: InputRecord, output: Value) -> Self {
        Self { input, output }
    }
}

/// Output JSON Schema with its version-control reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub schema: Value,
    #[serde(default)]
    pub commit: Option<String>,
}

impl OutputSchema {
    #[must_use]
    pub fn new(schema: Value) -> Self {
        Self {
            schema,
            commit: None,
        }
    }
}

/// Program source defining `run_code(input: dict) -> dict`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub code: String,
    #[serde(default)]
    pub commit: Option<String>,
}

impl Program {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            commit: None,
        }
    }
}

/// Repository coordinates on the version-control host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

/// Review-gate settings; absent means activate immediately
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSettings {
    #[serde(flatten)]
    pub repository: RepoRef,
    #[serde(default = "default_primary_branch")]
    pub primary_branch: String,
    /// Merge a passing change request without waiting for a human
    #[serde(default)]
    pub auto_merge: bool,
}

fn default_primary_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_bot_example_limit() -> usize {
    DEFAULT_BOT_EXAMPLE_LIMIT
}

/// Bot examples a config keeps before it stops accepting more
pub const DEFAULT_BOT_EXAMPLE_LIMIT: usize = 50;

/// Spot checks of unlabeled batch outputs against a model answer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeQa {
    /// Share of batch records checked
    pub qa_pct: f64,
    /// Checked records per batch, whatever `qa_pct` yields
    pub min_qa: usize,
}

impl Default for CodeQa {
    fn default() -> Self {
        Self {
            qa_pct: 0.2,
            min_qa: 1,
        }
    }
}

impl CodeQa {
    /// Batch positions to check, ascending
    ///
    /// Each record ranks by a fraction derived from its content. Records
    /// ranked below `qa_pct` are picked and the lowest-ranked others top the
    /// pick up to `min_qa`, so a rerun of the same batch checks the same records.
    #[must_use]
    pub fn sample(&self, batch: &[InputRecord]) -> Vec<usize> {
        let mut ranked: Vec<(f64, usize)> = batch
            .iter()
            .enumerate()
            .map(|(i, record)| (ContentHash::of_json(&record.to_value()).unit_fraction(), i))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        let picked = ranked
            .iter()
            .take_while(|(fraction, _)| *fraction < self.qa_pct)
            .count()
            .max(self.min_qa)
            .min(batch.len());
        let mut indices: Vec<usize> = ranked[..picked].iter().map(|(_, i)| *i).collect();
        indices.sort_unstable();
        indices
    }
}

/// A named transformation target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: ConfigId,
    pub name: String,
    pub output_schema: OutputSchema,
    /// Operator-provided; never mutated by the system
    #[serde(default)]
    pub user_examples: Vec<ExampleRecord>,
    /// System-accumulated; additive only
    #[serde(default)]
    pub bot_examples: Vec<ExampleRecord>,
    #[serde(default)]
    pub active_program: Option<Program>,
    #[serde(default)]
    pub review: Option<ReviewSettings>,
    #[serde(default = "default_true")]
    pub append_bot_examples: bool,
    #[serde(default)]
    pub schema_revision: bool,
    #[serde(default)]
    pub code_qa: CodeQa,
    /// Merging stops once `bot_examples` holds this many
    #[serde(default = "default_bot_example_limit")]
    pub bot_example_limit: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        let now = Utc::now();
        Self {
            id: ConfigId::new(),
            name: name.into(),
            output_schema: OutputSchema::new(schema),
            user_examples: Vec::new(),
            bot_examples: Vec::new(),
            active_program: None,
            review: None,
            append_bot_examples: true,
            schema_revision: false,
            code_qa: CodeQa::default(),
            bot_example_limit: DEFAULT_BOT_EXAMPLE_LIMIT,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_examples(mut self, examples: Vec<ExampleRecord>) -> Self {
        self.user_examples = examples;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_review(mut self, review: ReviewSettings) -> Self {
        self.review = Some(review);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_program(mut self, program: Program) -> Self {
        self.active_program = Some(program);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_schema_revision(mut self, enabled: bool) -> Self {
        self.schema_revision = enabled;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_bot_examples(mut self, enabled: bool) -> Self {
        self.append_bot_examples = enabled;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_code_qa(mut self, code_qa: CodeQa) -> Self {
        self.code_qa = code_qa;
        self
    }

    /// User examples followed by bot examples
    pub fn labeled_examples(&self) -> impl Iterator<Item = &ExampleRecord> {
        self.user_examples.iter().chain(self.bot_examples.iter())
    }

    /// Folder on the version-control host holding this config's assets
    #[must_use]
    pub fn repo_folder(&self) -> String {
        format!("{}-{}", self.name, self.id.prefix())
    }

    /// Swap in the candidate schema and program, then merge new bot examples
    ///
    /// Returns how many bot examples were appended.
    pub fn apply_activation(&mut self, activation: &Activation) -> usize {
        self.output_schema = activation.schema.clone();
        self.active_program = Some(activation.program.clone());
        let added = self.merge_bot_examples(&activation.bot_examples);
        self.updated_at = Utc::now();
        added
    }

    /// Append examples whose input is not already labeled, up to `bot_example_limit`
    pub fn merge_bot_examples(&mut self, candidates: &[ExampleRecord]) -> usize {
        let user_ids: HashSet<String> = self
            .user_examples
            .iter()
            .map(|e| e.input.record_id())
            .collect();
        let mut merged: IndexMap<String, ExampleRecord> = self
            .bot_examples
            .drain(..)
            .map(|e| (e.input.record_id(), e))
            .collect();
        let before = merged.len();
        for example in candidates {
            if merged.len() >= self.bot_example_limit {
                break;
            }
            let id = example.input.record_id();
            if !user_ids.contains(&id) {
                merged.entry(id).or_insert_with(|| example.clone());
            }
        }
        let added = merged.len() - before;
        self.bot_examples = merged.into_values().collect();
        added
    }
}

/// Lifecycle of a processing job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    AwaitingReview,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::AwaitingReview => "awaiting_review",
        }
    }

    /// No longer driven by the attempt loop
    #[inline]
    #[must_use]
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// No transition can leave this state
    #[inline]
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an opened change request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub number: u64,
    pub url: String,
}

/// A candidate waiting to become the active program and schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub schema: OutputSchema,
    pub program: Program,
    #[serde(default)]
    pub bot_examples: Vec<ExampleRecord>,
}

/// One submitted batch and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: JobId,
    pub config_id: ConfigId,
    pub input_count: usize,
    pub output_count: usize,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub change_request: Option<ChangeRequest>,
    #[serde(default)]
    pub pending: Option<Activation>,
}

impl ProcessingJob {
    #[must_use]
    pub fn new(config_id: ConfigId, input_count: usize) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            config_id,
            input_count,
            output_count: 0,
            status: JobStatus::Running,
            created_at: now,
            updated_at: now,
            change_request: None,
            pending: None,
        }
    }
}

/// Output failed the schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchemaError {
    pub record: InputRecord,
    pub message: String,
}

/// Program raised, timed out or returned garbage for a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub record: InputRecord,
    pub message: String,
}

/// Output was judged different from the expected one
///
/// `expected` is the labeled output, or the model's own answer for a
/// spot-checked batch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicError {
    pub record: InputRecord,
    pub actual: Value,
    pub expected: Value,
}

/// How an attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed,
    Failed,
    SynthesisFailed,
    InfrastructureFailed,
}

impl AttemptOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::SynthesisFailed => "synthesis_failed",
            Self::InfrastructureFailed => "infrastructure_failed",
        }
    }
}

/// Which generation conversation a transcript records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptPurpose {
    Schema,
    Code,
    Qa,
}

/// One model conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub purpose: TranscriptPurpose,
    pub messages: Vec<ChatMessage>,
}

impl Transcript {
    #[must_use]
    pub fn new(purpose: TranscriptPurpose, messages: Vec<ChatMessage>) -> Self {
        Self { purpose, messages }
    }
}

/// One synthesize/execute/validate cycle; immutable once stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub job_id: JobId,
    /// 1-based position within the job
    pub index: u32,
    pub schema: Value,
    /// `None` when synthesis produced no program
    pub program: Option<String>,
    pub output_schema_errors: Vec<OutputSchemaError>,
    pub execution_errors: Vec<ExecutionError>,
    pub logic_errors: Vec<LogicError>,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub transcripts: Vec<Transcript>,
    #[serde(default)]
    pub commit: Option<String>,
}

impl Attempt {
    /// Total per-record errors
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.output_schema_errors.len() + self.execution_errors.len() + self.logic_errors.len()
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == AttemptOutcome::Passed
    }
}
