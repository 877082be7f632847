//! Config service: create, update and describe service configs

use crate::error::{ConfigError, StoreError};
use crate::review::ReviewGate;
use crate::schema::{check_examples, CompiledSchema};
use crate::store::RunStore;
use crate::types::{
    CodeQa, ConfigId, ExampleRecord, OutputSchema, ProcessingJob, ReviewSettings, ServiceConfig,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Create-or-update request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertConfig {
    /// Existing config to update; a fresh id is minted when absent
    #[serde(default)]
    pub id: Option<ConfigId>,
    pub name: String,
    pub output_schema: Value,
    #[serde(default)]
    pub user_examples: Vec<ExampleRecord>,
    #[serde(default)]
    pub review: Option<ReviewSettings>,
    #[serde(default)]
    pub append_bot_examples: Option<bool>,
    #[serde(default)]
    pub schema_revision: Option<bool>,
    #[serde(default)]
    pub code_qa: Option<CodeQa>,
    #[serde(default)]
    pub bot_example_limit: Option<usize>,
}

impl UpsertConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, output_schema: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            output_schema,
            user_examples: Vec::new(),
            review: None,
            append_bot_examples: None,
            schema_revision: None,
            code_qa: None,
            bot_example_limit: None,
        }
    }

    #[must_use]
    pub fn with_examples(mut self, examples: Vec<ExampleRecord>) -> Self {
        self.user_examples = examples;
        self
    }

    /// Copy the optional switches that were set onto `config`
    fn apply_switches(&self, config: &mut ServiceConfig) {
        if let Some(enabled) = self.append_bot_examples {
            config.append_bot_examples = enabled;
        }
        if let Some(enabled) = self.schema_revision {
            config.schema_revision = enabled;
        }
        if let Some(code_qa) = self.code_qa {
            config.code_qa = code_qa;
        }
        if let Some(limit) = self.bot_example_limit {
            config.bot_example_limit = limit;
        }
    }
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub id: ConfigId,
    pub name: String,
    pub has_program: bool,
    pub updated_at: DateTime<Utc>,
}

/// A config with its job history, newest job first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDescription {
    pub config: ServiceConfig,
    pub jobs: Vec<ProcessingJob>,
}

pub struct ConfigService {
    store: Arc<dyn RunStore>,
    gate: ReviewGate,
}

impl ConfigService {
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, gate: ReviewGate) -> Self {
        Self { store, gate }
    }

    /// Create or update a config
    ///
    /// User examples are only ever added; an update that omits earlier
    /// examples keeps them. Every user example must satisfy the schema. An
    /// update is refused while a job runs for the config, and it rewrites
    /// only the fields the request carries, so bot examples and activations
    /// landing concurrently survive it.
    #[tracing::instrument(skip(self, request), fields(name = %request.name), err)]
    pub async fn upsert(&self, request: UpsertConfig) -> Result<ServiceConfig, ConfigError> {
        if request.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        CompiledSchema::compile(&request.output_schema)?;

        let existing = match request.id {
            Some(id) => match self.store.get_config(id).await {
                Ok(config) => Some(config),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        match existing {
            Some(mut config) => {
                if let Some(running) = self.store.running_job(config.id).await {
                    return Err(StoreError::Conflict {
                        config_id: config.id,
                        running,
                    }
                    .into());
                }
                let schema_changed = config.output_schema.schema != request.output_schema;
                let review_added = config.review.is_none() && request.review.is_some();

                let mut known: HashSet<String> = config
                    .user_examples
                    .iter()
                    .map(|e| e.input.record_id())
                    .collect();
                let added: Vec<ExampleRecord> = request
                    .user_examples
                    .iter()
                    .filter(|e| known.insert(e.input.record_id()))
                    .cloned()
                    .collect();
                config.user_examples.extend(added.iter().cloned());
                check_examples(&request.output_schema, &config.user_examples)
                    .map_err(|(index, message)| ConfigError::InvalidExample { index, message })?;

                request.apply_switches(&mut config);
                config.name = request.name;
                if schema_changed {
                    config.output_schema = OutputSchema::new(request.output_schema);
                }
                config.review = request.review;

                let published = (schema_changed || review_added) && self.gate.is_enabled(&config);
                if published {
                    self.gate.publish_config(&mut config).await?;
                }

                let draft = config;
                let config = self
                    .store
                    .modify_config(
                        draft.id,
                        Box::new(move |stored| {
                            stored.name = draft.name;
                            stored.review = draft.review;
                            stored.append_bot_examples = draft.append_bot_examples;
                            stored.schema_revision = draft.schema_revision;
                            stored.code_qa = draft.code_qa;
                            stored.bot_example_limit = draft.bot_example_limit;
                            if schema_changed || published {
                                stored.output_schema = draft.output_schema;
                            }
                            if let (Some(program), Some(sent)) =
                                (stored.active_program.as_mut(), draft.active_program)
                            {
                                if published && program.code == sent.code {
                                    program.commit = sent.commit;
                                }
                            }
                            let mut present: HashSet<String> = stored
                                .user_examples
                                .iter()
                                .map(|e| e.input.record_id())
                                .collect();
                            for example in added {
                                if present.insert(example.input.record_id()) {
                                    stored.user_examples.push(example);
                                }
                            }
                            stored.updated_at = Utc::now();
                        }),
                    )
                    .await?;
                tracing::info!("updated config {}", config.id);
                Ok(config)
            }
            None => {
                check_examples(&request.output_schema, &request.user_examples)
                    .map_err(|(index, message)| ConfigError::InvalidExample { index, message })?;
                let mut config = ServiceConfig::new(request.name.clone(), request.output_schema.clone())
                    .with_examples(request.user_examples.clone());
                if let Some(id) = request.id {
                    config.id = id;
                }
                request.apply_switches(&mut config);
                config.review = request.review;
                if self.gate.is_enabled(&config) {
                    self.gate.publish_config(&mut config).await?;
                }
                self.store.insert_config(config.clone()).await?;
                tracing::info!("created config {}", config.id);
                Ok(config)
            }
        }
    }

    /// Config and job history, after pulling external review state
    pub async fn describe(&self, id: ConfigId) -> Result<ConfigDescription, ConfigError> {
        let config = self.gate.resync(id).await?;
        let jobs = self.store.list_jobs(id).await?;
        Ok(ConfigDescription { config, jobs })
    }

    /// Configs, most recently updated first
    pub async fn list(&self) -> Result<Vec<ConfigSummary>, ConfigError> {
        Ok(self
            .store
            .list_configs()
            .await?
            .into_iter()
            .map(|config| ConfigSummary {
                id: config.id,
                name: config.name,
                has_program: config.active_program.is_some(),
                updated_at: config.updated_at,
            })
            .collect())
    }
}
