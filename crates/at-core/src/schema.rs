//! Schema canonicalizer and JSON Schema helpers
//!
//! Turns a free-form description or a set of labeled examples into one JSON
//! Schema with a single model call. Runs interactively, outside the attempt
//! loop, and never retries on malformed output.

use crate::error::SchemaError;
use crate::prompts;
use crate::types::{ExampleRecord, Transcript, TranscriptPurpose};
use at_model::{parse_json_output, ChatMessage, ModelClient};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::sync::Arc;

/// A compiled JSON Schema
pub struct CompiledSchema {
    compiled: JSONSchema,
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema").finish_non_exhaustive()
    }
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Result<Self, SchemaError> {
        if !schema.is_object() && !schema.is_boolean() {
            return Err(SchemaError::Invalid("schema must be an object or boolean".into()));
        }
        let compiled =
            JSONSchema::compile(schema).map_err(|e| SchemaError::Invalid(e.to_string()))?;
        Ok(Self { compiled })
    }

    /// Every validation message for `instance`; empty when it conforms
    #[must_use]
    pub fn errors(&self, instance: &Value) -> Vec<String> {
        match self.compiled.validate(instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.map(|e| e.to_string()).collect(),
        }
    }

    #[must_use]
    pub fn is_valid(&self, instance: &Value) -> bool {
        self.compiled.is_valid(instance)
    }
}

/// What to derive a schema from
#[derive(Debug, Clone)]
pub enum SchemaSource {
    Description(String),
    Examples(Vec<ExampleRecord>),
}

/// Canonicalizer output
#[derive(Debug, Clone)]
pub struct CanonicalSchema {
    pub schema: Value,
    pub transcript: Transcript,
}

/// Single-shot schema derivation through the model capability
#[derive(Clone)]
pub struct SchemaCanonicalizer {
    model: Arc<dyn ModelClient>,
}

impl SchemaCanonicalizer {
    #[must_use]
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    #[tracing::instrument(skip(self, source), err)]
    pub async fn canonicalize(&self, source: SchemaSource) -> Result<CanonicalSchema, SchemaError> {
        let mut messages = match source {
            SchemaSource::Description(text) => {
                if text.trim().is_empty() {
                    return Err(SchemaError::InvalidInput("description is empty".into()));
                }
                vec![
                    ChatMessage::system(prompts::SCHEMA_FROM_DESCRIPTION_SYSTEM),
                    ChatMessage::user(text),
                ]
            }
            SchemaSource::Examples(examples) => {
                if examples.is_empty() {
                    return Err(SchemaError::InvalidInput("example set is empty".into()));
                }
                vec![
                    ChatMessage::system(prompts::SCHEMA_FROM_EXAMPLES_SYSTEM),
                    ChatMessage::user(prompts::examples_block(&examples)),
                ]
            }
        };

        let reply = self.model.complete(&messages).await?;
        let parsed = parse_json_output(&reply.content);
        messages.push(reply);
        let schema = parsed.map_err(|e| SchemaError::Parse(e.to_string()))?;
        CompiledSchema::compile(&schema).map_err(|e| SchemaError::Parse(e.to_string()))?;

        tracing::info!("canonicalized output schema");
        Ok(CanonicalSchema {
            schema,
            transcript: Transcript::new(TranscriptPurpose::Schema, messages),
        })
    }
}

/// Check each example's output against `schema`
///
/// Returns the index and messages of the first non-conforming example.
pub fn check_examples(schema: &Value, examples: &[ExampleRecord]) -> Result<(), (usize, String)> {
    let compiled = CompiledSchema::compile(schema).map_err(|e| (0, e.to_string()))?;
    for (index, example) in examples.iter().enumerate() {
        let errors = compiled.errors(&example.output);
        if !errors.is_empty() {
            return Err((index, errors.join("; ")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputRecord;
    use at_model::ModelError;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed(&'static str);

    #[async_trait]
    impl ModelClient for Fixed {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<ChatMessage, ModelError> {
            Ok(ChatMessage::assistant(self.0))
        }
    }

    fn canonicalizer(reply: &'static str) -> SchemaCanonicalizer {
        SchemaCanonicalizer::new(Arc::new(Fixed(reply)))
    }

    #[test]
    fn compiled_schema_reports_violations() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "required": ["phone_number"]
        }))
        .unwrap();
        assert!(schema.errors(&json!({"phone_number": "+1"})).is_empty());
        let errors = schema.errors(&json!({}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("phone_number"));
    }

    #[test]
    fn invalid_schema_does_not_compile() {
        assert!(CompiledSchema::compile(&json!({"type": 12})).is_err());
        assert!(CompiledSchema::compile(&json!("string")).is_err());
    }

    #[tokio::test]
    async fn description_yields_schema_and_transcript() {
        let out = canonicalizer("```json\n{\"type\": \"object\", \"required\": [\"a\"]}\n```")
            .canonicalize(SchemaSource::Description("an object with field a".into()))
            .await
            .unwrap();
        assert_eq!(out.schema, json!({"type": "object", "required": ["a"]}));
        assert_eq!(out.transcript.purpose, TranscriptPurpose::Schema);
        assert_eq!(out.transcript.messages.len(), 3);
    }

    #[tokio::test]
    async fn malformed_reply_is_parse_error() {
        let err = canonicalizer("sorry, no schema today")
            .canonicalize(SchemaSource::Description("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::Parse(_)));

        let err = canonicalizer("{\"type\": 5}")
            .canonicalize(SchemaSource::Description("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::Parse(_)));
    }

    #[tokio::test]
    async fn empty_examples_rejected_before_model_call() {
        let err = canonicalizer("{}")
            .canonicalize(SchemaSource::Examples(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidInput(_)));
    }

    #[test]
    fn check_examples_points_at_offender() {
        let schema = json!({"type": "object", "required": ["n"]});
        let ok = ExampleRecord::new(InputRecord::from_value(json!({"a": 1})).unwrap(), json!({"n": 1}));
        let bad = ExampleRecord::new(InputRecord::from_value(json!({"a": 2})).unwrap(), json!({}));
        assert!(check_examples(&schema, &[ok.clone()]).is_ok());
        let (index, _) = check_examples(&schema, &[ok, bad]).unwrap_err();
        assert_eq!(index, 1);
    }
}
