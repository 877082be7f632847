//! Validator: classify every record of a cycle
//!
//! Precedence per record is execution, then schema, then logic; a record
//! lands in at most one list. A logic check runs only once the output passed
//! the schema, against either a labeled output or, for spot-checked batch
//! records, an output the model generates for the same input. Exact equality
//! accepts at once; otherwise the model judges equivalence. Answers and
//! judgments are memoised so identical inputs always classify identically.

use crate::executor::RecordResult;
use crate::hash::ContentHash;
use crate::prompts;
use crate::schema::CompiledSchema;
use crate::types::{
    ExampleRecord, ExecutionError, InputRecord, LogicError, OutputSchemaError, Transcript,
    TranscriptPurpose,
};
use at_model::{parse_json_output, ChatMessage, ModelClient, ModelError};
use moka::future::Cache;
use serde_json::Value;
use std::sync::Arc;

const JUDGMENT_CACHE_CAPACITY: u64 = 10_000;

/// What a record's output is compared with once it passes the schema
#[derive(Debug, Clone, PartialEq)]
pub enum LogicCheck {
    /// Schema only
    Skip,
    /// The labeled output
    Expected(Value),
    /// The model's own output for the input
    Qa,
}

/// A memoised equivalence decision
#[derive(Debug, Clone)]
struct Judgment {
    equivalent: bool,
    transcript: Transcript,
}

/// A memoised model answer; `None` when it gave no usable output
#[derive(Debug, Clone)]
struct QaAnswer {
    output: Option<Value>,
    transcript: Transcript,
}

/// Classified outcome of one cycle
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Produced output per record, `None` where execution failed
    pub outputs: Vec<Option<Value>>,
    pub output_schema_errors: Vec<OutputSchemaError>,
    pub execution_errors: Vec<ExecutionError>,
    pub logic_errors: Vec<LogicError>,
    /// Positions whose output was compared with a model answer
    pub qa_checked: Vec<usize>,
    /// QA and judge conversations consulted this cycle
    pub qa_transcripts: Vec<Transcript>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.output_schema_errors.is_empty()
            && self.execution_errors.is_empty()
            && self.logic_errors.is_empty()
    }
}

/// Schema and logic checks with a model-backed equivalence judge
#[derive(Clone)]
pub struct Validator {
    model: Arc<dyn ModelClient>,
    judgments: Cache<ContentHash, Arc<Judgment>>,
    answers: Cache<ContentHash, Arc<QaAnswer>>,
}

impl Validator {
    #[must_use]
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            judgments: Cache::builder().max_capacity(JUDGMENT_CACHE_CAPACITY).build(),
            answers: Cache::builder().max_capacity(JUDGMENT_CACHE_CAPACITY).build(),
        }
    }

    /// Classify `results`, aligned with `records` and `checks`
    ///
    /// `examples` are shown to the model when it answers a QA check. Errors
    /// only when the model cannot be reached at all.
    pub async fn validate(
        &self,
        schema: &Value,
        compiled: &CompiledSchema,
        examples: &[ExampleRecord],
        records: &[InputRecord],
        checks: &[LogicCheck],
        results: Vec<RecordResult>,
    ) -> Result<ValidationReport, ModelError> {
        let mut report = ValidationReport::default();
        for (i, (record, result)) in records.iter().zip(results).enumerate() {
            let actual = match result {
                Err(message) => {
                    report.execution_errors.push(ExecutionError {
                        record: record.clone(),
                        message,
                    });
                    report.outputs.push(None);
                    continue;
                }
                Ok(actual) => actual,
            };
            report.outputs.push(Some(actual.clone()));

            let schema_errors = compiled.errors(&actual);
            if !schema_errors.is_empty() {
                report.output_schema_errors.push(OutputSchemaError {
                    record: record.clone(),
                    message: schema_errors.join("; "),
                });
                continue;
            }

            let want = match checks.get(i) {
                Some(LogicCheck::Expected(want)) => want.clone(),
                Some(LogicCheck::Qa) => {
                    let answer = self.answer(schema, compiled, examples, record).await?;
                    report.qa_transcripts.push(answer.transcript.clone());
                    let Some(want) = answer.output.clone() else {
                        continue;
                    };
                    report.qa_checked.push(i);
                    want
                }
                Some(LogicCheck::Skip) | None => continue,
            };
            if actual == want {
                continue;
            }
            let judgment = self.judge(schema, record, &actual, &want).await?;
            report.qa_transcripts.push(judgment.transcript.clone());
            if !judgment.equivalent {
                report.logic_errors.push(LogicError {
                    record: record.clone(),
                    actual,
                    expected: want,
                });
            }
        }
        Ok(report)
    }

    /// The model's output for `record`, kept only if it satisfies the schema
    async fn answer(
        &self,
        schema: &Value,
        compiled: &CompiledSchema,
        examples: &[ExampleRecord],
        record: &InputRecord,
    ) -> Result<Arc<QaAnswer>, ModelError> {
        let message = prompts::qa_message(schema, examples, record);
        let key = ContentHash::compute(message.as_bytes());
        self.answers
            .try_get_with(key, async {
                let mut messages = vec![
                    ChatMessage::system(prompts::QA_SYSTEM),
                    ChatMessage::user(message),
                ];
                let output = match self.model.complete(&messages).await {
                    Ok(reply) => {
                        let output = parse_json_output(&reply.content)
                            .ok()
                            .filter(|v| compiled.is_valid(v));
                        messages.push(reply);
                        output
                    }
                    Err(e) if e.is_unparseable() => None,
                    Err(e) => return Err(e),
                };
                if output.is_none() {
                    tracing::warn!("no usable QA answer for record {}; check skipped", record.record_id());
                }
                Ok(Arc::new(QaAnswer {
                    output,
                    transcript: Transcript::new(TranscriptPurpose::Qa, messages),
                }))
            })
            .await
            .map_err(|e: Arc<ModelError>| (*e).clone())
    }

    async fn judge(
        &self,
        schema: &Value,
        record: &InputRecord,
        actual: &Value,
        expected: &Value,
    ) -> Result<Arc<Judgment>, ModelError> {
        let input = record.to_value();
        let key = ContentHash::of_json_parts(&[schema, &input, actual, expected]);
        self.judgments
            .try_get_with(key, async {
                let mut messages = vec![
                    ChatMessage::system(prompts::JUDGE_SYSTEM),
                    ChatMessage::user(prompts::judge_message(schema, record, actual, expected)),
                ];
                let equivalent = match self.model.complete(&messages).await {
                    Ok(reply) => {
                        let verdict = parse_json_output(&reply.content)
                            .ok()
                            .and_then(|v| v.get("equivalent").and_then(Value::as_bool))
                            .unwrap_or(false);
                        messages.push(reply);
                        verdict
                    }
                    Err(e) if e.is_unparseable() => false,
                    Err(e) => return Err(e),
                };
                tracing::debug!("judged record {}: equivalent={}", record.record_id(), equivalent);
                Ok(Arc::new(Judgment {
                    equivalent,
                    transcript: Transcript::new(TranscriptPurpose::Qa, messages),
                }))
            })
            .await
            .map_err(|e: Arc<ModelError>| (*e).clone())
    }
}
