//! Code synthesizer
//!
//! Proposes a candidate `run_code` program from the schema, the labeled
//! examples and the batch inputs. The code conversation lives for the whole
//! job: each repair cycle appends the previous attempt's full failure report
//! to it. The synthesizer never touches the stored config.

use crate::error::SynthesisError;
use crate::prompts;
use crate::schema::CompiledSchema;
use crate::types::{Attempt, ExampleRecord, InputRecord, Transcript, TranscriptPurpose};
use at_model::{extract_fenced_block, parse_json_output, ChatMessage, ModelClient};
use serde_json::Value;
use std::sync::Arc;

/// A program proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub code: String,
}

/// Context every prompt is built from
#[derive(Debug, Clone, Copy)]
pub struct SynthesisContext<'a> {
    pub schema: &'a Value,
    pub examples: &'a [ExampleRecord],
    pub inputs: &'a [InputRecord],
    pub existing_code: Option<&'a str>,
}

impl SynthesisContext<'_> {
    fn task_message(&self) -> String {
        prompts::task_message(self.schema, self.examples, self.inputs, self.existing_code)
    }
}

/// Code conversation carried across the attempts of one job
#[derive(Debug, Clone, Default)]
pub struct CodeConversation {
    messages: Vec<ChatMessage>,
}

impl CodeConversation {
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn transcript(&self) -> Transcript {
        Transcript::new(TranscriptPurpose::Code, self.messages.clone())
    }
}

/// Generates candidate programs and schema revisions
#[derive(Clone)]
pub struct CodeSynthesizer {
    model: Arc<dyn ModelClient>,
}

impl CodeSynthesizer {
    #[must_use]
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    /// Open a code conversation; carries no failure context
    #[must_use]
    pub fn start(&self, ctx: &SynthesisContext<'_>) -> CodeConversation {
        CodeConversation {
            messages: vec![
                ChatMessage::system(prompts::code_system()),
                ChatMessage::user(ctx.task_message()),
            ],
        }
    }

    /// Ask for the next candidate
    ///
    /// With `previous`, its failure report is appended first. The model's
    /// reply stays in the conversation even when it carries no program, so
    /// the next repair can point at it.
    pub async fn propose(
        &self,
        conversation: &mut CodeConversation,
        previous: Option<&Attempt>,
    ) -> Result<Candidate, SynthesisError> {
        if let Some(previous) = previous {
            conversation
                .messages
                .push(ChatMessage::user(prompts::repair_message(previous)));
        }
        let reply = self.model.complete(&conversation.messages).await?;
        let code = extract_fenced_block(&reply.content, "python");
        conversation.messages.push(reply);

        match code {
            Some(code) if code.contains("def run_code") => {
                tracing::debug!("candidate program proposed ({} bytes)", code.len());
                Ok(Candidate { code })
            }
            Some(_) => Err(SynthesisError::NoProgram(
                "python block does not define run_code".into(),
            )),
            None => Err(SynthesisError::NoProgram("reply has no ```python block".into())),
        }
    }

    /// Ask for a revised schema after output-schema errors
    ///
    /// An unusable revision yields `None`; only transport failures error.
    pub async fn revise_schema(
        &self,
        ctx: &SynthesisContext<'_>,
        previous: &Attempt,
    ) -> Result<(Option<Value>, Transcript), SynthesisError> {
        let mut messages = vec![
            ChatMessage::system(prompts::schema_revision_system()),
            ChatMessage::user(format!(
                "{}\n{}",
                ctx.task_message(),
                prompts::repair_message(previous)
            )),
        ];
        let reply = match self.model.complete(&messages).await {
            Ok(reply) => reply,
            Err(e) if e.is_unparseable() => {
                tracing::warn!("schema revision reply unusable: {}", e);
                return Ok((None, Transcript::new(TranscriptPurpose::Schema, messages)));
            }
            Err(e) => return Err(e.into()),
        };
        let revised = parse_json_output(&reply.content)
            .ok()
            .filter(|schema| CompiledSchema::compile(schema).is_ok());
        messages.push(reply);
        if revised.is_none() {
            tracing::warn!("schema revision did not yield a valid JSON Schema");
        }
        Ok((revised, Transcript::new(TranscriptPurpose::Schema, messages)))
    }
}
