//! Scripted model double

use async_trait::async_trait;
use at_core::{prompts, RecordResult};
use at_model::{ChatMessage, ModelClient, ModelError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Program text whose behaviour [`ScriptedSandbox`](crate::ScriptedSandbox) looks up by `tag`
pub fn program(tag: &str) -> String {
    format!("def run_code(input: dict) -> dict:\n    # tag: {tag}\n    return input\n")
}

/// A model reply carrying [`program`]
pub fn program_reply(tag: &str) -> String {
    format!("Here is the program.\n```python\n{}```\n", program(tag))
}

/// How the double answers QA prompts, given the prompt's INPUT record
pub type QaAnswer = fn(&Value) -> RecordResult;

/// Answers by conversation kind: code replies come from a queue (the last
/// one repeats once it runs dry), judge and schema replies are fixed, and QA
/// answers come from a behaviour function (none set means an unusable reply).
pub struct ScriptedModel {
    code_replies: Mutex<VecDeque<Result<String, ModelError>>>,
    last_code_reply: Mutex<Option<Result<String, ModelError>>>,
    judge_equivalent: Mutex<bool>,
    schema_reply: Mutex<Option<String>>,
    qa_answer: Mutex<Option<QaAnswer>>,
    code_prompts: Mutex<Vec<Vec<ChatMessage>>>,
    code_calls: AtomicUsize,
    judge_calls: AtomicUsize,
    schema_calls: AtomicUsize,
    qa_calls: AtomicUsize,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            code_replies: Mutex::new(VecDeque::new()),
            last_code_reply: Mutex::new(None),
            judge_equivalent: Mutex::new(false),
            schema_reply: Mutex::new(None),
            qa_answer: Mutex::new(None),
            code_prompts: Mutex::new(Vec::new()),
            code_calls: AtomicUsize::new(0),
            judge_calls: AtomicUsize::new(0),
            schema_calls: AtomicUsize::new(0),
            qa_calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedModel {
    /// Replies with the programs tagged `tags`, in order
    pub fn with_programs(tags: &[&str]) -> Self {
        let model = Self::default();
        for tag in tags {
            model.push_code_reply(Ok(program_reply(tag)));
        }
        model
    }

    pub fn push_code_reply(&self, reply: Result<String, ModelError>) {
        self.code_replies.lock().push_back(reply);
    }

    pub fn set_judge_equivalent(&self, equivalent: bool) {
        *self.judge_equivalent.lock() = equivalent;
    }

    pub fn set_schema_reply(&self, schema: &Value) {
        *self.schema_reply.lock() = Some(format!("```json\n{schema}\n```"));
    }

    /// Answer QA prompts with `answer` applied to the INPUT record
    pub fn set_qa_answer(&self, answer: QaAnswer) {
        *self.qa_answer.lock() = Some(answer);
    }

    /// Every message list sent for code synthesis
    pub fn code_prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.code_prompts.lock().clone()
    }

    pub fn code_calls(&self) -> usize {
        self.code_calls.load(Ordering::SeqCst)
    }

    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    pub fn qa_calls(&self) -> usize {
        self.qa_calls.load(Ordering::SeqCst)
    }

    fn qa_reply(&self, messages: &[ChatMessage]) -> String {
        let input = messages
            .last()
            .and_then(|m| m.content.lines().last())
            .and_then(|line| line.strip_prefix("INPUT: "))
            .and_then(|json| serde_json::from_str::<Value>(json).ok());
        let answer = *self.qa_answer.lock();
        match (answer, input) {
            (Some(answer), Some(input)) => match answer(&input) {
                Ok(output) => output.to_string(),
                Err(_) => "I cannot tell what this record should become.".into(),
            },
            _ => "I cannot tell what this record should become.".into(),
        }
    }

    fn next_code_reply(&self) -> Result<String, ModelError> {
        let next = self.code_replies.lock().pop_front();
        let mut last = self.last_code_reply.lock();
        match next {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(ModelError::Unparseable("no scripted reply".into()))),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage, ModelError> {
        let system = messages.first().map(|m| m.content.as_str()).unwrap_or_default();
        if system == prompts::JUDGE_SYSTEM {
            self.judge_calls.fetch_add(1, Ordering::SeqCst);
            let equivalent = *self.judge_equivalent.lock();
            return Ok(ChatMessage::assistant(format!(
                "{{\"equivalent\": {equivalent}, \"reason\": \"scripted\"}}"
            )));
        }
        if system == prompts::QA_SYSTEM {
            self.qa_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(ChatMessage::assistant(self.qa_reply(messages)));
        }
        if system == prompts::SCHEMA_FROM_DESCRIPTION_SYSTEM
            || system == prompts::SCHEMA_FROM_EXAMPLES_SYSTEM
            || system == prompts::schema_revision_system()
        {
            self.schema_calls.fetch_add(1, Ordering::SeqCst);
            return self
                .schema_reply
                .lock()
                .clone()
                .map(ChatMessage::assistant)
                .ok_or_else(|| ModelError::Unparseable("no scripted schema".into()));
        }

        self.code_calls.fetch_add(1, Ordering::SeqCst);
        self.code_prompts.lock().push(messages.to_vec());
        self.next_code_reply().map(ChatMessage::assistant)
    }
}
