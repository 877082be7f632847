//! Executor adapter over the execution capability
//!
//! Every record runs as its own sandbox call so no state can leak between
//! records; a failure, timeout or short reply for one record only ever
//! becomes that record's execution error.

use crate::error::SandboxError;
use crate::types::InputRecord;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Per-record result: produced output or failure text
pub type RecordResult = Result<Value, String>;

/// Execution capability: program and records in, one result per record out
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(
        &self,
        program: &str,
        records: &[Value],
        timeout: Duration,
    ) -> Result<Vec<RecordResult>, SandboxError>;
}

#[async_trait]
impl<T: Sandbox + ?Sized> Sandbox for Arc<T> {
    async fn run(
        &self,
        program: &str,
        records: &[Value],
        timeout: Duration,
    ) -> Result<Vec<RecordResult>, SandboxError> {
        (**self).run(program, records, timeout).await
    }
}

/// Slack on top of the per-record timeout before the adapter gives up
const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Runs a candidate program over a batch with bounded concurrency
#[derive(Clone)]
pub struct ExecutorAdapter {
    sandbox: Arc<dyn Sandbox>,
    timeout: Duration,
    grace: Duration,
    concurrency: usize,
}

impl ExecutorAdapter {
    #[must_use]
    pub fn new(sandbox: Arc<dyn Sandbox>, timeout: Duration, concurrency: usize) -> Self {
        Self {
            sandbox,
            timeout,
            grace: DEFAULT_GRACE,
            concurrency: concurrency.max(1),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// One result per record, in input order
    pub async fn execute(&self, program: &str, records: &[InputRecord]) -> Vec<RecordResult> {
        let calls: Vec<_> = records.iter().map(|record| self.run_one(program, record)).collect();
        stream::iter(calls)
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn run_one(&self, program: &str, record: &InputRecord) -> RecordResult {
        let input = [record.to_value()];
        let call = self.sandbox.run(program, &input, self.timeout);
        match tokio::time::timeout(self.timeout + self.grace, call).await {
            Err(_) => Err(format!(
                "execution timed out after {}s",
                self.timeout.as_secs_f64()
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(results)) => results
                .into_iter()
                .next()
                .unwrap_or_else(|| Err("sandbox returned no result for record".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Echoes records; fails on `{"fail": ...}`, hangs on `{"hang": ...}`
    struct Echo;

    #[async_trait]
    impl Sandbox for Echo {
        async fn run(
            &self,
            _program: &str,
            records: &[Value],
            _timeout: Duration,
        ) -> Result<Vec<RecordResult>, SandboxError> {
            let record = &records[0];
            if record.get("hang").is_some() {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if record.get("crash").is_some() {
                return Err(SandboxError::Spawn("no interpreter".into()));
            }
            if record.get("empty").is_some() {
                return Ok(vec![]);
            }
            Ok(vec![match record.get("fail") {
                Some(msg) => Err(msg.to_string()),
                None => Ok(record.clone()),
            }])
        }
    }

    fn records(values: Vec<Value>) -> Vec<InputRecord> {
        values
            .into_iter()
            .map(|v| InputRecord::from_value(v).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_batch() {
        let adapter = ExecutorAdapter::new(Arc::new(Echo), Duration::from_secs(1), 4);
        let out = adapter
            .execute(
                "prog",
                &records(vec![
                    json!({"a": 1}),
                    json!({"fail": "boom"}),
                    json!({"crash": true}),
                    json!({"empty": true}),
                    json!({"a": 2}),
                ]),
            )
            .await;
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], Ok(json!({"a": 1})));
        assert!(out[1].as_ref().unwrap_err().contains("boom"));
        assert!(out[2].as_ref().unwrap_err().contains("no interpreter"));
        assert!(out[3].is_err());
        assert_eq!(out[4], Ok(json!({"a": 2})));
    }

    #[tokio::test]
    async fn hung_record_times_out() {
        let adapter = ExecutorAdapter::new(Arc::new(Echo), Duration::from_millis(100), 2)
            .with_grace(Duration::from_millis(10));
        let out = adapter
            .execute("prog", &records(vec![json!({"hang": true}), json!({"b": 1})]))
            .await;
        assert!(out[0].as_ref().unwrap_err().contains("timed out"));
        assert_eq!(out[1], Ok(json!({"b": 1})));
    }
}
