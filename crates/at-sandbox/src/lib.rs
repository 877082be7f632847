//! AutoTransform Sandbox - runs candidate programs in a Python subprocess
//!
//! Each call starts a fresh interpreter, so no state survives between
//! calls. The harness reads `{"program", "records"}` from stdin, defines the
//! program once, calls `run_code` per record and writes one JSON line per
//! record: `{"ok": output}` or `{"error": message}`. Anything the program
//! itself prints goes to stderr so it cannot corrupt those lines.
//!
//! # Example
//!
//! ```rust,ignore
//! use at_core::Sandbox;
//! use at_sandbox::PythonSandbox;
//!
//! let sandbox = PythonSandbox::new("python3");
//! let results = sandbox.run(code, &records, Duration::from_secs(10)).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

use async_trait::async_trait;
use at_core::{RecordResult, Sandbox, SandboxError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const HARNESS: &str = r#"
import contextlib, json, sys
out = sys.stdout
def emit(line):
    out.write(json.dumps(line) + "\n")
    out.flush()
payload = json.load(sys.stdin)
scope = {}
try:
    with contextlib.redirect_stdout(sys.stderr):
        exec(payload["program"], scope, scope)
    run_code = scope["run_code"]
except Exception as e:
    for _ in payload["records"]:
        emit({"error": f"{type(e).__name__}: {e}"})
    sys.exit(0)
for record in payload["records"]:
    try:
        with contextlib.redirect_stdout(sys.stderr):
            result = run_code(record)
        emit({"ok": result})
    except Exception as e:
        emit({"error": f"{type(e).__name__}: {e}"})
"#;

#[derive(Deserialize)]
#[serde(untagged)]
enum Line {
    Ok { ok: Value },
    Error { error: String },
}

/// Subprocess execution capability
#[derive(Debug, Clone)]
pub struct PythonSandbox {
    interpreter: String,
}

impl PythonSandbox {
    #[must_use]
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    fn parse_output(stdout: &[u8], expected: usize) -> Result<Vec<RecordResult>, SandboxError> {
        let text = String::from_utf8_lossy(stdout);
        let mut results = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| match serde_json::from_str::<Line>(line) {
                Ok(Line::Ok { ok }) => Ok(ok),
                Ok(Line::Error { error }) => Err(error),
                Err(e) => Err(format!("unreadable sandbox output: {e}")),
            })
            .collect::<Vec<_>>();
        if results.len() > expected {
            return Err(SandboxError::Protocol(format!(
                "expected {expected} results, got {}",
                results.len()
            )));
        }
        // Records the interpreter never reached (it died midway)
        results.resize_with(expected, || Err("interpreter exited before producing a result".into()));
        Ok(results)
    }
}

impl Default for PythonSandbox {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl Sandbox for PythonSandbox {
    async fn run(
        &self,
        program: &str,
        records: &[Value],
        timeout: Duration,
    ) -> Result<Vec<RecordResult>, SandboxError> {
        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {e}", self.interpreter)))?;

        let payload = json!({"program": program, "records": records}).to_string();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Io("stdin not captured".into()))?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| SandboxError::Io(e.to_string()))?;
        drop(stdin);

        let budget = timeout * u32::try_from(records.len().max(1)).unwrap_or(u32::MAX);
        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| SandboxError::Io(e.to_string()))?,
            Err(_) => {
                tracing::warn!("sandbox exceeded {:?}; interpreter killed", budget);
                return Err(SandboxError::Timeout(budget));
            }
        };
        if !output.status.success() {
            tracing::debug!(
                "interpreter exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Self::parse_output(&output.stdout, records.len())
    }
}
