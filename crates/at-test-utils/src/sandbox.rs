//! Scripted sandbox double

use async_trait::async_trait;
use at_core::{RecordResult, Sandbox, SandboxError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Per-record behaviour of a scripted program
pub type Behaviour = Arc<dyn Fn(&Value) -> RecordResult + Send + Sync>;

/// Pauses a program's records until released
#[derive(Clone)]
pub struct Hold {
    entered: Arc<Notify>,
    release: watch::Sender<bool>,
}

impl Hold {
    /// Resolves once a record of the held program started running
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.send_replace(true);
    }
}

/// Runs programs produced by [`program`](crate::program) by tag lookup
#[derive(Default)]
pub struct ScriptedSandbox {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    holds: Mutex<HashMap<String, Hold>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(self, tag: &str, behaviour: impl Fn(&Value) -> RecordResult + Send + Sync + 'static) -> Self {
        self.behaviours.lock().insert(tag.to_string(), Arc::new(behaviour));
        self
    }

    /// Hold every record of `tag` until [`Hold::release`]
    pub fn hold(&self, tag: &str) -> Hold {
        let (release, _) = watch::channel(false);
        let hold = Hold {
            entered: Arc::new(Notify::new()),
            release,
        };
        self.holds.lock().insert(tag.to_string(), hold.clone());
        hold
    }

    /// Records run with the program tagged `tag`
    pub fn calls(&self, tag: &str) -> usize {
        self.calls.lock().get(tag).copied().unwrap_or(0)
    }

    fn tag_of(program: &str) -> Option<String> {
        program
            .lines()
            .find_map(|line| line.trim().strip_prefix("# tag: "))
            .map(str::to_string)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn run(
        &self,
        program: &str,
        records: &[Value],
        _timeout: Duration,
    ) -> Result<Vec<RecordResult>, SandboxError> {
        let tag = Self::tag_of(program)
            .ok_or_else(|| SandboxError::Protocol("program carries no tag".into()))?;
        let behaviour = self
            .behaviours
            .lock()
            .get(&tag)
            .cloned()
            .ok_or_else(|| SandboxError::Spawn(format!("no behaviour for program `{tag}`")))?;
        *self.calls.lock().entry(tag.clone()).or_default() += records.len();

        let hold = self.holds.lock().get(&tag).cloned();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            let mut released = hold.release.subscribe();
            let _ = released.wait_for(|open| *open).await;
        }
        Ok(records.iter().map(|record| behaviour(record)).collect())
    }
}
