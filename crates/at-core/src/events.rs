//! Append-only per-job event log with cursor subscriptions
//!
//! Every job status change and every stored attempt is appended to the job's
//! log. A subscriber first receives a snapshot folded from the log, then each
//! later entry in order, and the subscription ends once a settled status has
//! been delivered. Long-lived streams and polling (`events_since`) read the
//! same log.

use crate::types::{Attempt, JobId, ProcessingJob};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// One entry delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Full state at attach time
    Snapshot {
        job: ProcessingJob,
        attempts: Vec<Attempt>,
    },
    /// A newly stored attempt
    Attempt(Attempt),
    /// The job record after a change
    Status(ProcessingJob),
}

impl JobEvent {
    /// True once the job has left `running`
    #[must_use]
    pub fn is_settled(&self) -> bool {
        match self {
            Self::Snapshot { job, .. } | Self::Status(job) => job.status.is_settled(),
            Self::Attempt(_) => false,
        }
    }
}

#[derive(Debug, Default)]
struct JobStream {
    events: RwLock<Vec<JobEvent>>,
    notify: Notify,
}

/// Per-job event logs
#[derive(Debug, Default)]
pub struct EventLog {
    streams: RwLock<HashMap<JobId, Arc<JobStream>>>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, job_id: JobId) -> Arc<JobStream> {
        if let Some(stream) = self.streams.read().get(&job_id) {
            return Arc::clone(stream);
        }
        Arc::clone(self.streams.write().entry(job_id).or_default())
    }

    /// Append an entry; returns its position in the job's log
    pub fn publish(&self, job_id: JobId, event: JobEvent) -> usize {
        let stream = self.stream(job_id);
        let seq = {
            let mut events = stream.events.write();
            events.push(event);
            events.len() - 1
        };
        stream.notify.notify_waiters();
        seq
    }

    /// Entries at or after `cursor`
    #[must_use]
    pub fn events_since(&self, job_id: JobId, cursor: usize) -> Vec<JobEvent> {
        self.streams.read().get(&job_id).map_or_else(Vec::new, |stream| {
            stream.events.read().iter().skip(cursor).cloned().collect()
        })
    }

    /// Attach to a job's log; `None` when nothing was ever published for it
    #[must_use]
    pub fn subscribe(&self, job_id: JobId) -> Option<Subscription> {
        let stream = Arc::clone(self.streams.read().get(&job_id)?);
        let (snapshot, cursor) = {
            let events = stream.events.read();
            let mut job = None;
            let mut attempts = Vec::new();
            for event in events.iter() {
                match event {
                    JobEvent::Status(j) => job = Some(j.clone()),
                    JobEvent::Attempt(a) => attempts.push(a.clone()),
                    JobEvent::Snapshot { .. } => {}
                }
            }
            (JobEvent::Snapshot { job: job?, attempts }, events.len())
        };
        Some(Subscription {
            stream,
            cursor,
            snapshot: Some(snapshot),
            done: false,
        })
    }
}

/// Cursor over one job's log
#[derive(Debug)]
pub struct Subscription {
    stream: Arc<JobStream>,
    cursor: usize,
    snapshot: Option<JobEvent>,
    done: bool,
}

impl Subscription {
    /// Next event, waiting if none is buffered; `None` after a settled status
    pub async fn next(&mut self) -> Option<JobEvent> {
        if let Some(snapshot) = self.snapshot.take() {
            self.done = snapshot.is_settled();
            return Some(snapshot);
        }
        if self.done {
            return None;
        }
        loop {
            let notified = self.stream.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.stream.events.read().get(self.cursor).cloned();
            if let Some(event) = next {
                self.cursor += 1;
                self.done = event.is_settled();
                return Some(event);
            }
            notified.await;
        }
    }

    /// Position of the next unread log entry
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Drive the subscription as a stream
    pub fn into_stream(self) -> impl Stream<Item = JobEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}
