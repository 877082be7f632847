//! Stored input/output batches
//!
//! Each job's records are kept as JSON lines under
//! `{root}/{config_id}/{job_id}/{input|output}.jsonl`. Export streams a batch
//! back one line at a time; previews read the head of a batch and are cached.

use crate::error::RecordStoreError;
use crate::types::{ConfigId, JobId};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const PREVIEW_CACHE_CAPACITY: u64 = 1000;
const PREVIEW_TTL: Duration = Duration::from_secs(300);
const PREVIEW_MAX_RECORDS: usize = 100;

/// Which side of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            other => Err(format!("direction must be `input` or `output`, got `{other}`")),
        }
    }
}

/// Record persistence and export contract
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Replace the stored batch
    async fn save(
        &self,
        config_id: ConfigId,
        job_id: JobId,
        direction: Direction,
        records: &[Value],
    ) -> Result<(), RecordStoreError>;

    /// Stream the batch as JSON lines, one record per item
    async fn export(
        &self,
        config_id: ConfigId,
        job_id: JobId,
        direction: Direction,
    ) -> Result<BoxStream<'static, Result<String, RecordStoreError>>, RecordStoreError>;

    /// First `limit` records of the batch
    async fn preview(
        &self,
        config_id: ConfigId,
        job_id: JobId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Value>, RecordStoreError>;
}

type PreviewKey = (ConfigId, JobId, Direction);

/// Head of a batch; `complete` when the whole batch fit
#[derive(Debug)]
struct PreviewHead {
    records: Vec<Value>,
    complete: bool,
}

/// Filesystem record store
#[derive(Debug, Clone)]
pub struct LocalRecordStore {
    root: PathBuf,
    previews: Cache<PreviewKey, Arc<PreviewHead>>,
}

impl LocalRecordStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let previews = Cache::builder()
            .max_capacity(PREVIEW_CACHE_CAPACITY)
            .time_to_live(PREVIEW_TTL)
            .build();
        Self {
            root: root.into(),
            previews,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of one stored batch
    #[must_use]
    pub fn batch_path(&self, config_id: ConfigId, job_id: JobId, direction: Direction) -> PathBuf {
        self.root
            .join(config_id.to_string())
            .join(job_id.to_string())
            .join(format!("{}.jsonl", direction.as_str()))
    }

    async fn open_lines(
        path: &Path,
    ) -> Result<tokio::io::Lines<BufReader<tokio::fs::File>>, RecordStoreError> {
        let file = tokio::fs::File::open(path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RecordStoreError::NotFound(path.to_path_buf())
            } else {
                RecordStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Ok(BufReader::new(file).lines())
    }

    async fn read_head(path: &Path, limit: usize) -> Result<Vec<Value>, RecordStoreError> {
        let mut lines = Self::open_lines(path).await?;
        let mut out = Vec::new();
        while out.len() < limit {
            let line = lines.next_line().await.map_err(|source| RecordStoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            match line {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => out.push(serde_json::from_str(&line)?),
                None => break,
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for LocalRecordStore {
    #[tracing::instrument(skip(self, records), fields(count = records.len()), err)]
    async fn save(
        &self,
        config_id: ConfigId,
        job_id: JobId,
        direction: Direction,
        records: &[Value],
    ) -> Result<(), RecordStoreError> {
        let path = self.batch_path(config_id, job_id, direction);
        let io_err = |source: std::io::Error| RecordStoreError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }
        let mut file = tokio::fs::File::create(&path).await.map_err(io_err)?;
        file.write_all(body.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        self.previews.invalidate(&(config_id, job_id, direction)).await;
        Ok(())
    }

    async fn export(
        &self,
        config_id: ConfigId,
        job_id: JobId,
        direction: Direction,
    ) -> Result<BoxStream<'static, Result<String, RecordStoreError>>, RecordStoreError> {
        let path = self.batch_path(config_id, job_id, direction);
        let lines = Self::open_lines(&path).await?;
        let stream = stream::try_unfold((lines, path), |(mut lines, path)| async move {
            loop {
                let line = lines.next_line().await.map_err(|source| RecordStoreError::Io {
                    path: path.clone(),
                    source,
                })?;
                match line {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => return Ok(Some((line, (lines, path)))),
                    None => return Ok(None),
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn preview(
        &self,
        config_id: ConfigId,
        job_id: JobId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Value>, RecordStoreError> {
        let key = (config_id, job_id, direction);
        if let Some(head) = self.previews.get(&key).await {
            if head.complete || limit <= head.records.len() {
                return Ok(head.records.iter().take(limit).cloned().collect());
            }
        }
        let path = self.batch_path(config_id, job_id, direction);
        let wanted = limit.max(PREVIEW_MAX_RECORDS);
        let records = Self::read_head(&path, wanted).await?;
        let head = PreviewHead {
            complete: records.len() < wanted,
            records,
        };
        let out = head.records.iter().take(limit).cloned().collect();
        self.previews.insert(key, Arc::new(head)).await;
        Ok(out)
    }
}
