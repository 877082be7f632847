//! Version-control capability
//!
//! One trait, one implementation per hosting provider. The provider is picked
//! once at startup from [`VcsProvider`]; nothing downstream inspects which
//! implementation it holds.

use crate::error::VcsError;
use crate::types::{ChangeRequest, RepoRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A commit created by `commit_file`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    pub url: String,
}

/// State of a change request on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestStatus {
    Open,
    Merged,
    Closed,
}

/// Operations the review gate needs from a hosting provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create `branch` from the head of `from`; an existing branch is not an error
    async fn create_branch(&self, repo: &RepoRef, branch: &str, from: &str) -> Result<(), VcsError>;

    /// Create or overwrite one file on `branch`
    async fn commit_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<CommitRef, VcsError>;

    async fn open_change_request(
        &self,
        repo: &RepoRef,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<ChangeRequest, VcsError>;

    async fn change_request_status(
        &self,
        repo: &RepoRef,
        number: u64,
    ) -> Result<ChangeRequestStatus, VcsError>;

    async fn merge_change_request(&self, repo: &RepoRef, number: u64) -> Result<(), VcsError>;

    /// File contents on `branch`, `None` when absent
    async fn read_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, VcsError>;
}

/// Which provider backs the review gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsProvider {
    /// Review gate disabled deployment-wide
    #[default]
    None,
    Github,
}

impl fmt::Display for VcsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Github => "github",
        })
    }
}

impl FromStr for VcsProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "github" => Ok(Self::Github),
            other => Err(format!("unknown version-control provider `{other}`")),
        }
    }
}
