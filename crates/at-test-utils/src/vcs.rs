//! In-memory version-control host

use async_trait::async_trait;
use at_core::{ChangeRequest, ChangeRequestStatus, CommitRef, RepoRef, VcsError, VersionControl};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// A change request as the host sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedRequest {
    pub number: u64,
    pub repo: RepoRef,
    pub head: String,
    pub base: String,
    pub title: String,
    pub status: ChangeRequestStatus,
}

#[derive(Default)]
struct HostState {
    branches: HashMap<String, BTreeMap<String, String>>,
    requests: Vec<HostedRequest>,
    commits: u64,
}

fn branch_key(repo: &RepoRef, branch: &str) -> String {
    format!("{}/{}@{}", repo.owner, repo.repo, branch)
}

/// Branches, files and change requests held in memory
#[derive(Default)]
pub struct InMemoryVcs {
    state: Mutex<HostState>,
}

impl InMemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<HostedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    pub fn file(&self, repo: &RepoRef, branch: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .branches
            .get(&branch_key(repo, branch))
            .and_then(|files| files.get(path).cloned())
    }

    /// Edit a file directly on a branch, bypassing review
    pub fn put_file(&self, repo: &RepoRef, branch: &str, path: &str, content: &str) {
        self.state
            .lock()
            .branches
            .entry(branch_key(repo, branch))
            .or_default()
            .insert(path.to_string(), content.to_string());
    }

    /// Merge as a reviewer would, outside the service
    pub fn approve(&self, number: u64) {
        let mut state = self.state.lock();
        Self::merge_locked(&mut state, number);
    }

    /// Close without merging
    pub fn reject(&self, number: u64) {
        let mut state = self.state.lock();
        if let Some(request) = state.requests.iter_mut().find(|r| r.number == number) {
            request.status = ChangeRequestStatus::Closed;
        }
    }

    fn merge_locked(state: &mut HostState, number: u64) -> bool {
        let Some(request) = state.requests.iter_mut().find(|r| r.number == number) else {
            return false;
        };
        request.status = ChangeRequestStatus::Merged;
        let head = branch_key(&request.repo, &request.head);
        let base = branch_key(&request.repo, &request.base);
        let files = state.branches.get(&head).cloned().unwrap_or_default();
        state.branches.entry(base).or_default().extend(files);
        true
    }
}

#[async_trait]
impl VersionControl for InMemoryVcs {
    async fn create_branch(&self, repo: &RepoRef, branch: &str, from: &str) -> Result<(), VcsError> {
        let mut state = self.state.lock();
        let files = state
            .branches
            .get(&branch_key(repo, from))
            .cloned()
            .unwrap_or_default();
        state.branches.entry(branch_key(repo, branch)).or_insert(files);
        Ok(())
    }

    async fn commit_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<CommitRef, VcsError> {
        let mut state = self.state.lock();
        state
            .branches
            .entry(branch_key(repo, branch))
            .or_default()
            .insert(path.to_string(), content.to_string());
        state.commits += 1;
        let sha = format!("{:040x}", state.commits);
        Ok(CommitRef {
            url: format!("https://vcs.test/{}/{}/commit/{}", repo.owner, repo.repo, sha),
            sha,
        })
    }

    async fn open_change_request(
        &self,
        repo: &RepoRef,
        head: &str,
        base: &str,
        title: &str,
        _body: &str,
    ) -> Result<ChangeRequest, VcsError> {
        let mut state = self.state.lock();
        let number = state.requests.len() as u64 + 1;
        state.requests.push(HostedRequest {
            number,
            repo: repo.clone(),
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            status: ChangeRequestStatus::Open,
        });
        Ok(ChangeRequest {
            number,
            url: format!("https://vcs.test/{}/{}/pull/{}", repo.owner, repo.repo, number),
        })
    }

    async fn change_request_status(
        &self,
        _repo: &RepoRef,
        number: u64,
    ) -> Result<ChangeRequestStatus, VcsError> {
        self.state
            .lock()
            .requests
            .iter()
            .find(|r| r.number == number)
            .map(|r| r.status)
            .ok_or_else(|| VcsError::NotFound(format!("change request #{number}")))
    }

    async fn merge_change_request(&self, _repo: &RepoRef, number: u64) -> Result<(), VcsError> {
        let mut state = self.state.lock();
        if Self::merge_locked(&mut state, number) {
            Ok(())
        } else {
            Err(VcsError::NotFound(format!("change request #{number}")))
        }
    }

    async fn read_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, VcsError> {
        Ok(self.file(repo, branch, path))
    }
}
