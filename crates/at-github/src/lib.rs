//! AutoTransform GitHub - version-control provider over the GitHub REST API
//!
//! Files are committed through the git data endpoints (tree with inline
//! content, commit, ref update) and read back with the raw media type.
//!
//! # Example
//!
//! ```rust,ignore
//! use at_github::GithubClient;
//!
//! let client = GithubClient::new("https://api.github.com", Some("ghp_..."))?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

use async_trait::async_trait;
use at_core::{ChangeRequest, ChangeRequestStatus, CommitRef, RepoRef, VcsError, VersionControl};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const JSON_MEDIA: &str = "application/vnd.github+json";
const RAW_MEDIA: &str = "application/vnd.github.raw+json";
const API_VERSION: &str = "2022-11-28";

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct GitCommit {
    sha: String,
    tree: GitObject,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Deserialize)]
struct PullRequest {
    number: u64,
    html_url: String,
    state: String,
    #[serde(default)]
    merged: bool,
}

/// Map a pull request's state onto the review vocabulary
fn pull_status(state: &str, merged: bool) -> ChangeRequestStatus {
    match (merged, state) {
        (true, _) => ChangeRequestStatus::Merged,
        (false, "closed") => ChangeRequestStatus::Closed,
        _ => ChangeRequestStatus::Open,
    }
}

fn transport(err: reqwest::Error) -> VcsError {
    VcsError::Transport(err.to_string())
}

/// GitHub provider
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
}

impl GithubClient {
    pub fn new(api_url: &str, token: Option<&str>) -> Result<Self, VcsError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("autotransform"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| VcsError::Config(format!("invalid token header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        } else {
            tracing::warn!("no GitHub token configured; only public reads will work");
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VcsError::Config(e.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn repo_url(&self, repo: &RepoRef, tail: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, repo.owner, repo.repo, tail)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).header(ACCEPT, JSON_MEDIA)
    }

    async fn check(response: Response) -> Result<Response, VcsError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(VcsError::NotFound(message));
        }
        Err(VcsError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, VcsError> {
        let response = builder.send().await.map_err(transport)?;
        Self::check(response).await?.json().await.map_err(transport)
    }

    async fn head_sha(&self, repo: &RepoRef, branch: &str) -> Result<String, VcsError> {
        let url = self.repo_url(repo, &format!("git/ref/heads/{branch}"));
        let head: GitRef = self.send(self.request(Method::GET, &url)).await?;
        Ok(head.object.sha)
    }
}

#[async_trait]
impl VersionControl for GithubClient {
    async fn create_branch(&self, repo: &RepoRef, branch: &str, from: &str) -> Result<(), VcsError> {
        let sha = self.head_sha(repo, from).await?;
        let url = self.repo_url(repo, "git/refs");
        let body = json!({"ref": format!("refs/heads/{branch}"), "sha": sha});
        match self.send::<Value>(self.request(Method::POST, &url).json(&body)).await {
            Ok(_) => Ok(()),
            Err(VcsError::Status { status: 422, message }) if message.contains("already exists") => {
                tracing::warn!("branch {} already exists", branch);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn commit_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<CommitRef, VcsError> {
        let parent = self.head_sha(repo, branch).await?;
        let url = self.repo_url(repo, &format!("git/commits/{parent}"));
        let base: GitCommit = self.send(self.request(Method::GET, &url)).await?;

        let url = self.repo_url(repo, "git/trees");
        let tree: GitObject = self
            .send(self.request(Method::POST, &url).json(&json!({
                "base_tree": base.tree.sha,
                "tree": [{"path": path, "mode": "100644", "type": "blob", "content": content}],
            })))
            .await?;

        let url = self.repo_url(repo, "git/commits");
        let commit: GitCommit = self
            .send(self.request(Method::POST, &url).json(&json!({
                "message": message,
                "tree": tree.sha,
                "parents": [parent],
            })))
            .await?;

        let url = self.repo_url(repo, &format!("git/refs/heads/{branch}"));
        self.send::<Value>(
            self.request(Method::PATCH, &url)
                .json(&json!({"sha": commit.sha, "force": false})),
        )
        .await?;

        tracing::debug!("committed {} to {} ({})", path, branch, commit.sha);
        let url = commit.html_url.unwrap_or_else(|| {
            format!("https://github.com/{}/{}/commit/{}", repo.owner, repo.repo, commit.sha)
        });
        Ok(CommitRef {
            sha: commit.sha,
            url,
        })
    }

    async fn open_change_request(
        &self,
        repo: &RepoRef,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<ChangeRequest, VcsError> {
        let url = self.repo_url(repo, "pulls");
        let pull: PullRequest = self
            .send(self.request(Method::POST, &url).json(&json!({
                "title": title,
                "body": body,
                "head": head,
                "base": base,
            })))
            .await?;
        Ok(ChangeRequest {
            number: pull.number,
            url: pull.html_url,
        })
    }

    async fn change_request_status(
        &self,
        repo: &RepoRef,
        number: u64,
    ) -> Result<ChangeRequestStatus, VcsError> {
        let url = self.repo_url(repo, &format!("pulls/{number}"));
        let pull: PullRequest = self.send(self.request(Method::GET, &url)).await?;
        Ok(pull_status(&pull.state, pull.merged))
    }

    async fn merge_change_request(&self, repo: &RepoRef, number: u64) -> Result<(), VcsError> {
        let url = self.repo_url(repo, &format!("pulls/{number}/merge"));
        self.send::<Value>(self.request(Method::PUT, &url).json(&json!({})))
            .await?;
        tracing::info!("merged pull request #{}", number);
        Ok(())
    }

    async fn read_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, VcsError> {
        let url = self.repo_url(repo, &format!("contents/{path}"));
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, RAW_MEDIA)
            .query(&[("ref", branch)])
            .send()
            .await
            .map_err(transport)?;
        match Self::check(response).await {
            Ok(response) => Ok(Some(response.text().await.map_err(transport)?)),
            Err(VcsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn repo() -> RepoRef {
        RepoRef {
            owner: "acme".into(),
            repo: "transforms".into(),
        }
    }

    #[test]
    fn urls_are_rooted_at_api() {
        let client = GithubClient::new("https://ghe.example.com/api/v3/", Some("t")).unwrap();
        assert_eq!(
            client.repo_url(&repo(), "pulls/7"),
            "https://ghe.example.com/api/v3/repos/acme/transforms/pulls/7"
        );
    }

    #[test]
    fn pull_state_mapping() {
        assert_eq!(pull_status("closed", true), ChangeRequestStatus::Merged);
        assert_eq!(pull_status("closed", false), ChangeRequestStatus::Closed);
        assert_eq!(pull_status("open", false), ChangeRequestStatus::Open);
    }

    #[test]
    fn pull_payload_decodes() {
        let pull: PullRequest = serde_json::from_value(json!({
            "number": 12,
            "html_url": "https://github.com/acme/transforms/pull/12",
            "state": "open",
            "title": "ignored"
        }))
        .unwrap();
        assert_eq!(pull.number, 12);
        assert!(!pull.merged);
    }

    #[test]
    fn rejects_unprintable_token() {
        let err = GithubClient::new("https://api.github.com", Some("bad\ntoken")).unwrap_err();
        assert!(matches!(err, VcsError::Config(_)));
    }
}
