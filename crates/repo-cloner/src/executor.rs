// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::CloneError;
use crate::message::CloneRequest;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The opaque "clone a remote repository into a local path" capability.
#[async_trait]
pub trait CloneCapability: Send + Sync {
    async fn clone_repo(&self, remote_url: &str, local_path: &Path) -> Result<(), CloneError>;
}

/// Result of one clone attempt.
///
/// Either the clone succeeded, or it failed with a non-empty error detail;
/// never both and never neither.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneOutcome {
    path: PathBuf,
    duration: Duration,
    error: Option<String>,
}

impl CloneOutcome {
    pub fn success(path: PathBuf, duration: Duration) -> Self {
        Self {
            path,
            duration,
            error: None,
        }
    }

    pub fn failure(path: PathBuf, duration: Duration, detail: impl Into<String>) -> Self {
        let mut detail = detail.into();
        if detail.trim().is_empty() {
            detail = "clone failed without an error message".to_string();
        }
        Self {
            path,
            duration,
            error: Some(detail),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Local path the clone targeted.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

/// Runs clone requests against a base location and times them.
pub struct CloneExecutor {
    base_location: PathBuf,
    capability: Arc<dyn CloneCapability>,
    timeout: Option<Duration>,
}

impl CloneExecutor {
    pub fn new(base_location: impl Into<PathBuf>, capability: Arc<dyn CloneCapability>) -> Self {
        Self {
            base_location: base_location.into(),
            capability,
            timeout: None,
        }
    }

    /// Bound each clone. On expiry the attempt is reported as failed; the
    /// underlying clone may still be running and its destination must not be
    /// reused.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resolve_destination(&self, request: &CloneRequest) -> PathBuf {
        self.base_location.join(&request.destination)
    }

    /// Clone `request.url` into `<base>/<request.destination>`.
    ///
    /// Never fails: errors, panics and timeouts in the capability all become
    /// a failed outcome.
    pub async fn execute(&self, request: &CloneRequest) -> CloneOutcome {
        let path = self.resolve_destination(request);
        info!("cloning {} into {}", request.url, path.display());

        let capability = Arc::clone(&self.capability);
        let url = request.url.clone();
        let target = path.clone();
        let started = Instant::now();
        let mut task =
            tokio::spawn(async move { capability.clone_repo(&url, &target).await });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(j) => j,
                Err(_) => {
                    task.abort();
                    let elapsed = started.elapsed();
                    warn!(
                        "clone of {} timed out after {}s",
                        request.url,
                        limit.as_secs_f64()
                    );
                    return CloneOutcome::failure(
                        path,
                        elapsed,
                        format!("clone timed out after {}s", limit.as_secs_f64()),
                    );
                }
            },
            None => (&mut task).await,
        };
        let elapsed = started.elapsed();

        match joined {
            Ok(Ok(())) => CloneOutcome::success(path, elapsed),
            Ok(Err(e)) => CloneOutcome::failure(path, elapsed, e.to_string()),
            Err(e) => CloneOutcome::failure(path, elapsed, format!("clone task failed: {}", e)),
        }
    }
}

/// libgit2-backed clone capability.
#[derive(Clone, Default)]
pub struct GitCloner {
    credentials: Option<(String, String)>,
}

impl GitCloner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `GIT_USERNAME` / `GIT_PASSWORD` when both are set.
    pub fn from_env() -> Self {
        match (std::env::var("GIT_USERNAME"), std::env::var("GIT_PASSWORD")) {
            (Ok(user), Ok(pass)) => Self::new().with_credentials(user, pass),
            _ => Self::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

#[async_trait]
impl CloneCapability for GitCloner {
    async fn clone_repo(&self, remote_url: &str, local_path: &Path) -> Result<(), CloneError> {
        let url = remote_url.to_string();
        let path = local_path.to_path_buf();
        let credentials = self.credentials.clone();
        tokio::task::spawn_blocking(move || clone_blocking(&url, &path, credentials))
            .await
            .map_err(|e| CloneError::new(format!("clone task failed: {}", e)))?
    }
}

fn clone_blocking(
    url: &str,
    path: &Path,
    credentials: Option<(String, String)>,
) -> Result<(), CloneError> {
    let existed = path.exists();
    if existed && !dir_is_empty(path)? {
        return Err(CloneError::new(format!(
            "destination {} already exists and is not empty",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            CloneError::new(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    let mut callbacks = git2::RemoteCallbacks::new();
    if let Some((user, pass)) = credentials {
        // libgit2 re-invokes the callback after a rejection; offer once.
        let mut offered = false;
        callbacks.credentials(move |_url, _username_from_url, _allowed| {
            if offered {
                return Err(git2::Error::from_str("credentials rejected"));
            }
            offered = true;
            git2::Cred::userpass_plaintext(&user, &pass)
        });
    }
    let mut fo = git2::FetchOptions::new();
    fo.remote_callbacks(callbacks);
    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fo);

    match builder.clone(url, path) {
        Ok(_) => {
            debug!("cloned {} into {}", url, path.display());
            Ok(())
        }
        Err(e) => {
            if !existed && path.exists() {
                if let Err(rm) = fs::remove_dir_all(path) {
                    warn!(
                        "failed to clean up partial clone at {}: {}",
                        path.display(),
                        rm
                    );
                }
            }
            Err(e.into())
        }
    }
}

fn dir_is_empty(path: &Path) -> Result<bool, CloneError> {
    if !path.is_dir() {
        return Ok(false);
    }
    let mut entries = fs::read_dir(path)
        .map_err(|e| CloneError::new(format!("failed to read {}: {}", path.display(), e)))?;
    Ok(entries.next().is_none())
}
