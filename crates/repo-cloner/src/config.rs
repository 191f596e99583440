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

use crate::error::ConnectionError;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which clone attempts produce a persisted record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordPolicy {
    /// Only successful clones are recorded.
    #[default]
    Successes,
    /// Failed attempts are recorded too, with their error detail.
    All,
}

impl FromStr for RecordPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "successes" | "success" => Ok(Self::Successes),
            "all" => Ok(Self::All),
            other => Err(anyhow!(
                "unknown record policy '{}' (expected successes or all)",
                other
            )),
        }
    }
}

/// What happens to a message whose clone succeeded but whose record could
/// not be written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceFailurePolicy {
    /// Log and acknowledge; the record is lost but the clone is kept.
    #[default]
    Ack,
    /// Put the message back on the queue so it is cloned again.
    Requeue,
}

impl FromStr for PersistenceFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ack" => Ok(Self::Ack),
            "requeue" => Ok(Self::Requeue),
            other => Err(anyhow!(
                "unknown persistence failure policy '{}' (expected ack or requeue)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClonerConfig {
    pub repo_base_location: PathBuf,
    pub queue_name: String,
    pub broker_host: Option<String>,
    pub broker_user: Option<String>,
    pub broker_pass: Option<String>,
    /// Lease TTL on the in-flight processing list; must exceed the longest clone.
    pub processing_ttl: Duration,
    /// How long one blocking receive waits before the loop ticks again.
    pub broker_wait: Duration,
    pub db_name: String,
    pub db_host: Option<String>,
    pub db_user: Option<String>,
    pub db_pass: Option<String>,
    pub db_namespace: String,
    pub clone_timeout: Option<Duration>,
    pub record_policy: RecordPolicy,
    pub on_persist_failure: PersistenceFailurePolicy,
    pub metrics_port: Option<u16>,
    /// Consecutive failed reconnects tolerated by the binary; 0 = unlimited.
    pub max_reconnect_attempts: u32,
}

impl Default for ClonerConfig {
    fn default() -> Self {
        Self {
            repo_base_location: PathBuf::from("./"),
            queue_name: "clone_jobs".into(),
            broker_host: None,
            broker_user: None,
            broker_pass: None,
            processing_ttl: Duration::from_secs(600),
            broker_wait: Duration::from_secs(5),
            db_name: "clones".into(),
            db_host: None,
            db_user: None,
            db_pass: None,
            db_namespace: "repo_cloner".into(),
            clone_timeout: None,
            record_policy: RecordPolicy::Successes,
            on_persist_failure: PersistenceFailurePolicy::Ack,
            metrics_port: None,
            max_reconnect_attempts: 0,
        }
    }
}

impl ClonerConfig {
    /// Build the Redis URL for the broker.
    ///
    /// `MESSAGE_BROKER_HOST` may be a bare host, `host:port`, or a full
    /// `redis://` URL. Credentials are injected only when the URL carries none.
    pub fn broker_url(&self) -> Result<String, ConnectionError> {
        let host = self
            .broker_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or("127.0.0.1");
        let normalized = if host.contains("://") {
            host.to_string()
        } else {
            format!("redis://{}", host)
        };
        let mut url = url::Url::parse(&normalized)
            .map_err(|e| ConnectionError::InvalidAddress(format!("{}: {}", host, e)))?;
        if url.port().is_none() {
            url.set_port(Some(6379))
                .map_err(|_| ConnectionError::InvalidAddress(host.to_string()))?;
        }
        if url.username().is_empty() && url.password().is_none() {
            if let Some(user) = self.broker_user.as_deref() {
                url.set_username(user)
                    .map_err(|_| ConnectionError::InvalidAddress(host.to_string()))?;
            }
            if let Some(pass) = self.broker_pass.as_deref() {
                url.set_password(Some(pass))
                    .map_err(|_| ConnectionError::InvalidAddress(host.to_string()))?;
            }
        }
        let s = url.to_string();
        if url.path() == "/" {
            return Ok(s.trim_end_matches('/').to_string());
        }
        Ok(s)
    }
}

/// CLI-level options that the binary passes to `load_config`.
#[derive(Clone, Debug, Default)]
pub struct MergeOpts {
    pub config_path: Option<PathBuf>,
    pub cli_repo_base_location: Option<PathBuf>,
    pub cli_queue_name: Option<String>,
    pub cli_metrics_port: Option<u16>,
    pub cli_clone_timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    repo_base_location: Option<PathBuf>,
    queue_name: Option<String>,
    broker_host: Option<String>,
    broker_user: Option<String>,
    broker_pass: Option<String>,
    processing_ttl_seconds: Option<u64>,
    broker_wait_seconds: Option<u64>,
    db_name: Option<String>,
    db_host: Option<String>,
    db_user: Option<String>,
    db_pass: Option<String>,
    db_namespace: Option<String>,
    clone_timeout_seconds: Option<u64>,
    record_policy: Option<RecordPolicy>,
    on_persist_failure: Option<PersistenceFailurePolicy>,
    metrics_port: Option<u16>,
    max_reconnect_attempts: Option<u32>,
}

/// Load and merge configuration from: defaults <- config file <- env vars <- CLI
pub fn load_config(mut base: ClonerConfig, opts: MergeOpts) -> Result<ClonerConfig> {
    if let Some(path) = opts.config_path.as_ref() {
        if path.exists() {
            let s = fs::read_to_string(path)
                .with_context(|| format!("read config file {}", path.display()))?;
            let file: FileConfig = toml::from_str(&s)
                .with_context(|| format!("parse config file {}", path.display()))?;
            apply_file(&mut base, file);
        }
    }

    apply_env(&mut base)?;

    // CLI overrides everything
    if let Some(p) = opts.cli_repo_base_location {
        base.repo_base_location = p;
    }
    if let Some(q) = opts.cli_queue_name {
        base.queue_name = q;
    }
    if let Some(port) = opts.cli_metrics_port {
        base.metrics_port = Some(port);
    }
    if let Some(t) = opts.cli_clone_timeout_seconds {
        base.clone_timeout = timeout_from_secs(t);
    }

    if base.queue_name.trim().is_empty() {
        return Err(anyhow!("queue name must not be empty"));
    }
    if base.processing_ttl <= base.broker_wait {
        return Err(anyhow!(
            "processing TTL ({}s) must exceed the broker wait ({}s)",
            base.processing_ttl.as_secs(),
            base.broker_wait.as_secs()
        ));
    }
    Ok(base)
}

fn apply_file(base: &mut ClonerConfig, file: FileConfig) {
    if let Some(v) = file.repo_base_location {
        base.repo_base_location = v;
    }
    if let Some(v) = file.queue_name {
        base.queue_name = v;
    }
    if file.broker_host.is_some() {
        base.broker_host = file.broker_host;
    }
    if file.broker_user.is_some() {
        base.broker_user = file.broker_user;
    }
    if file.broker_pass.is_some() {
        base.broker_pass = file.broker_pass;
    }
    if let Some(v) = file.processing_ttl_seconds {
        base.processing_ttl = Duration::from_secs(v);
    }
    if let Some(v) = file.broker_wait_seconds {
        base.broker_wait = Duration::from_secs(v);
    }
    if let Some(v) = file.db_name {
        base.db_name = v;
    }
    if file.db_host.is_some() {
        base.db_host = file.db_host;
    }
    if file.db_user.is_some() {
        base.db_user = file.db_user;
    }
    if file.db_pass.is_some() {
        base.db_pass = file.db_pass;
    }
    if let Some(v) = file.db_namespace {
        base.db_namespace = v;
    }
    if let Some(v) = file.clone_timeout_seconds {
        base.clone_timeout = timeout_from_secs(v);
    }
    if let Some(v) = file.record_policy {
        base.record_policy = v;
    }
    if let Some(v) = file.on_persist_failure {
        base.on_persist_failure = v;
    }
    if file.metrics_port.is_some() {
        base.metrics_port = file.metrics_port;
    }
    if let Some(v) = file.max_reconnect_attempts {
        base.max_reconnect_attempts = v;
    }
}

fn apply_env(base: &mut ClonerConfig) -> Result<()> {
    if let Some(v) = env_str("REPO_BASE_LOCATION") {
        base.repo_base_location = PathBuf::from(v);
    }
    if let Some(v) = env_str("QUEUE_NAME") {
        base.queue_name = v;
    }
    if let Some(v) = env_str("MESSAGE_BROKER_HOST") {
        base.broker_host = Some(v);
    }
    if let Some(v) = env_str("MESSAGE_BROKER_USER") {
        base.broker_user = Some(v);
    }
    if let Some(v) = env_str("MESSAGE_BROKER_PASS") {
        base.broker_pass = Some(v);
    }
    if let Some(v) = env_parse::<u64>("PROCESSING_TTL_SECONDS")? {
        base.processing_ttl = Duration::from_secs(v);
    }
    if let Some(v) = env_parse::<u64>("BROKER_WAIT_SECONDS")? {
        base.broker_wait = Duration::from_secs(v);
    }
    if let Some(v) = env_str("DB_NAME") {
        base.db_name = v;
    }
    if let Some(v) = env_str("DB_HOST") {
        base.db_host = Some(v);
    }
    if let Some(v) = env_str("DB_USER") {
        base.db_user = Some(v);
    }
    if let Some(v) = env_str("DB_PASS") {
        base.db_pass = Some(v);
    }
    if let Some(v) = env_str("DB_NAMESPACE") {
        base.db_namespace = v;
    }
    if let Some(v) = env_parse::<u64>("CLONE_TIMEOUT_SECONDS")? {
        base.clone_timeout = timeout_from_secs(v);
    }
    if let Some(v) = env_parse::<RecordPolicy>("CLONE_RECORD_POLICY")? {
        base.record_policy = v;
    }
    if let Some(v) = env_parse::<PersistenceFailurePolicy>("ON_PERSIST_FAILURE")? {
        base.on_persist_failure = v;
    }
    if let Some(v) = env_parse::<u16>("METRICS_PORT")? {
        base.metrics_port = Some(v);
    }
    if let Some(v) = env_parse::<u32>("MAX_RECONNECT_ATTEMPTS")? {
        base.max_reconnect_attempts = v;
    }
    Ok(())
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_str(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid {}='{}': {}", key, raw, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_KEYS: &[&str] = &[
        "REPO_BASE_LOCATION",
        "QUEUE_NAME",
        "MESSAGE_BROKER_HOST",
        "MESSAGE_BROKER_USER",
        "MESSAGE_BROKER_PASS",
        "PROCESSING_TTL_SECONDS",
        "BROKER_WAIT_SECONDS",
        "DB_NAME",
        "DB_HOST",
        "DB_USER",
        "DB_PASS",
        "DB_NAMESPACE",
        "CLONE_TIMEOUT_SECONDS",
        "CLONE_RECORD_POLICY",
        "ON_PERSIST_FAILURE",
        "METRICS_PORT",
        "MAX_RECONNECT_ATTEMPTS",
    ];

    fn clear_env() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    #[serial_test::serial]
    fn defaults_without_file_or_env() {
        clear_env();
        let cfg = load_config(ClonerConfig::default(), MergeOpts::default()).unwrap();
        assert_eq!(cfg.repo_base_location, PathBuf::from("./"));
        assert_eq!(cfg.queue_name, "clone_jobs");
        assert_eq!(cfg.record_policy, RecordPolicy::Successes);
        assert_eq!(cfg.on_persist_failure, PersistenceFailurePolicy::Ack);
        assert!(cfg.clone_timeout.is_none());
    }

    #[test]
    #[serial_test::serial]
    fn merge_file_env_cli_precedence() {
        clear_env();
        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        let toml = r#"
repo_base_location = "/from_file"
queue_name = "file_queue"
db_name = "file_db"
clone_timeout_seconds = 30
record_policy = "all"
"#;
        fs::write(tmp.path(), toml).unwrap();

        std::env::set_var("QUEUE_NAME", "env_queue");
        std::env::set_var("ON_PERSIST_FAILURE", "requeue");

        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            cli_repo_base_location: Some(PathBuf::from("/from_cli")),
            ..Default::default()
        };
        let cfg = load_config(ClonerConfig::default(), opts).unwrap();
        clear_env();

        assert_eq!(cfg.repo_base_location, PathBuf::from("/from_cli"));
        assert_eq!(cfg.queue_name, "env_queue");
        assert_eq!(cfg.db_name, "file_db");
        assert_eq!(cfg.clone_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.record_policy, RecordPolicy::All);
        assert_eq!(cfg.on_persist_failure, PersistenceFailurePolicy::Requeue);
    }

    #[test]
    #[serial_test::serial]
    fn invalid_env_value_is_an_error() {
        clear_env();
        std::env::set_var("PROCESSING_TTL_SECONDS", "ten");
        let err = load_config(ClonerConfig::default(), MergeOpts::default()).unwrap_err();
        clear_env();
        assert!(err.to_string().contains("PROCESSING_TTL_SECONDS"));
    }

    #[test]
    #[serial_test::serial]
    fn unknown_file_key_is_an_error() {
        clear_env();
        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        fs::write(tmp.path(), "queue = \"typo\"\n").unwrap();
        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        assert!(load_config(ClonerConfig::default(), opts).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn zero_timeout_disables_deadline() {
        clear_env();
        std::env::set_var("CLONE_TIMEOUT_SECONDS", "0");
        let cfg = load_config(ClonerConfig::default(), MergeOpts::default()).unwrap();
        clear_env();
        assert!(cfg.clone_timeout.is_none());
    }

    #[test]
    fn broker_url_variants() {
        let mut cfg = ClonerConfig::default();
        assert_eq!(cfg.broker_url().unwrap(), "redis://127.0.0.1:6379");

        cfg.broker_host = Some("queue.internal".into());
        cfg.broker_user = Some("u".into());
        cfg.broker_pass = Some("p".into());
        assert_eq!(cfg.broker_url().unwrap(), "redis://u:p@queue.internal:6379");

        cfg.broker_host = Some("queue.internal:7000".into());
        assert_eq!(cfg.broker_url().unwrap(), "redis://u:p@queue.internal:7000");

        // credentials already present in the URL win
        cfg.broker_host = Some("redis://a:b@host:6380/2".into());
        assert_eq!(cfg.broker_url().unwrap(), "redis://a:b@host:6380/2");

        cfg.broker_host = Some("redis://host:6380".into());
        cfg.broker_user = None;
        cfg.broker_pass = Some("z".into());
        assert_eq!(cfg.broker_url().unwrap(), "redis://:z@host:6380");
    }

    #[test]
    fn policies_parse_case_insensitively() {
        assert_eq!("ALL".parse::<RecordPolicy>().unwrap(), RecordPolicy::All);
        assert_eq!(
            "Requeue".parse::<PersistenceFailurePolicy>().unwrap(),
            PersistenceFailurePolicy::Requeue
        );
        assert!("sometimes".parse::<RecordPolicy>().is_err());
    }
}
