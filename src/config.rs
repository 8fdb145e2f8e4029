//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::sandbox::routing::Route;
use crate::{AppError, Result};

/// Keychain service name used for stored credentials.
const KEYRING_SERVICE: &str = "pml-mediator";

/// Remote authority connectivity.
///
/// When `url` is absent the mediator runs in standalone mode: no session is
/// registered, server-routed calls fail, and traces are logged and discarded.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CloudConfig {
    /// Base URL of the remote authority (e.g. `https://pml.example.com`).
    #[serde(default)]
    pub url: Option<String>,
    /// API key attached to every remote call (populated at runtime).
    #[serde(skip)]
    pub api_key: Option<String>,
}

/// Out-of-process worker launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Worker binary (e.g. `deno`, `node`).
    pub command: String,
    /// Arguments passed to the worker binary.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Timeout values for the bridge, executor, and HTTP clients.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Per-call RPC timeout in milliseconds.
    #[serde(default = "default_rpc_ms")]
    pub rpc_ms: u64,
    /// Handshake (`init`) timeout in milliseconds.
    #[serde(default = "default_init_ms")]
    pub init_ms: u64,
    /// Whole-execution timeout in seconds.
    #[serde(default = "default_execution_seconds")]
    pub execution_seconds: u64,
    /// Bound on any single HTTP request to the remote authority.
    #[serde(default = "default_http_seconds")]
    pub http_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rpc_ms: default_rpc_ms(),
            init_ms: default_init_ms(),
            execution_seconds: default_execution_seconds(),
            http_seconds: default_http_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Per-call RPC timeout.
    #[must_use]
    pub fn rpc(&self) -> Duration {
        Duration::from_millis(self.rpc_ms)
    }

    /// Handshake timeout.
    #[must_use]
    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    /// Whole-execution timeout.
    #[must_use]
    pub fn execution(&self) -> Duration {
        Duration::from_secs(self.execution_seconds)
    }

    /// HTTP request timeout.
    #[must_use]
    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_seconds)
    }
}

fn default_rpc_ms() -> u64 {
    30_000
}

fn default_init_ms() -> u64 {
    5_000
}

fn default_execution_seconds() -> u64 {
    300
}

fn default_http_seconds() -> u64 {
    10
}

/// Trace sync batching and retry settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Traces per POST.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Failed attempts tolerated per trace before it is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

/// Hybrid routing policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RoutingConfig {
    /// Route used for namespaces not listed below.
    #[serde(default = "default_route")]
    pub default_route: Route,
    /// Namespaces served by the caller-supplied local handler.
    #[serde(default = "default_client_namespaces")]
    pub client_namespaces: Vec<String>,
    /// Namespaces always forwarded to the remote endpoint.
    #[serde(default)]
    pub server_namespaces: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_route: default_route(),
            client_namespaces: default_client_namespaces(),
            server_namespaces: Vec::new(),
        }
    }
}

fn default_route() -> Route {
    Route::Server
}

fn default_client_namespaces() -> Vec<String> {
    ["fs", "shell", "git", "process", "env"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Pending workflow retention.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowConfig {
    /// Seconds a paused execution waits for approval before it is forgotten.
    #[serde(default = "default_workflow_ttl")]
    pub ttl_seconds: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_workflow_ttl(),
        }
    }
}

fn default_workflow_ttl() -> u64 {
    300
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Workspace root; the durable client identity lives beneath it.
    pub workspace_root: PathBuf,
    /// Remote authority settings.
    #[serde(default)]
    pub cloud: CloudConfig,
    /// Worker process settings.
    pub worker: WorkerConfig,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Trace sync configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Routing policy.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Pending workflow retention.
    #[serde(default)]
    pub workflows: WorkflowConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the API key from OS keychain with env-var fallback.
    ///
    /// A missing key is not an error here: server-routed calls report a
    /// missing credential when they are attempted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task panics.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.cloud.api_key = load_credential("api_key", "PML_API_KEY").await?;
        if self.cloud.url.is_some() && self.cloud.api_key.is_none() {
            warn!("cloud url configured but no api key found; server-routed calls will fail");
        }
        Ok(())
    }

    /// Whether a remote authority is configured.
    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.cloud.url.is_none()
    }

    /// Directory for persisted local state (client identity).
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.workspace_root.join(".pml")
    }

    fn validate(&mut self) -> Result<()> {
        if self.worker.command.trim().is_empty() {
            return Err(AppError::Config("worker.command must not be empty".into()));
        }

        if self.sync.batch_size == 0 {
            return Err(AppError::Config(
                "sync.batch_size must be greater than zero".into(),
            ));
        }

        if self.timeouts.rpc_ms == 0 || self.timeouts.init_ms == 0 {
            return Err(AppError::Config(
                "timeouts.rpc_ms and timeouts.init_ms must be greater than zero".into(),
            ));
        }

        if let Some(url) = self.cloud.url.as_mut() {
            let trimmed = url.trim_end_matches('/').to_owned();
            if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
                return Err(AppError::Config(format!(
                    "cloud.url must be an http(s) url, got '{trimmed}'"
                )));
            }
            *url = trimmed;
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            tracing::debug!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    Ok(env::var(env_key).ok().filter(|value| !value.is_empty()))
}
