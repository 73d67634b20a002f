//! Configuration management for bitnet-lambda.
//!
//! Configuration is loaded from `$BITNET_LAMBDA_CONFIG` if set, otherwise from
//! `~/.config/bitnet-lambda/config.toml`. Every field has a default so the
//! function runs without any file present.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "BITNET_LAMBDA_CONFIG";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Inference server process settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Readiness probing settings.
    #[serde(default)]
    pub readiness: ReadinessConfig,
    /// Request forwarding settings.
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    /// Function sizing and naming.
    #[serde(default)]
    pub deployment: DeploymentConfig,
    /// Model hub download settings.
    #[serde(default)]
    pub download: DownloadConfig,
}

/// How the `llama-server` binary is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the llama-server executable.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Path to the GGUF weight file.
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    #[serde(default = "default_ctx_size")]
    pub ctx_size: u32,
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Server-side prediction limit (`-n`).
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,
    #[serde(default)]
    pub gpu_layers: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub continuous_batching: bool,
    /// Seconds to wait after SIGTERM before killing the process.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Extra environment for the child, used to pin the math libraries.
    #[serde(default = "default_server_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            model_path: default_model_path(),
            ctx_size: default_ctx_size(),
            threads: default_threads(),
            n_predict: default_n_predict(),
            gpu_layers: 0,
            temperature: default_temperature(),
            top_p: default_top_p(),
            host: default_host(),
            port: default_port(),
            continuous_batching: true,
            shutdown_grace_secs: default_shutdown_grace(),
            env: default_server_env(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_binary() -> PathBuf {
    PathBuf::from("/app/bin/llama-server")
}

fn default_model_path() -> PathBuf {
    PathBuf::from("/app/models/BitNet-b1.58-2B-4T/ggml-model-i2_s.gguf")
}

fn default_ctx_size() -> u32 {
    2048
}

fn default_threads() -> u32 {
    1
}

fn default_n_predict() -> i32 {
    4096
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_p() -> f32 {
    0.95
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_server_env() -> BTreeMap<String, String> {
    [
        ("OMP_NUM_THREADS", "1"),
        ("OMP_THREAD_LIMIT", "1"),
        ("OMP_DYNAMIC", "FALSE"),
        ("OMP_PROC_BIND", "FALSE"),
        ("OMP_PLACES", "threads"),
        ("OMP_WAIT_POLICY", "PASSIVE"),
        ("OMP_MAX_ACTIVE_LEVELS", "1"),
        ("OMP_NESTED", "FALSE"),
        ("OMP_MAX_TASK_PRIORITY", "0"),
        ("GOMP_CPU_AFFINITY", "0"),
        ("GOMP_STACKSIZE", "2M"),
        ("KMP_DUPLICATE_LIB_OK", "TRUE"),
        ("KMP_AFFINITY", "disabled"),
        ("KMP_TOPOLOGY_METHOD", "all"),
        ("MKL_NUM_THREADS", "1"),
        ("NUMEXPR_NUM_THREADS", "1"),
        ("OPENBLAS_NUM_THREADS", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Timing of the two-phase readiness probe, in seconds.
///
/// These were tuned against one BitNet build mapping a ~750MB model; slower
/// cold starts may need a larger `max_wait_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Total budget for both phases.
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    /// Portion of the budget spent polling `/health` before falling back.
    #[serde(default = "default_health_phase")]
    pub health_phase_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_completion_interval")]
    pub completion_interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,
    /// Body text the server returns while weights are still being mapped.
    #[serde(default = "default_loading_marker")]
    pub loading_marker: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: default_max_wait(),
            health_phase_secs: default_health_phase(),
            health_interval_secs: default_health_interval(),
            completion_interval_secs: default_completion_interval(),
            health_timeout_secs: default_health_timeout(),
            completion_timeout_secs: default_completion_timeout(),
            loading_marker: default_loading_marker(),
        }
    }
}

fn default_max_wait() -> u64 {
    300
}

fn default_health_phase() -> u64 {
    240
}

fn default_health_interval() -> u64 {
    5
}

fn default_completion_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    30
}

fn default_completion_timeout() -> u64 {
    60
}

fn default_loading_marker() -> String {
    "Loading model".to_string()
}

/// Settings for the per-request call to `/completion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Must stay below the function timeout to leave room for the response.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// `n_predict` used when the event does not carry one.
    #[serde(default = "default_request_n_predict")]
    pub default_n_predict: i32,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            default_n_predict: default_request_n_predict(),
        }
    }
}

impl ForwarderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout() -> u64 {
    720
}

fn default_request_n_predict() -> i32 {
    50
}

/// Function sizing and resource naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Prefix for every provisioned resource.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Distinguishes parallel deployments (dev, staging, prod).
    #[serde(default = "default_env_suffix")]
    pub env_suffix: String,
    #[serde(default = "default_memory_size")]
    pub memory_size_mb: u32,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default)]
    pub architecture: Architecture,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            env_suffix: default_env_suffix(),
            memory_size_mb: default_memory_size(),
            timeout_minutes: default_timeout_minutes(),
            architecture: Architecture::default(),
        }
    }
}

impl DeploymentConfig {
    pub fn function_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }
}

/// CPU architecture of the function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "ARM_64")]
    Arm64,
    #[serde(rename = "X86_64")]
    X86_64,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::X86_64 => write!(f, "x86_64"),
        }
    }
}

fn default_app_name() -> String {
    "bitnet-lambda".to_string()
}

fn default_env_suffix() -> String {
    "dev".to_string()
}

fn default_memory_size() -> u32 {
    2048
}

fn default_timeout_minutes() -> u64 {
    15
}

/// Where the model weights come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_repo_id")]
    pub repo_id: String,
    #[serde(default = "default_filename")]
    pub filename: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// Files smaller than this are treated as failed downloads.
    #[serde(default = "default_min_size")]
    pub min_size_bytes: u64,
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            repo_id: default_repo_id(),
            filename: default_filename(),
            revision: default_revision(),
            model_dir: default_model_dir(),
            min_size_bytes: default_min_size(),
            hub_url: default_hub_url(),
        }
    }
}

fn default_repo_id() -> String {
    "microsoft/bitnet-b1.58-2B-4T-gguf".to_string()
}

fn default_filename() -> String {
    "ggml-model-i2_s.gguf".to_string()
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("temp/models/BitNet-b1.58-2B-4T")
}

fn default_min_size() -> u64 {
    1_000_000
}

fn default_hub_url() -> String {
    "https://huggingface.co".to_string()
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("bitnet-lambda"))
            .context("Could not determine config directory")
    }

    /// Get the config file path, honoring `$BITNET_LAMBDA_CONFIG`.
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, using defaults if not found, then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Ok(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            // Function sandboxes often have no HOME; fall back to defaults.
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using the given lookup.
    ///
    /// `BITNET_*` names win over the bare names the function resource sets.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |primary: &str, fallback: Option<&str>| {
            lookup(primary).or_else(|| fallback.and_then(|name| lookup(name)))
        };

        if let Some(bin) = var("BITNET_SERVER_BIN", None) {
            self.server.binary = PathBuf::from(bin);
        }
        if let Some(model) = var("BITNET_MODEL_PATH", Some("MODEL_PATH")) {
            self.server.model_path = PathBuf::from(model);
        }
        if let Some(port) = var("BITNET_PORT", None) {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid port override: {}", port))?;
        }
        if let Some(threads) = var("BITNET_THREADS", Some("THREADS")) {
            self.server.threads = threads
                .parse()
                .with_context(|| format!("Invalid thread count override: {}", threads))?;
        }
        if let Some(ctx) = var("BITNET_CTX_SIZE", Some("CONTEXT_SIZE")) {
            self.server.ctx_size = ctx
                .parse()
                .with_context(|| format!("Invalid context size override: {}", ctx))?;
        }
        Ok(())
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.server.threads == 0 {
            return Err(anyhow!("server.threads must be at least 1"));
        }
        if self.readiness.health_phase_secs > self.readiness.max_wait_secs {
            return Err(anyhow!(
                "readiness.health_phase_secs ({}) exceeds readiness.max_wait_secs ({})",
                self.readiness.health_phase_secs,
                self.readiness.max_wait_secs
            ));
        }
        if self.forwarder.request_timeout() >= self.deployment.function_timeout() {
            return Err(anyhow!(
                "forwarder.request_timeout_secs ({}) must be below the function timeout ({} minutes)",
                self.forwarder.request_timeout_secs,
                self.deployment.timeout_minutes
            ));
        }
        Ok(())
    }
}
