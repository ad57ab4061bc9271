//! Bridge configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/pl/vzconn-bridge.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `cloud.stream_url`
//! - `cloud.enroll_url`
//! - `auth.deploy_key_file`
//! - `auth.jwt_signing_key_file`
//! - `orchestrator.job_template_path`
//! - `orchestrator.cluster_name`
//!
//! # Secret file format
//! Raw secret string on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub schema_version: u32,
    pub bootstrap_mode: bool,
    pub bootstrap_version: String,
    /// The deploy key (read from its file, not the file path).
    pub deploy_key: String,
    /// The JWT signing key shared with the cloud control plane.
    pub jwt_signing_key: String,
    pub cloud: CloudConfig,
    pub bus: BusConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub stream_url: String,
    pub enroll_url: String,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub nats_url: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub namespace: String,
    /// The cluster's human-readable name, as the operator who deployed this
    /// bridge knows it. There is no in-cluster API that reports this — unlike
    /// the cluster UID and version, which the orchestrator discovers itself
    /// — so it must come from config.
    pub cluster_name: String,
    pub identity_configmap: String,
    pub job_template_path: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    bootstrap_mode: Option<bool>,
    bootstrap_version: Option<String>,
    cloud: Option<RawCloudConfig>,
    auth: Option<RawAuthConfig>,
    bus: Option<RawBusConfig>,
    orchestrator: Option<RawOrchestratorConfig>,
}

#[derive(Debug, Deserialize)]
struct RawCloudConfig {
    stream_url: Option<String>,
    enroll_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    deploy_key_file: Option<String>,
    jwt_signing_key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBusConfig {
    nats_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOrchestratorConfig {
    namespace: Option<String>,
    cluster_name: Option<String>,
    identity_configmap: Option<String>,
    job_template_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load bridge config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load bridge config from the default path `/etc/pl/vzconn-bridge.toml`.
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/pl/vzconn-bridge.toml"))
}

/// Load bridge config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<BridgeConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let raw_cloud = raw
        .cloud
        .ok_or_else(|| ConfigError::MissingField("cloud".to_owned()))?;
    let stream_url = raw_cloud
        .stream_url
        .ok_or_else(|| ConfigError::MissingField("cloud.stream_url".to_owned()))?;
    let enroll_url = raw_cloud
        .enroll_url
        .ok_or_else(|| ConfigError::MissingField("cloud.enroll_url".to_owned()))?;

    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let deploy_key_file = raw_auth
        .deploy_key_file
        .ok_or_else(|| ConfigError::MissingField("auth.deploy_key_file".to_owned()))?;
    let jwt_signing_key_file = raw_auth
        .jwt_signing_key_file
        .ok_or_else(|| ConfigError::MissingField("auth.jwt_signing_key_file".to_owned()))?;
    let deploy_key = read_secret_file(&deploy_key_file)?;
    let jwt_signing_key = read_secret_file(&jwt_signing_key_file)?;

    let bus = match raw.bus {
        Some(b) => BusConfig {
            nats_url: b
                .nats_url
                .unwrap_or_else(|| "nats://localhost:4222".to_owned()),
        },
        None => BusConfig {
            nats_url: "nats://localhost:4222".to_owned(),
        },
    };

    let raw_orchestrator = raw
        .orchestrator
        .ok_or_else(|| ConfigError::MissingField("orchestrator".to_owned()))?;
    let job_template_path = raw_orchestrator
        .job_template_path
        .ok_or_else(|| ConfigError::MissingField("orchestrator.job_template_path".to_owned()))?;
    let cluster_name = raw_orchestrator
        .cluster_name
        .ok_or_else(|| ConfigError::MissingField("orchestrator.cluster_name".to_owned()))?;
    let orchestrator = OrchestratorConfig {
        namespace: raw_orchestrator
            .namespace
            .unwrap_or_else(|| "pl".to_owned()),
        cluster_name,
        identity_configmap: raw_orchestrator
            .identity_configmap
            .unwrap_or_else(|| "pl-cloud-connector-identity".to_owned()),
        job_template_path,
    };

    Ok(BridgeConfig {
        schema_version,
        bootstrap_mode: raw.bootstrap_mode.unwrap_or(false),
        bootstrap_version: raw.bootstrap_version.unwrap_or_default(),
        deploy_key,
        jwt_signing_key,
        cloud: CloudConfig {
            stream_url,
            enroll_url,
        },
        bus,
        orchestrator,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Secret file reader
// ---------------------------------------------------------------------------

fn read_secret_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading secret file '{}': {}", path, e)))?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "secret file '{}' is empty",
            path
        )));
    }
    Ok(trimmed.to_owned())
}
