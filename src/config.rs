//! Daemon configuration.
//!
//! Precedence: CLI flag, then environment variable (both handled by clap),
//! then the TOML config file, then the built-in default.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::secrets::SecretsTls;

const CONFIG_DIR_NAME: &str = "ingressd";
const CONFIG_FILE_NAME: &str = "config.toml";

pub const DEFAULT_WEBHOOK_PORT: u16 = 14480;
pub const DEFAULT_SECRETS_ADDR: &str = "localhost:14460";

/// Fully resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub dev: bool,
    pub webhook_port: u16,
    /// Optional base address of a local OAuth server to pass callbacks
    /// through to.
    pub oauth_base_addr: Option<String>,
    pub secrets_addr: String,
    pub secrets_tls: SecretsTls,
}

/// Values that outrank the config file (CLI flags and environment
/// variables).
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub dev: bool,
    pub webhook_port: Option<u16>,
    pub oauth_base_addr: Option<String>,
    pub secrets_addr: Option<String>,
    pub secrets_server_ca_cert: Option<PathBuf>,
    pub secrets_client_cert: Option<PathBuf>,
    pub secrets_client_key: Option<PathBuf>,
}

/// On-disk configuration file schema. Every field is optional; the file may
/// even be empty, which is how it starts out.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub secrets: SecretsSection,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HttpSection {
    pub webhook_port: Option<u16>,
    pub oauth_base_addr: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SecretsSection {
    pub server_addr: Option<String>,
    pub server_ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl Config {
    pub fn resolve(overrides: Overrides, file: FileConfig) -> Self {
        Self {
            dev: overrides.dev,
            webhook_port: overrides
                .webhook_port
                .or(file.http.webhook_port)
                .unwrap_or(DEFAULT_WEBHOOK_PORT),
            oauth_base_addr: overrides.oauth_base_addr.or(file.http.oauth_base_addr),
            secrets_addr: overrides
                .secrets_addr
                .or(file.secrets.server_addr)
                .unwrap_or_else(|| DEFAULT_SECRETS_ADDR.to_string()),
            secrets_tls: SecretsTls {
                server_ca_cert: overrides
                    .secrets_server_ca_cert
                    .or(file.secrets.server_ca_cert),
                client_cert: overrides.secrets_client_cert.or(file.secrets.client_cert),
                client_key: overrides.secrets_client_key.or(file.secrets.client_key),
            },
        }
    }
}

/// Path to the app's configuration file, creating an empty file (and its
/// directory) on first run.
pub fn config_file() -> anyhow::Result<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var_os("HOME").context("HOME is not set")?;
            PathBuf::from(home).join(".config")
        }
    };

    let dir = base.join(CONFIG_DIR_NAME);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let path = dir.join(CONFIG_FILE_NAME);
    if !path.exists() {
        std::fs::write(&path, "")
            .with_context(|| format!("failed to create config file {}", path.display()))?;
    }
    Ok(path)
}

/// Loads and parses the config file; a missing file is the same as an empty
/// one.
pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}
