use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [session]
//                    share_key_length = 16
//
//   env var:         ROUTER_SESSION__SHARE_KEY_LENGTH=16   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Per-session tunables (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_share_key_length")]
    pub share_key_length: usize,
    #[serde(default = "default_sess_code_length")]
    pub sess_code_length: usize,
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    #[serde(default = "default_parked_event_limit")]
    pub parked_event_limit: usize,
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            share_key_length: default_share_key_length(),
            sess_code_length: default_sess_code_length(),
            client_buffer: default_client_buffer(),
            parked_event_limit: default_parked_event_limit(),
            min_password_length: default_min_password_length(),
        }
    }
}

/// How the caller's identity reaches the router (lives under `[auth]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// Request header carrying the authenticated user id, set by the fronting proxy.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_share_key_length() -> usize {
    12
}
fn default_sess_code_length() -> usize {
    24
}
fn default_client_buffer() -> usize {
    256
}
fn default_parked_event_limit() -> usize {
    crate::session::DEFAULT_PARKED_LIMIT
}
fn default_min_password_length() -> usize {
    8
}
fn default_user_header() -> String {
    "x-user-id".to_string()
}

/// Build a figment that layers: defaults → config.toml → ROUTER_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ROUTER_SERVER__PORT=9000`  →  `server.port = 9000`
///   `ROUTER_AUTH__USER_HEADER=x-remote-user`  →  `auth.user_header = "x-remote-user"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("ROUTER_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

/// Settings every session reads.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Length of generated share keys
    pub share_key_length: usize,
    /// Length of generated backend session codes
    pub sess_code_length: usize,
    /// Outbound frames queued per client before the connection is considered stalled
    pub client_buffer: usize,
    /// Client events held while no listener is attached
    pub parked_event_limit: usize,
    pub min_password_length: usize,
}

impl SessionConfig {
    pub fn from_file(fc: &SessionFileConfig) -> Self {
        Self {
            share_key_length: fc.share_key_length.max(1),
            sess_code_length: fc.sess_code_length.max(1),
            client_buffer: fc.client_buffer.max(1),
            parked_event_limit: fc.parked_event_limit,
            min_password_length: fc.min_password_length,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&SessionFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub user_header: String,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            user_header: fc.user_header.to_ascii_lowercase(),
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl RouterConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".session-router"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        let db_path = data_dir.join("router.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            logs_dir,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
