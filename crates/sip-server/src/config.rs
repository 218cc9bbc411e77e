//! Server configuration: TOML file + CLI overrides.

use crate::session::BroadcasterConfig;
use crate::transport::ClientSettings;
use serde::Deserialize;
use sip_core::{SipError, SipResult, WindowSize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Location of the config file when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/sip/config.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub client: ClientSection,
}

impl ConfigFile {
    pub fn parse(content: &str) -> SipResult<Self> {
        toml::from_str(content).map_err(|e| SipError::Config(format!("config parse error: {e}")))
    }
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            debug: false,
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_rows")]
    pub rows: u32,
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    /// Seconds; 0 keeps headless sessions alive.
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            term: default_term(),
            scrollback_bytes: default_scrollback_bytes(),
            idle_timeout: 0,
            shutdown_grace: default_shutdown_grace(),
            work_dir: None,
        }
    }
}

/// `[client]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_client_timeout")]
    pub timeout: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            max_clients: default_max_clients(),
            ping_interval: default_ping_interval(),
            timeout: default_client_timeout(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_rows() -> u32 {
    24
}
fn default_cols() -> u32 {
    80
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_scrollback_bytes() -> usize {
    256 * 1024
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_queue_depth() -> usize {
    256
}
fn default_max_clients() -> usize {
    64
}
fn default_ping_interval() -> u64 {
    30
}
fn default_client_timeout() -> u64 {
    90
}

/// Values given on the command line. `None` leaves the file value in place.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub debug: bool,
    pub work_dir: Option<PathBuf>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    pub debug: bool,
    pub window_size: WindowSize,
    pub term: String,
    pub scrollback_bytes: usize,
    pub idle_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub work_dir: PathBuf,
    pub client_queue_depth: usize,
    pub max_clients: usize,
    pub ping_interval: Duration,
    pub client_timeout: Duration,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file at the default location means defaults; a missing file
    /// that was asked for explicitly is an error.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> SipResult<Self> {
        let explicit = config_path.is_some();
        let path = config_path
            .map(expand_tilde)
            .unwrap_or_else(|| expand_tilde_str(DEFAULT_CONFIG_PATH));

        let file = if path.exists() {
            info!(path = %path.display(), "loading config file");
            let content = std::fs::read_to_string(&path)
                .map_err(|e| SipError::Config(format!("cannot read {}: {e}", path.display())))?;
            ConfigFile::parse(&content)?
        } else if explicit {
            return Err(SipError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        } else {
            ConfigFile::default()
        };

        Self::resolve(file, cli)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> SipResult<Self> {
        let ConfigFile {
            server,
            session,
            client,
        } = file;

        if !server.ws_path.starts_with('/') {
            return Err(SipError::Config(format!(
                "server.ws_path must start with '/': {:?}",
                server.ws_path
            )));
        }
        let window_size = WindowSize::checked(session.rows, session.cols)
            .map_err(|e| SipError::Config(format!("session size: {e}")))?;
        if client.queue_depth == 0 {
            return Err(SipError::Config("client.queue_depth must be at least 1".into()));
        }
        if client.max_clients == 0 {
            return Err(SipError::Config("client.max_clients must be at least 1".into()));
        }
        if client.ping_interval == 0 || client.timeout == 0 {
            return Err(SipError::Config(
                "client.ping_interval and client.timeout must be positive".into(),
            ));
        }

        let work_dir = match cli.work_dir {
            Some(dir) => expand_tilde(&dir),
            None => match session.work_dir {
                Some(dir) => expand_tilde_str(&dir),
                None => std::env::current_dir()?,
            },
        };

        Ok(Self {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            ws_path: server.ws_path,
            debug: cli.debug || server.debug,
            window_size,
            term: session.term,
            scrollback_bytes: session.scrollback_bytes,
            idle_timeout: (session.idle_timeout > 0)
                .then(|| Duration::from_secs(session.idle_timeout)),
            shutdown_grace: Duration::from_secs(session.shutdown_grace),
            work_dir,
            client_queue_depth: client.queue_depth,
            max_clients: client.max_clients,
            ping_interval: Duration::from_secs(client.ping_interval),
            client_timeout: Duration::from_secs(client.timeout),
        })
    }

    pub fn broadcaster_config(&self) -> BroadcasterConfig {
        BroadcasterConfig {
            scrollback_bytes: self.scrollback_bytes,
            client_queue_depth: self.client_queue_depth,
            max_clients: self.max_clients,
            idle_timeout: self.idle_timeout,
            shutdown_grace: self.shutdown_grace,
            ..BroadcasterConfig::default()
        }
    }

    /// Address browsers connect to once the listener is bound.
    pub fn websocket_url(&self, addr: SocketAddr) -> String {
        format!("ws://{addr}{}", self.ws_path)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            ping_interval: self.ping_interval,
            timeout: self.client_timeout,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
