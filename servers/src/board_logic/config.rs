use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_board::connections::StoreTimings;
use lib_board::core::BoardSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Board server: HTTP and WebSocket front over a PostgreSQL store", version)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[clap(long, env = "BOARD_CONFIG", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    #[clap(long, env = "BOARD_HOST", help = "Address to listen on.")]
    pub host: Option<String>,

    #[clap(long, env = "BOARD_PORT", help = "Port to listen on.")]
    pub port: Option<u16>,

    #[clap(long, env = "BOARD_TLS_CERT", help = "Path to the TLS certificate chain (PEM).")]
    pub tls_cert: Option<PathBuf>,

    #[clap(long, env = "BOARD_TLS_KEY", help = "Path to the TLS private key (PEM).")]
    pub tls_key: Option<PathBuf>,

    #[clap(long, env = "BOARD_DATABASE_URL", help = "PostgreSQL connection URL.")]
    pub database_url: Option<String>,

    #[clap(long, env = "BOARD_CONNECT_TIMEOUT_SECS", help = "Store connect timeout; also the retry interval.")]
    pub connect_timeout_secs: Option<u64>,

    #[clap(long, env = "BOARD_KEEPALIVE_INTERVAL_SECS", help = "Seconds between store keepalive probes.")]
    pub keepalive_interval_secs: Option<u64>,

    #[clap(long, env = "BOARD_KEEPALIVE_TIMEOUT_SECS", help = "Seconds a keepalive probe may take.")]
    pub keepalive_timeout_secs: Option<u64>,

    #[clap(long, env = "BOARD_MAX_MESSAGE_LENGTH", help = "Largest accepted frame payload in bytes.")]
    pub max_message_length: Option<usize>,

    #[clap(long, env = "BOARD_SESSION_COOKIE_NAME", help = "Cookie carrying the session token.")]
    pub session_cookie_name: Option<String>,

    #[clap(long, env = "BOARD_RESOURCE_DIR", help = "Root directory for served resources.")]
    pub resource_dir: Option<PathBuf>,

    #[clap(long, env = "BOARD_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "BOARD_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "BOARD_LOG_RETENTION", help = "Number of log files to keep.")]
    pub log_retention: Option<usize>,

    #[clap(long, env = "BOARD_PID_FILE", help = "Write the process id to this file.")]
    pub pid_file: Option<PathBuf>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config: other.config.or(self.config),
            host: other.host.or(self.host),
            port: other.port.or(self.port),
            tls_cert: other.tls_cert.or(self.tls_cert),
            tls_key: other.tls_key.or(self.tls_key),
            database_url: other.database_url.or(self.database_url),
            connect_timeout_secs: other.connect_timeout_secs.or(self.connect_timeout_secs),
            keepalive_interval_secs: other.keepalive_interval_secs.or(self.keepalive_interval_secs),
            keepalive_timeout_secs: other.keepalive_timeout_secs.or(self.keepalive_timeout_secs),
            max_message_length: other.max_message_length.or(self.max_message_length),
            session_cookie_name: other.session_cookie_name.or(self.session_cookie_name),
            resource_dir: other.resource_dir.or(self.resource_dir),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_retention: other.log_retention.or(self.log_retention),
            pid_file: other.pid_file.or(self.pid_file),
        }
    }

    fn defaults() -> Config {
        Config {
            host: Some("0.0.0.0".to_string()),
            port: Some(443),
            connect_timeout_secs: Some(5),
            keepalive_interval_secs: Some(60),
            keepalive_timeout_secs: Some(30),
            max_message_length: Some(65_535),
            session_cookie_name: Some("LOGIN_SESSION_KEY".to_string()),
            resource_dir: Some(PathBuf::from(".")),
            log_dir: Some(PathBuf::from("logs")),
            log_level: Some("info".to_string()),
            log_retention: Some(7),
            ..Default::default()
        }
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub database_url: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub max_message_length: usize,
    pub session_cookie_name: String,
    pub resource_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub log_retention: usize,
    pub pid_file: Option<PathBuf>,
}

impl Settings {
    pub fn listen_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    /// Certificate and key, when both are configured and present on disk.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert, key)),
            _ => None,
        }
    }

    pub fn board_settings(&self) -> BoardSettings {
        BoardSettings {
            session_cookie_name: self.session_cookie_name.clone(),
            max_message_length: self.max_message_length,
        }
    }

    pub fn store_timings(&self) -> StoreTimings {
        StoreTimings {
            connect_timeout: self.connect_timeout,
            keepalive_timeout: self.keepalive_timeout,
        }
    }
}

/// Defaults, then the JSON file named by `--config`, then CLI flags and
/// `BOARD_*` environment variables.
pub fn load_config() -> Result<Settings> {
    load_from(Config::parse())
}

pub fn load_from(cli: Config) -> Result<Settings> {
    let mut current = Config::defaults();

    if let Some(path) = &cli.config {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file_config: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        current = current.merge(file_config);
    }

    current = current.merge(cli);
    resolve(current)
}

fn resolve(config: Config) -> Result<Settings> {
    let Some(database_url) = config.database_url else {
        bail!("database_url is required (--database-url or BOARD_DATABASE_URL)");
    };
    if config.tls_cert.is_some() != config.tls_key.is_some() {
        bail!("tls_cert and tls_key must be given together");
    }

    Ok(Settings {
        host: config.host.unwrap_or_default(),
        port: config.port.unwrap_or_default(),
        tls_cert: config.tls_cert,
        tls_key: config.tls_key,
        database_url,
        connect_timeout: Duration::from_secs(config.connect_timeout_secs.unwrap_or(5)),
        keepalive_interval: Duration::from_secs(config.keepalive_interval_secs.unwrap_or(60)),
        keepalive_timeout: Duration::from_secs(config.keepalive_timeout_secs.unwrap_or(30)),
        max_message_length: config.max_message_length.unwrap_or(65_535),
        session_cookie_name: config.session_cookie_name.unwrap_or_default(),
        resource_dir: config.resource_dir.unwrap_or_else(|| PathBuf::from(".")),
        log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("logs")),
        log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
        log_retention: config.log_retention.unwrap_or(7),
        pid_file: config.pid_file,
    })
}
