//! Configuration module for the echo fixtures.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With no
//! arguments at all the result is the reference fixture: a single
//! process echoing on `0.0.0.0:7777`.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Upper bound on I/O threads per process.
pub const MAX_THREADS: usize = 64;

/// Upper bound on the per-read buffer size (64 MiB).
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-fixtures")]
#[command(author = "echo-fixtures authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP echo server for load testing", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Process model: a single process, or one worker process per core
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Number of worker processes in cluster mode (0 = number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// I/O backend
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// I/O threads per process (0 = number of CPU cores)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Bytes read from a connection per syscall
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Pin event loop threads to CPU cores (Linux only)
    #[arg(long)]
    pub pin_threads: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Set by the supervisor on the worker processes it spawns
    #[arg(long, hide = true)]
    pub worker_id: Option<usize>,
}

/// Process model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// One process accepting every connection.
    #[default]
    Single,
    /// A supervisor spawning one worker process per core on a shared port.
    Cluster,
}

/// I/O backend used by a listening process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    /// Tokio, one task per connection.
    #[default]
    Tokio,
    /// mio readiness loop per thread (epoll/kqueue).
    Mio,
    /// io_uring completion loop per thread (Linux only).
    IoUring,
}

impl RuntimeType {
    /// Name as accepted on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeType::Tokio => "tokio",
            RuntimeType::Mio => "mio",
            RuntimeType::IoUring => "io-uring",
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Process model
    #[serde(default)]
    pub mode: Mode,
    /// Number of worker processes in cluster mode
    #[serde(default)]
    pub workers: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: Mode::default(),
            workers: 0,
            backlog: default_backlog(),
        }
    }
}

/// I/O backend configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Backend type
    #[serde(default, rename = "type")]
    pub kind: RuntimeType,
    /// I/O threads per process
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Bytes read per syscall
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Pin event loop threads to cores
    #[serde(default)]
    pub pin_threads: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeType::default(),
            threads: default_threads(),
            buffer_size: default_buffer_size(),
            pin_threads: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_backlog() -> i32 {
    10_000
}

fn default_threads() -> usize {
    1
}

fn default_buffer_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub mode: Mode,
    /// Resolved worker count (never 0).
    pub workers: usize,
    pub runtime: RuntimeType,
    /// Resolved I/O thread count (never 0).
    pub threads: usize,
    pub buffer_size: usize,
    pub backlog: i32,
    pub pin_threads: bool,
    pub log_level: String,
    /// Present when this process was spawned by the supervisor.
    pub worker_id: Option<usize>,
}

/// What this process does once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Spawn and wait on worker processes.
    Supervisor,
    /// Bind the port and echo.
    Listener,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let host_str = cli.host.unwrap_or(toml_config.server.host);
        let host: IpAddr = host_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid host address '{host_str}'")))?;

        let threads = cli.threads.unwrap_or(toml_config.runtime.threads);
        if threads > MAX_THREADS {
            return Err(ConfigError::Invalid(format!(
                "threads must be between 1 and {MAX_THREADS}, got {threads}"
            )));
        }
        let threads = if threads == 0 {
            crate::runtime::num_cpus().min(MAX_THREADS)
        } else {
            threads
        };

        let buffer_size = cli.buffer_size.unwrap_or(toml_config.runtime.buffer_size);
        if buffer_size == 0 || buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer size must be between 1 and {MAX_BUFFER_SIZE}, got {buffer_size}"
            )));
        }

        let backlog = cli.backlog.unwrap_or(toml_config.server.backlog);
        if backlog <= 0 {
            return Err(ConfigError::Invalid(format!(
                "backlog must be positive, got {backlog}"
            )));
        }

        let workers = match cli.workers.unwrap_or(toml_config.server.workers) {
            0 => crate::runtime::num_cpus(),
            n => n,
        };

        Ok(Config {
            host,
            port: cli.port.unwrap_or(toml_config.server.port),
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            workers,
            runtime: cli.runtime.unwrap_or(toml_config.runtime.kind),
            threads,
            buffer_size,
            backlog,
            pin_threads: cli.pin_threads || toml_config.runtime.pin_threads,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            worker_id: cli.worker_id,
        })
    }

    /// Socket address to bind.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// CPU slot for I/O thread `thread_id` of this process. Worker processes
    /// offset by their id so that a cluster spreads over distinct cores.
    pub fn pin_index(&self, thread_id: usize) -> usize {
        self.worker_id.unwrap_or(0) * self.threads + thread_id
    }

    /// Workers always listen, whatever mode the supervisor ran in.
    pub fn role(&self) -> Role {
        match (self.mode, self.worker_id) {
            (Mode::Cluster, None) => Role::Supervisor,
            _ => Role::Listener,
        }
    }

    /// Command-line arguments that reproduce this configuration in worker
    /// process `worker_id`. Workers run a single I/O thread each.
    pub fn worker_args(&self, worker_id: usize) -> Vec<String> {
        let mut args = vec![
            "--worker-id".to_string(),
            worker_id.to_string(),
            "--host".to_string(),
            self.host.to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "--mode".to_string(),
            "single".to_string(),
            "--runtime".to_string(),
            self.runtime.as_str().to_string(),
            "--threads".to_string(),
            "1".to_string(),
            "--buffer-size".to_string(),
            self.buffer_size.to_string(),
            "--backlog".to_string(),
            self.backlog.to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ];
        if self.pin_threads {
            args.push("--pin-threads".to_string());
        }
        args
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
