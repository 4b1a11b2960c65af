//! Server configuration.
//!
//! Configuration is an injected value handed to [`crate::server::Server::new`];
//! there is no global configuration object. The JSON document uses the field
//! names shown in [`ServerConfig`]'s serde attributes and every key is
//! optional; absent keys keep their defaults.

use std::{fs, io, path::Path, time::Duration};

use serde::Deserialize;

/// Default location probed by [`ServerConfig::load_default`].
pub const DEFAULT_CONFIG_PATH: &str = "conf/fastnet.json";

/// Policy mapping connections to workers.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum WorkerMode {
    /// `conn_id % worker_pool_size`; one worker services many connections and
    /// per-connection delivery order is preserved.
    #[default]
    Hash,
    /// One worker per connection slot; the pool size is overridden to
    /// `max_conn` and free worker ids are claimed at accept time.
    Bind,
}

/// Which transports the server listens on.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// TCP listener only.
    Tcp,
    /// WebSocket listener only.
    Websocket,
    /// Both listeners.
    #[default]
    Both,
}

/// Dispatch model selected at process start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterModel {
    /// Three-phase router objects (`pre_handle` / `handle` / `post_handle`).
    Classic,
    /// Middleware-style ordered handler lists with grouping.
    Slices,
}

/// All recognized options, mirroring the `conf/fastnet.json` document.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServerConfig {
    /// Bind address for both listeners.
    pub host: String,
    /// TCP listener port.
    #[serde(rename = "TCPPort")]
    pub tcp_port: u16,
    /// WebSocket listener port.
    pub ws_port: u16,
    /// Server identity string.
    pub name: String,
    /// Version identity string.
    pub version: String,
    /// Per-message upper bound enforced by the packers.
    pub max_packet_size: u32,
    /// Accepted-connection ceiling; the accept loop backs off beyond it.
    pub max_conn: usize,
    /// Number of dispatch workers. Zero disables the pool entirely.
    pub worker_pool_size: u32,
    /// Capacity of each worker's task queue.
    pub max_worker_task_len: usize,
    /// Connection-to-worker affinity policy.
    pub worker_mode: WorkerMode,
    /// Capacity of each connection's outbound message queue.
    pub max_msg_chan_len: usize,
    /// Socket read chunk size in bytes.
    #[serde(rename = "IOReadBuffSize")]
    pub io_read_buff_size: usize,
    /// Transport selection.
    pub mode: ServerMode,
    /// Selects the slices dispatch model when `true`.
    pub router_slices_mode: bool,
    /// Log directory for embedding applications that route logs to files.
    pub log_dir: String,
    /// Log file name; empty leaves output on stderr.
    pub log_file: String,
    /// Days of log history to retain.
    pub log_save_days: u32,
    /// Per-file size limit in bytes.
    pub log_file_size: u64,
    /// Mirror log output to the console.
    pub log_cons: bool,
    /// 0 keeps everything; each step suppresses one more level
    /// (1 drops debug, 2 drops info, ...).
    pub log_isolation_level: u8,
    /// Liveness deadline in seconds; a peer silent for longer is not alive.
    pub heartbeat_max: u64,
    /// TLS certificate path, surfaced for embedding applications.
    pub cert_file: String,
    /// TLS private key path, surfaced for embedding applications.
    pub private_key_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            tcp_port: 8999,
            ws_port: 9000,
            name: "FastnetServerApp".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            max_packet_size: 4096,
            max_conn: 12000,
            worker_pool_size: 10,
            max_worker_task_len: 1024,
            worker_mode: WorkerMode::Hash,
            max_msg_chan_len: 1024,
            io_read_buff_size: 1024,
            mode: ServerMode::Both,
            router_slices_mode: false,
            log_dir: "./log".to_owned(),
            log_file: String::new(),
            log_save_days: 7,
            log_file_size: 64 * 1024 * 1024,
            log_cons: false,
            log_isolation_level: 0,
            heartbeat_max: 10,
            cert_file: String::new(),
            private_key_file: String::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON document at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or does not parse as a
    /// configuration document.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(io::Error::other)
    }

    /// Load from [`DEFAULT_CONFIG_PATH`], falling back to defaults when the
    /// file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error only when the file exists but cannot be parsed.
    pub fn load_default() -> io::Result<Self> {
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::load(DEFAULT_CONFIG_PATH)
        } else {
            Ok(Self::default())
        }
    }

    /// Dispatch model implied by `router_slices_mode`.
    #[must_use]
    pub fn router_model(&self) -> RouterModel {
        if self.router_slices_mode {
            RouterModel::Slices
        } else {
            RouterModel::Classic
        }
    }

    /// Liveness deadline as a [`Duration`].
    #[must_use]
    pub fn heartbeat_max_duration(&self) -> Duration { Duration::from_secs(self.heartbeat_max) }

    /// TCP listener address string.
    #[must_use]
    pub fn tcp_addr(&self) -> String { format!("{}:{}", self.host, self.tcp_port) }

    /// WebSocket listener address string.
    #[must_use]
    pub fn ws_addr(&self) -> String { format!("{}:{}", self.host, self.ws_port) }
}
