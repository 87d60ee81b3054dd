//! Relay configuration.
//!
//! Priority: CLI / env var  >  TOML  >  built-in default.
//! The TOML layer is `{data_dir}/config.toml`; all fields are optional
//! overrides. Durations are plain seconds in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::error;

const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9443;
const DEFAULT_ROTATION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
/// Large enough for a 256 KiB file chunk in base64 plus envelope overhead.
const DEFAULT_MAX_ENVELOPE_BYTES: usize = 512 * 1024;

// ─── TOML config file ─────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Listen address (default: 127.0.0.1).
    bind: Option<String>,
    /// WebSocket port (default: 9443).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,nodecrypt=trace".
    log: Option<String>,
    /// Relay RSA identity rotation interval in seconds (default: 86400).
    rsa_rotation_secs: Option<u64>,
    /// Idle session timeout in seconds (default: 60).
    idle_timeout_secs: Option<u64>,
    /// Hard cap on a single envelope (default: 524288).
    max_envelope_bytes: Option<usize>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── RelayConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// How long a relay RSA identity lives before a fresh one is generated.
    pub rsa_rotation_interval: Duration,
    /// Sessions with no inbound frame for this long are closed.
    pub idle_timeout: Duration,
    /// Frames larger than this fail with `MalformedFrame`.
    pub max_envelope_bytes: usize,
}

impl RelayConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        Self {
            bind: toml.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            rsa_rotation_interval: Duration::from_secs(
                toml.rsa_rotation_secs.unwrap_or(DEFAULT_ROTATION_SECS),
            ),
            idle_timeout: Duration::from_secs(
                toml.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
            max_envelope_bytes: toml.max_envelope_bytes.unwrap_or(DEFAULT_MAX_ENVELOPE_BYTES),
            data_dir,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/nodecrypt
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("nodecrypt");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/nodecrypt or ~/.local/share/nodecrypt
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("nodecrypt");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("nodecrypt");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\nodecrypt
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("nodecrypt");
        }
    }
    // Fallback
    PathBuf::from(".nodecrypt")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
