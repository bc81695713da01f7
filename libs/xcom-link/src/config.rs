//! Link configuration
//!
//! Loaded with figment from an optional TOML/YAML/JSON file, overridden by
//! `XCOM_`-prefixed environment variables (`XCOM_HOST`, `XCOM_PORT`,
//! `XCOM_REQUEST_TIMEOUT_MS`, ...).

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use xcom_protocol::constants::{DEFAULT_PORT, DEFAULT_SOURCE_ADDRESS, MIN_FRAME_LEN};
use xcom_protocol::{AddressBook, BatteryKind, DeviceFamily, Result, XcomError};

pub const ENV_PREFIX: &str = "XCOM_";

// ============================================================================
// Default Value Functions
// ============================================================================

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_request_retries() -> u32 {
    2
}

fn default_source_address() -> u16 {
    DEFAULT_SOURCE_ADDRESS
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_multi_info_address() -> u16 {
    501
}

// ============================================================================
// Types
// ============================================================================

/// Who opens the TCP connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Dial the gateway at `host:port`
    #[default]
    Connect,
    /// Bind `bind:port` and wait for the gateway to dial in
    Listen,
}

/// What happens to a request whose match key is already in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Wait behind the active request, then transmit
    #[default]
    Queue,
    /// Fail immediately with `DuplicateRequest`
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub mode: LinkMode,

    /// Gateway host (connect mode)
    #[serde(default = "default_host")]
    pub host: String,

    /// Local interface (listen mode)
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Dial attempts before giving up (connect mode)
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// First backoff delay; doubles per attempt, capped at 30 s
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retransmissions after the first attempt
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,

    #[serde(default = "default_source_address")]
    pub source_address: u16,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Battery family present at address 601
    #[serde(default)]
    pub battery: BatteryKind,

    /// Device answering multi-info requests
    #[serde(default = "default_multi_info_address")]
    pub multi_info_address: u16,

    /// Replaces the standard family table when set
    #[serde(default)]
    pub families: Option<Vec<DeviceFamily>>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::default(),
            host: default_host(),
            bind: default_bind(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            request_retries: default_request_retries(),
            source_address: default_source_address(),
            duplicate_policy: DuplicatePolicy::default(),
            read_buffer_size: default_read_buffer_size(),
            battery: BatteryKind::default(),
            multi_info_address: default_multi_info_address(),
            families: None,
        }
    }
}

impl LinkConfig {
    /// Connect-mode configuration for `host:port`
    pub fn connect(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Listen-mode configuration on `bind:port`
    pub fn listen(bind: impl Into<String>, port: u16) -> Self {
        Self {
            mode: LinkMode::Listen,
            bind: bind.into(),
            port,
            ..Self::default()
        }
    }

    /// Load from an optional file plus `XCOM_` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| XcomError::config("Config file must have an extension"))?;

            figment = match extension {
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "json" => figment.merge(Json::file(path)),
                _ => {
                    return Err(XcomError::config(format!(
                        "Unsupported config file format: {extension}"
                    )))
                },
            };
        }

        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Extract and validate from a prepared figment
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| XcomError::config(format!("Failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(XcomError::config("connect_timeout_ms must be greater than 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(XcomError::config("request_timeout_ms must be greater than 0"));
        }
        if self.connect_attempts == 0 {
            return Err(XcomError::config("connect_attempts must be at least 1"));
        }
        if self.mode == LinkMode::Connect {
            if self.port == 0 {
                return Err(XcomError::config("port must be set in connect mode"));
            }
            if self.host.trim().is_empty() {
                return Err(XcomError::config("host must be set in connect mode"));
            }
        }
        if self.read_buffer_size < MIN_FRAME_LEN {
            return Err(XcomError::config(format!(
                "read_buffer_size must be at least {MIN_FRAME_LEN}"
            )));
        }
        self.address_book().map(|_| ())
    }

    /// Address book for this link: the configured families or the standard table
    pub fn address_book(&self) -> Result<AddressBook> {
        match &self.families {
            Some(families) => AddressBook::new(families.clone()),
            None => Ok(AddressBook::standard(self.battery)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `host:port` or `bind:port` depending on the mode
    pub fn endpoint(&self) -> String {
        match self.mode {
            LinkMode::Connect => format!("{}:{}", self.host, self.port),
            LinkMode::Listen => format!("{}:{}", self.bind, self.port),
        }
    }
}
