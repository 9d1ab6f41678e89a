use crate::model::ConnectionTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "DCCEX_";
pub const DEFAULT_PORT: u16 = 2560;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub stations: Vec<StationConfig>,
    pub stream: StreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stations: vec![StationConfig::default()],
            stream: StreamConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StationConfig {
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            name: None,
        }
    }
}

impl StationConfig {
    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget::new(self.host.trim(), self.port)
    }

    pub fn title(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("EX-CommandStation on {}", self.host.trim()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// 0 disables the timeout.
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Consecutive failed sessions before giving up; 0 never reconnects.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)
                .map_err(|err| format!("invalid {}: {err}", config_path.display()))?;
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var(format!("{}HOST", ENV_PREFIX)) {
            let mut station = StationConfig {
                host,
                ..StationConfig::default()
            };
            if let Ok(val) = env::var(format!("{}PORT", ENV_PREFIX)) {
                if let Ok(port) = val.parse() {
                    station.port = port;
                }
            }
            station.name = env::var(format!("{}NAME", ENV_PREFIX)).ok();
            self.stations = vec![station];
        }

        if let Ok(val) = env::var(format!("{}CONNECT_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.stream.connect_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}RECONNECT_MAX_ATTEMPTS", ENV_PREFIX)) {
            if let Ok(attempts) = val.parse() {
                self.stream.reconnect.max_attempts = attempts;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.stations.is_empty() {
            return Err("at least one [[stations]] entry is required".into());
        }
        let mut seen = HashSet::new();
        for station in &self.stations {
            if station.host.trim().is_empty() {
                return Err("stations.host must be set".into());
            }
            if station.port == 0 {
                return Err(format!("stations.port must be non-zero for {}", station.host).into());
            }
            let id = station.target().unique_id();
            if !seen.insert(id.clone()) {
                return Err(format!("station {id} is already configured").into());
            }
        }
        let reconnect = &self.stream.reconnect;
        if reconnect.max_attempts > 0 {
            if reconnect.initial_delay_ms == 0 {
                return Err("stream.reconnect.initial_delay_ms must be non-zero".into());
            }
            if reconnect.max_delay_ms < reconnect.initial_delay_ms {
                return Err(
                    "stream.reconnect.max_delay_ms must be >= stream.reconnect.initial_delay_ms"
                        .into(),
                );
            }
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join("dccex-bridge").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
