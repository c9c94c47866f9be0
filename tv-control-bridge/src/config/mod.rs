use crate::bridge::legacy::{LegacyIdentity, DEFAULT_PORT};
use crate::controller::ControllerOptions;
use crate::discovery::DEFAULT_APP_LIST_TIMEOUT;
use crate::wake::MacAddress;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TVBRIDGE_";
const APP_DIR: &str = "tv-control-bridge";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub tv: TvConfig,
    pub poll: PollConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TvConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub mac: Option<String>,
    /// SSDP location of the TV's media renderer description.
    pub rendering_control_location: Option<String>,
    /// Command run to turn the TV on; takes priority over wake-on-LAN.
    pub on_action: Option<Vec<String>>,
    pub client_name: String,
    pub client_description: String,
    pub client_id: String,
    pub timeout_ms: u64,
}

impl Default for TvConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: DEFAULT_PORT,
            name: "Samsung TV".to_string(),
            mac: None,
            rendering_control_location: None,
            on_action: None,
            client_name: "TV Control Bridge".to_string(),
            client_description: "tv-control-bridge".to_string(),
            client_id: "tv-control-bridge".to_string(),
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub app_list_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            app_list_timeout_ms: DEFAULT_APP_LIST_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7171,
            token: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    error = %err,
                    "ignoring unreadable config file"
                ),
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // TV settings
        if let Ok(val) = env::var(format!("{}HOST", ENV_PREFIX)) {
            self.tv.host = val;
        }
        if let Ok(val) = env::var(format!("{}PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.tv.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}MAC", ENV_PREFIX)) {
            self.tv.mac = Some(val);
        }
        if let Ok(val) = env::var(format!("{}RENDERING_CONTROL_LOCATION", ENV_PREFIX)) {
            self.tv.rendering_control_location = Some(val);
        }

        // Polling
        if let Ok(val) = env::var(format!("{}POLL_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(interval) = val.parse() {
                self.poll.interval_ms = interval;
            }
        }

        // Server settings
        if let Ok(val) = env::var(format!("{}SERVER_ENABLED", ENV_PREFIX)) {
            self.server.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}SERVER_TOKEN", ENV_PREFIX)) {
            self.server.token = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.tv.host.trim().is_empty() {
            return Err("tv.host must be set".into());
        }
        if self.tv.port == 0 {
            return Err("tv.port must be non-zero".into());
        }
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.poll.interval_ms < 1000 {
            return Err("poll.interval_ms must be >= 1000".into());
        }
        if self.poll.app_list_timeout_ms == 0 {
            return Err("poll.app_list_timeout_ms must be non-zero".into());
        }
        self.mac()?;
        if let Some(location) = self.tv.rendering_control_location.as_deref() {
            let url = reqwest::Url::parse(location)
                .map_err(|e| format!("tv.rendering_control_location is not a URL: {e}"))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err("tv.rendering_control_location must be an http(s) URL".into());
            }
        }
        if let Some(argv) = &self.tv.on_action {
            if argv.first().map_or(true, |program| program.trim().is_empty()) {
                return Err("tv.on_action must name a program".into());
            }
        }
        Ok(())
    }

    pub fn mac(&self) -> Result<Option<MacAddress>, Box<dyn std::error::Error>> {
        match self.tv.mac.as_deref() {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    pub fn identity(&self) -> LegacyIdentity {
        LegacyIdentity {
            name: self.tv.client_name.clone(),
            description: self.tv.client_description.clone(),
            id: self.tv.client_id.clone(),
        }
    }

    pub fn controller_options(&self) -> Result<ControllerOptions, Box<dyn std::error::Error>> {
        Ok(ControllerOptions {
            name: self.tv.name.clone(),
            host: self.tv.host.clone(),
            mac: self.mac()?,
            on_action: self.tv.on_action.clone(),
            rendering_control_location: self.tv.rendering_control_location.clone(),
            poll_interval: self.poll_interval(),
            app_list_timeout: Duration::from_millis(self.poll.app_list_timeout_ms),
        })
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
    base.join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
