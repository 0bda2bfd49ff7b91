use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{self, EventBus};
use crate::error::{Error, Result};

// wifi_sta_config_t field sizes
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;
pub const MIN_PASSWORD_LEN: usize = 8;

pub const DEFAULT_RETRIES: u32 = 5;
pub const DEFAULT_OTA_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_OTA_BUFFER_SIZE: usize = 4096;

const PEM_CERT_HEADER: &str = "-----BEGIN CERTIFICATE-----";

/// Station credentials, validated against the driver's fixed-size fields.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: heapless::String<MAX_SSID_LEN>,
    pub password: heapless::String<MAX_PASSWORD_LEN>,
}

impl Credentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self> {
        if ssid.is_empty() {
            return Err(Error::config("WiFi SSID cannot be empty"));
        }
        let ssid = heapless::String::try_from(ssid)
            .map_err(|_| Error::config(format!("SSID longer than {} bytes", MAX_SSID_LEN)))?;

        if !password.is_empty() && password.len() < MIN_PASSWORD_LEN {
            return Err(Error::config(format!(
                "WPA2 password must be at least {} bytes",
                MIN_PASSWORD_LEN
            )));
        }
        let password = heapless::String::try_from(password).map_err(|_| {
            Error::config(format!("password longer than {} bytes", MAX_PASSWORD_LEN))
        })?;

        Ok(Self { ssid, password })
    }

    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid.as_str())
            .field("password", &if self.is_open() { "<empty>" } else { "<set>" })
            .finish()
    }
}

/// Everything one connection state machine instance needs.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub credentials: Credentials,
    /// Reconnect attempts allowed after the first link loss
    pub retries: u32,
    /// Upper bound for the blocking `init` wait; `None` waits forever
    pub wait_timeout: Option<Duration>,
    pub bus: Option<Arc<dyn EventBus>>,
}

impl ConnectionConfig {
    pub fn new(ssid: &str, password: &str) -> Result<Self> {
        Ok(Self {
            credentials: Credentials::new(ssid, password)?,
            retries: DEFAULT_RETRIES,
            wait_timeout: None,
            bus: None,
        })
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Configured bus, or the process default.
    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone().unwrap_or_else(bus::default_bus)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("credentials", &self.credentials)
            .field("retries", &self.retries)
            .field("wait_timeout", &self.wait_timeout)
            .field("bus", &self.bus.as_ref().map(|_| "<custom>").unwrap_or("<default>"))
            .finish()
    }
}

/// Update source and trust anchor for one OTA session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaConfig {
    pub url: String,
    pub cert_pem: Option<String>,
    pub timeout: Duration,
    pub buffer_size: usize,
}

impl OtaConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cert_pem: None,
            timeout: Duration::from_secs(DEFAULT_OTA_TIMEOUT_SECS),
            buffer_size: DEFAULT_OTA_BUFFER_SIZE,
        }
    }

    pub fn with_cert_pem(mut self, pem: impl Into<String>) -> Self {
        self.cert_pem = Some(pem.into());
        self
    }

    /// URL scheme in lower case, if the URL has one.
    pub fn scheme(&self) -> Option<String> {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
    }

    /// Part of the URL after `scheme://`.
    pub fn location(&self) -> &str {
        self.url.split_once("://").map(|(_, rest)| rest).unwrap_or("")
    }

    /// Checks shared by every transport. `https` needs a PEM trust anchor,
    /// plain `http` is refused, `file` is for bench images.
    pub fn validate(&self) -> Result<()> {
        let scheme = self
            .scheme()
            .ok_or_else(|| Error::config(format!("malformed update URL '{}'", self.url)))?;
        if self.location().is_empty() {
            return Err(Error::config(format!("update URL '{}' has no location", self.url)));
        }
        if self.buffer_size == 0 {
            return Err(Error::config("OTA buffer size must be non-zero"));
        }

        match scheme.as_str() {
            "https" => {
                let pem = self
                    .cert_pem
                    .as_deref()
                    .ok_or_else(|| Error::config("https update requires a trust anchor"))?;
                if !pem.contains(PEM_CERT_HEADER) {
                    return Err(Error::config("trust anchor is not a PEM certificate"));
                }
                Ok(())
            }
            "file" => Ok(()),
            "http" => Err(Error::config("refusing unsecured http update source")),
            other => Err(Error::config(format!("unsupported update scheme '{}'", other))),
        }
    }
}

/// Persisted device settings (JSON). Credentials default to the values
/// compiled in from `wifi_config.h`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub wifi_retries: u32,
    pub connect_timeout_secs: Option<u64>,

    // OTA settings
    pub ota_url: String,
    pub ota_cert_path: Option<String>,
    pub ota_timeout_secs: u64,
    pub ota_on_boot: bool,

    pub log_level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        // Set by build.rs from wifi_config.h, which should NOT be committed
        let wifi_ssid = env!("WIFI_SSID");
        let wifi_password = env!("WIFI_PASSWORD");

        Self {
            wifi_ssid: wifi_ssid.to_string(),
            wifi_password: wifi_password.to_string(),
            wifi_retries: DEFAULT_RETRIES,
            connect_timeout_secs: None,
            ota_url: env!("OTA_URL").to_string(),
            ota_cert_path: None,
            ota_timeout_secs: DEFAULT_OTA_TIMEOUT_SECS,
            ota_on_boot: false,
            log_level: "info".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        log::info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let mut config = ConnectionConfig::new(&self.wifi_ssid, &self.wifi_password)?
            .with_retries(self.wifi_retries);
        if let Some(secs) = self.connect_timeout_secs {
            config = config.with_wait_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    /// Build the OTA config, reading the trust anchor from disk when set.
    pub fn ota_config(&self) -> anyhow::Result<OtaConfig> {
        let mut config = OtaConfig::new(self.ota_url.clone());
        config.timeout = Duration::from_secs(self.ota_timeout_secs);
        if let Some(path) = &self.ota_cert_path {
            let pem = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Failed to read trust anchor {}: {}", path, e))?;
            config = config.with_cert_pem(pem);
        }
        Ok(config)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        crate::logging::parse_level(&self.log_level).unwrap_or(log::LevelFilter::Info)
    }
}

pub fn load_or_default(path: &Path) -> anyhow::Result<DeviceConfig> {
    match load(path) {
        Ok(mut config) => {
            log::info!("Loaded configuration from {}", path.display());

            // Empty stored credentials fall back to the compiled-in ones
            if config.wifi_ssid.is_empty() {
                let default_config = DeviceConfig::default();
                log::warn!(
                    "Stored WiFi credentials empty, using compiled defaults: SSID='{}'",
                    default_config.wifi_ssid
                );
                config.wifi_ssid = default_config.wifi_ssid;
                config.wifi_password = default_config.wifi_password;
            }

            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config from {}: {:?}, using defaults", path.display(), e);
            Ok(DeviceConfig::default())
        }
    }
}

fn load(path: &Path) -> anyhow::Result<DeviceConfig> {
    let data = std::fs::read(path)?;
    let config: DeviceConfig = serde_json::from_slice(&data)?;
    Ok(config)
}
