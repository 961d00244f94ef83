use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub mqtt: Mqtt,

    #[serde(default)]
    pub charging: Charging,

    /// Where the active schedule is persisted. `null` disables persistence.
    #[serde(default = "Config::default_schedule_file")]
    pub schedule_file: Option<PathBuf>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_client_id")]
    pub client_id: String,

    /// Topic prefix the dongle publishes under, eg `dongle-AA:BB:CC:DD:EE:FF`
    pub dongle_prefix: String,

    /// Prefix for our own control and event topics.
    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,

    /// Value of the `from` field in update messages.
    #[serde(default = "Config::default_mqtt_source")]
    pub source: String,

    #[serde(default = "Config::default_mqtt_connect_retries")]
    pub connect_retries: u32,
}
impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn dongle_prefix(&self) -> &str {
        &self.dongle_prefix
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn connect_retries(&self) -> u32 {
        self.connect_retries
    }

    pub fn update_topic(&self) -> String {
        format!("{}/update", self.dongle_prefix)
    }

    pub fn response_topic(&self) -> String {
        format!("{}/response", self.dongle_prefix)
    }

    pub fn telemetry_topic(&self) -> String {
        format!("{}/inputbank1", self.dongle_prefix)
    }
} // }}}

// Charging {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Charging {
    /// Maximum session length; also the width of the ACChgStart..ACChgEnd window.
    #[serde(default = "Config::default_safety_cutoff_hours")]
    pub safety_cutoff_hours: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_soc_check_interval")]
    pub soc_check_interval: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_response_timeout")]
    pub response_timeout: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "Config::default_fallback_delay", rename = "fallback_delay_ms")]
    pub fallback_delay: Duration,
}

impl Default for Charging {
    fn default() -> Self {
        Self {
            safety_cutoff_hours: Config::default_safety_cutoff_hours(),
            soc_check_interval: Config::default_soc_check_interval(),
            response_timeout: Config::default_response_timeout(),
            fallback_delay: Config::default_fallback_delay(),
        }
    }
}

impl Charging {
    pub fn safety_cutoff_hours(&self) -> u32 {
        self.safety_cutoff_hours
    }

    pub fn safety_cutoff(&self) -> Duration {
        Duration::from_secs(u64::from(self.safety_cutoff_hours) * 3600)
    }

    pub fn soc_check_interval(&self) -> Duration {
        self.soc_check_interval
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn fallback_delay(&self) -> Duration {
        self.fallback_delay
    }
} // }}}

#[derive(Clone, Debug)]
pub struct ConfigWrapper {
    config: Arc<Config>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn mqtt(&self) -> &Mqtt {
        &self.config.mqtt
    }

    pub fn charging(&self) -> &Charging {
        &self.config.charging
    }

    pub fn schedule_file(&self) -> Option<&PathBuf> {
        self.config.schedule_file.as_ref()
    }

    pub fn loglevel(&self) -> &str {
        &self.config.loglevel
    }

    pub fn log_summary(&self) {
        self.config.log_summary()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        Self::from_yaml(&content).map_err(|err| anyhow!("{}: {}", file, err))
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Dongle prefix: {}", self.mqtt.dongle_prefix);
            info!("    Namespace: {}", self.mqtt.namespace);
        }
        info!("  Charging:");
        info!("    Safety cutoff: {}h", self.charging.safety_cutoff_hours);
        info!("    SOC check interval: {:?}", self.charging.soc_check_interval);
        info!("    Response timeout: {:?}", self.charging.response_timeout);
        match &self.schedule_file {
            Some(path) => info!("  Schedule file: {}", path.display()),
            None => info!("  Schedule file: disabled"),
        }
        info!("  Log Level: {}", self.loglevel);
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
        }
        if self.mqtt.dongle_prefix.is_empty() {
            bail!("mqtt.dongle_prefix cannot be empty");
        }
        if self.mqtt.namespace.is_empty() {
            bail!("mqtt.namespace cannot be empty");
        }

        // a 24h window would make ACChgEnd equal ACChgStart
        if !(1..=23).contains(&self.charging.safety_cutoff_hours) {
            bail!("charging.safety_cutoff_hours must be between 1 and 23");
        }
        if self.charging.soc_check_interval.is_zero() {
            bail!("charging.soc_check_interval must be at least 1 second");
        }
        if self.charging.response_timeout.is_zero() {
            bail!("charging.response_timeout must be at least 1 second");
        }

        Ok(())
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_client_id() -> String {
        "solar-charge-bridge".to_string()
    }

    fn default_mqtt_namespace() -> String {
        "solar".to_string()
    }

    fn default_mqtt_source() -> String {
        "SolarBackend".to_string()
    }

    fn default_mqtt_connect_retries() -> u32 {
        3
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_safety_cutoff_hours() -> u32 {
        8
    }

    fn default_soc_check_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_response_timeout() -> Duration {
        Duration::from_secs(15)
    }

    fn default_fallback_delay() -> Duration {
        Duration::from_millis(500)
    }

    fn default_schedule_file() -> Option<PathBuf> {
        Some(PathBuf::from("data/schedule.json"))
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
