//! Scout configuration management

use anyhow::{Context, Result, anyhow};
use protocol::{Address, DeviceSettings, UsbIdFilter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration, threaded into the controller, escalator and sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoutConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    /// Settings used when opening every device descriptor
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "ControllerSettings::default_log_level")]
    pub log_level: String,
    /// linux-gpib board (minor) number
    #[serde(default)]
    pub board_index: i32,
    /// Refuse to start without root, since resets need it
    #[serde(default = "ControllerSettings::default_require_root")]
    pub require_root: bool,
    /// Hold an advisory lock on `lock_path` during recovery and discovery
    #[serde(default = "ControllerSettings::default_use_lock")]
    pub use_lock: bool,
    #[serde(default = "ControllerSettings::default_lock_path")]
    pub lock_path: PathBuf,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            board_index: 0,
            require_root: Self::default_require_root(),
            use_lock: Self::default_use_lock(),
            lock_path: Self::default_lock_path(),
        }
    }
}

impl ControllerSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_require_root() -> bool {
        true
    }

    fn default_use_lock() -> bool {
        true
    }

    fn default_lock_path() -> PathBuf {
        PathBuf::from("/run/lock/gpib-scout.lock")
    }

    /// Lock file to hold, if cross-process locking is enabled
    pub fn lock_file(&self) -> Option<&Path> {
        self.use_lock.then_some(self.lock_path.as_path())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "DiscoverySettings::default_first_address")]
    pub first_address: Address,
    #[serde(default = "DiscoverySettings::default_last_address")]
    pub last_address: Address,
    /// Query every instrument answers with its identity
    #[serde(default = "DiscoverySettings::default_identify_command")]
    pub identify_command: String,
    /// Maximum bytes read for the identity reply
    #[serde(default = "DiscoverySettings::default_identify_max_len")]
    pub identify_max_len: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            first_address: Self::default_first_address(),
            last_address: Self::default_last_address(),
            identify_command: Self::default_identify_command(),
            identify_max_len: Self::default_identify_max_len(),
        }
    }
}

impl DiscoverySettings {
    fn default_first_address() -> Address {
        Address::FIRST
    }

    fn default_last_address() -> Address {
        Address::LAST
    }

    fn default_identify_command() -> String {
        "*IDN?".to_string()
    }

    fn default_identify_max_len() -> usize {
        1024
    }

    /// Addresses probed by discovery, in order
    pub fn addresses(&self) -> Vec<Address> {
        Address::range(self.first_address, self.last_address).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Extra attempts after the first, per operation
    #[serde(default = "RecoverySettings::default_max_retries")]
    pub max_retries: u32,
    /// Pause after each reset so the hardware can settle ("2s", "500ms")
    #[serde(default = "RecoverySettings::default_settle_time", with = "duration_serde")]
    pub settle_time: Duration,
    /// USB signatures of bus adapters reset by escalation (VID:PID)
    #[serde(default = "RecoverySettings::default_adapter_ids")]
    pub adapter_ids: Vec<String>,
    /// Host controller driver rebound as the last resort (e.g. "ehci-pci")
    #[serde(default)]
    pub host_controller_driver: Option<String>,
    #[serde(default = "RecoverySettings::default_pci_drivers_path")]
    pub pci_drivers_path: PathBuf,
    /// Rebind the host controller before the first discovery reset
    #[serde(default)]
    pub rebind_on_startup: bool,
    /// Reset the adapters once all sessions are closed
    #[serde(default = "RecoverySettings::default_reset_on_teardown")]
    pub reset_on_teardown: bool,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            settle_time: Self::default_settle_time(),
            adapter_ids: Self::default_adapter_ids(),
            host_controller_driver: None,
            pci_drivers_path: Self::default_pci_drivers_path(),
            rebind_on_startup: false,
            reset_on_teardown: Self::default_reset_on_teardown(),
        }
    }
}

impl RecoverySettings {
    /// Upper bound accepted for `max_retries`
    pub const MAX_RETRIES_LIMIT: u32 = 10;

    fn default_max_retries() -> u32 {
        2
    }

    fn default_settle_time() -> Duration {
        Duration::from_secs(2)
    }

    fn default_adapter_ids() -> Vec<String> {
        vec![
            "0x3923:0x709b".to_string(), // National Instruments GPIB-USB-HS
            "0x0957:0x0518".to_string(), // Agilent 82357B
        ]
    }

    fn default_pci_drivers_path() -> PathBuf {
        PathBuf::from("/sys/bus/pci/drivers")
    }

    fn default_reset_on_teardown() -> bool {
        true
    }

    /// Parsed adapter signatures
    pub fn adapter_filters(&self) -> Result<Vec<UsbIdFilter>> {
        self.adapter_ids
            .iter()
            .map(|id| id.parse::<UsbIdFilter>().map_err(|e| anyhow!(e)))
            .collect()
    }
}

/// Serde adapter for `Duration` written as "1h", "30m", "2s" or "500ms"
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "2s", "1m30s" or "250ms"
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        if s.is_empty() {
            return Err("Empty duration".to_string());
        }

        let mut total_ms: u64 = 0;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }
            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let unit_ms = match c {
                'h' => 3_600_000,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    1
                }
                'm' => 60_000,
                's' => 1_000,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_ms = total_ms.saturating_add(num.saturating_mul(unit_ms));
        }

        // Handle case where string ends with a number (assume seconds)
        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_ms = total_ms.saturating_add(num.saturating_mul(1_000));
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let total_ms = d.as_millis();
        if total_ms % 1_000 != 0 {
            return format!("{}ms", total_ms);
        }

        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

pub use duration_serde::parse_duration;

impl ScoutConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/gpib-scout/scout.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: ScoutConfig = toml::from_str(content)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("gpib-scout").join("scout.toml")
        } else {
            PathBuf::from(".config/gpib-scout/scout.toml")
        }
    }

    fn expand_paths(&mut self) {
        self.controller.lock_path = expand(&self.controller.lock_path);
        self.recovery.pci_drivers_path = expand(&self.recovery.pci_drivers_path);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.controller.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.controller.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.controller.board_index < 0 {
            return Err(anyhow!(
                "Invalid board index {}, must not be negative",
                self.controller.board_index
            ));
        }

        if self.discovery.first_address > self.discovery.last_address {
            return Err(anyhow!(
                "Invalid discovery range {}-{}, first address is above last",
                self.discovery.first_address,
                self.discovery.last_address
            ));
        }

        if self.discovery.identify_command.trim().is_empty() {
            return Err(anyhow!("Identification command must not be empty"));
        }

        if self.discovery.identify_max_len == 0 {
            return Err(anyhow!("identify_max_len must be greater than 0"));
        }

        if self.recovery.max_retries > RecoverySettings::MAX_RETRIES_LIMIT {
            return Err(anyhow!(
                "Invalid max_retries {}, must be at most {}",
                self.recovery.max_retries,
                RecoverySettings::MAX_RETRIES_LIMIT
            ));
        }

        self.recovery.adapter_filters()?;

        if let Some(driver) = &self.recovery.host_controller_driver
            && (driver.is_empty() || driver.contains('/'))
        {
            return Err(anyhow!("Invalid host controller driver name '{}'", driver));
        }

        Ok(())
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
