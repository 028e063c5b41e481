use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArbiterConfigInput {
    pub version: u32,
    pub timers: TimerConfigInput,
    pub limits: LimitConfigInput,
    pub wifi: WifiConfigInput,
    pub policy: PolicyConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimerConfigInput {
    pub linger_delay_ms: Option<u64>,
    pub nascent_delay_ms: Option<u64>,
    pub evaluation_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitConfigInput {
    pub max_requests_per_uid: Option<usize>,
    pub max_requests_per_system_uid: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WifiConfigInput {
    pub avoid_bad_wifi: Option<bool>,
    pub actively_prefer_bad_wifi: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfigInput {
    pub mobile_data_preferred_uids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// Grace period a network keeps after losing a request to a better one.
    pub linger_delay: Duration,
    /// Grace period a fresh network gets to attract its first request.
    pub nascent_delay: Duration,
    /// After this long without a validation result a network counts as evaluated.
    pub evaluation_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            linger_delay: Duration::from_millis(30_000),
            nascent_delay: Duration::from_millis(5_000),
            evaluation_timeout: Duration::from_millis(8_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitConfig {
    pub max_requests_per_uid: usize,
    pub max_requests_per_system_uid: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_uid: 100,
            max_requests_per_system_uid: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiConfig {
    /// Platform default for avoiding Wi-Fi that stopped validating.
    pub avoid_bad_wifi: bool,
    pub actively_prefer_bad_wifi: bool,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            avoid_bad_wifi: true,
            actively_prefer_bad_wifi: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub version: u32,
    pub timers: TimerConfig,
    pub limits: LimitConfig,
    pub wifi: WifiConfig,
    /// UIDs that prefer cellular at startup.
    pub mobile_data_preferred_uids: BTreeSet<u32>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            timers: TimerConfig::default(),
            limits: LimitConfig::default(),
            wifi: WifiConfig::default(),
            mobile_data_preferred_uids: BTreeSet::new(),
        }
    }
}

impl ArbiterConfigInput {
    pub fn resolve(self) -> Result<ArbiterConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let defaults = TimerConfig::default();
        let timers = TimerConfig {
            linger_delay: self
                .timers
                .linger_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.linger_delay),
            nascent_delay: self
                .timers
                .nascent_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.nascent_delay),
            evaluation_timeout: self
                .timers
                .evaluation_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.evaluation_timeout),
        };
        if timers.linger_delay.is_zero() {
            return Err("timers.linger_delay_ms must be positive".to_string());
        }

        let defaults = LimitConfig::default();
        let limits = LimitConfig {
            max_requests_per_uid: self
                .limits
                .max_requests_per_uid
                .unwrap_or(defaults.max_requests_per_uid)
                .max(1),
            max_requests_per_system_uid: self
                .limits
                .max_requests_per_system_uid
                .unwrap_or(defaults.max_requests_per_system_uid)
                .max(1),
        };

        let defaults = WifiConfig::default();
        let wifi = WifiConfig {
            avoid_bad_wifi: self.wifi.avoid_bad_wifi.unwrap_or(defaults.avoid_bad_wifi),
            actively_prefer_bad_wifi: self
                .wifi
                .actively_prefer_bad_wifi
                .unwrap_or(defaults.actively_prefer_bad_wifi),
        };

        Ok(ArbiterConfig {
            version,
            timers,
            limits,
            wifi,
            mobile_data_preferred_uids: self.policy.mobile_data_preferred_uids.into_iter().collect(),
        })
    }
}

impl ArbiterConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ArbiterConfig::default());
        }
        let parsed: ArbiterConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    /// Same config with a different linger delay. Handy for tests.
    pub fn with_linger_delay(mut self, delay: Duration) -> Self {
        self.timers.linger_delay = delay;
        self
    }

    pub fn with_nascent_delay(mut self, delay: Duration) -> Self {
        self.timers.nascent_delay = delay;
        self
    }
}
