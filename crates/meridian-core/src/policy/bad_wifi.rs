use tracing::info;

use crate::arbiter::Arbiter;
use crate::config::WifiConfig;

/// Whether Wi-Fi that stopped validating should be abandoned, and whether
/// it should be actively preferred.
#[derive(Debug, Clone, Copy)]
pub struct BadWifiPolicy {
    /// Platform default. When on, the user setting cannot turn avoidance off.
    resource_avoid: bool,
    setting: Option<bool>,
    /// Latched: once on it stays on.
    actively_prefer: bool,
}

impl BadWifiPolicy {
    pub fn new(config: &WifiConfig) -> Self {
        Self {
            resource_avoid: config.avoid_bad_wifi,
            setting: None,
            actively_prefer: config.actively_prefer_bad_wifi,
        }
    }

    pub fn avoid_bad_wifi(&self) -> bool {
        self.resource_avoid || self.setting == Some(true)
    }

    pub fn actively_prefer(&self) -> bool {
        self.actively_prefer
    }

    /// Returns whether the effective avoid flag changed.
    pub fn set_setting(&mut self, setting: Option<bool>) -> bool {
        let before = self.avoid_bad_wifi();
        self.setting = setting;
        before != self.avoid_bad_wifi()
    }

    pub fn set_resource_default(&mut self, avoid: bool) -> bool {
        let before = self.avoid_bad_wifi();
        self.resource_avoid = avoid;
        before != self.avoid_bad_wifi()
    }

    /// Returns whether the flag changed. Turning it off again is ignored.
    pub fn set_actively_prefer(&mut self, on: bool) -> bool {
        if on && !self.actively_prefer {
            self.actively_prefer = true;
            return true;
        }
        false
    }
}

impl Arbiter {
    /// User setting for avoiding bad Wi-Fi; `None` means "not set".
    pub fn set_avoid_bad_wifi_setting(&mut self, setting: Option<bool>) {
        if self.bad_wifi.set_setting(setting) {
            info!(avoid = self.bad_wifi.avoid_bad_wifi(), "avoid bad wifi changed");
            self.rematch_all();
        }
        self.flush();
    }

    /// Platform default for avoiding bad Wi-Fi, e.g. after a carrier change.
    pub fn set_avoid_bad_wifi_resource(&mut self, avoid: bool) {
        if self.bad_wifi.set_resource_default(avoid) {
            info!(avoid = self.bad_wifi.avoid_bad_wifi(), "avoid bad wifi changed");
            self.rematch_all();
        }
        self.flush();
    }

    pub fn set_actively_prefer_bad_wifi(&mut self, on: bool) {
        if self.bad_wifi.set_actively_prefer(on) {
            info!("actively preferring bad wifi");
            self.rematch_all();
        }
        self.flush();
    }

    pub fn avoid_bad_wifi(&self) -> bool {
        self.bad_wifi.avoid_bad_wifi()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_only_matters_when_resource_allows_bad_wifi() {
        let mut p = BadWifiPolicy::new(&WifiConfig {
            avoid_bad_wifi: false,
            actively_prefer_bad_wifi: false,
        });
        assert!(!p.avoid_bad_wifi());
        assert!(p.set_setting(Some(true)));
        assert!(p.avoid_bad_wifi());
        assert!(p.set_setting(Some(false)));

        let mut p = BadWifiPolicy::new(&WifiConfig::default());
        assert!(p.avoid_bad_wifi());
        assert!(!p.set_setting(Some(false)));
        assert!(p.avoid_bad_wifi());
    }

    #[test]
    fn actively_prefer_latches() {
        let mut p = BadWifiPolicy::new(&WifiConfig::default());
        assert!(!p.set_actively_prefer(false));
        assert!(p.set_actively_prefer(true));
        assert!(!p.set_actively_prefer(false));
        assert!(p.actively_prefer());
    }
}
