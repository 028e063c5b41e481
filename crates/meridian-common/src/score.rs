/// Why a network must stay up even when no request wants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeepConnectedReason {
    #[default]
    None,
    /// Brought up ahead of a handover; may not be reaped for losing on score.
    ForHandover,
    ForTest,
}

/// Score as declared by a network agent. The arbiter folds this into its
/// own full score together with validation state and user choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkScore {
    /// Integer score kept for ranking compatibility; higher wins.
    pub legacy_int: i32,
    /// This network occupies the primary slot of its transport family.
    pub transport_primary: bool,
    /// Yield to a Wi-Fi network that validated in the past, even if it is
    /// currently unvalidated, unless bad Wi-Fi is being avoided.
    pub yield_to_bad_wifi: bool,
    /// The agent is about to bring this network down.
    pub exiting: bool,
    pub keep_connected: KeepConnectedReason,
}

impl Default for NetworkScore {
    fn default() -> Self {
        Self {
            legacy_int: 0,
            transport_primary: false,
            yield_to_bad_wifi: false,
            exiting: false,
            keep_connected: KeepConnectedReason::None,
        }
    }
}

impl NetworkScore {
    pub fn with_legacy_int(legacy_int: i32) -> Self {
        Self {
            legacy_int,
            ..Self::default()
        }
    }

    pub fn primary(mut self) -> Self {
        self.transport_primary = true;
        self
    }

    pub fn yielding_to_bad_wifi(mut self) -> Self {
        self.yield_to_bad_wifi = true;
        self
    }

    pub fn exiting(mut self) -> Self {
        self.exiting = true;
        self
    }

    pub fn keep_connected(mut self, reason: KeepConnectedReason) -> Self {
        self.keep_connected = reason;
        self
    }
}
