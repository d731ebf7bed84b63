//! Privileged power-management operations.
//!
//! [`PowerOperations`] is the surface the control socket exposes behind the
//! authorization gate. Implementations are only ever invoked after the gate
//! allowed the calling connection.
//!
//! [`InMemoryPower`] records the requested state without touching hardware.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Lowest accepted lower charge limit, in percent.
pub const MIN_CHARGE_FLOOR: u8 = 20;

/// Lowest accepted upper charge limit, in percent.
pub const MAX_CHARGE_FLOOR: u8 = 50;

/// Charge limits and adapter behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Charging resumes below this percentage.
    pub min_charge: u8,
    /// Charging stops at this percentage.
    pub max_charge: u8,
    /// Keep the adapter disabled while the machine sleeps.
    pub adapter_sleep: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_charge: 70,
            max_charge: 80,
            adapter_sleep: false,
        }
    }
}

impl Settings {
    /// Checks the charge limits.
    ///
    /// # Errors
    ///
    /// Returns [`PowerError::InvalidSettings`] unless
    /// `20 <= min_charge <= max_charge <= 100` and `max_charge >= 50`.
    pub fn validate(&self) -> Result<(), PowerError> {
        let valid = self.min_charge >= MIN_CHARGE_FLOOR
            && self.min_charge <= self.max_charge
            && self.max_charge <= 100
            && self.max_charge >= MAX_CHARGE_FLOOR;
        if valid {
            Ok(())
        } else {
            Err(PowerError::InvalidSettings {
                min_charge: self.min_charge,
                max_charge: self.max_charge,
            })
        }
    }
}

/// Charging target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargingMode {
    /// Keep the charge between the configured limits.
    #[default]
    Standard,
    /// Charge up to the upper limit once, then return to standard.
    ToMaximum,
    /// Charge to 100% once, then return to standard.
    ToFull,
}

/// Observable power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerState {
    /// The power adapter supplies the machine.
    pub power_adapter_enabled: bool,
    /// The battery may charge.
    pub charging_enabled: bool,
    /// Current charging target.
    pub charging_mode: ChargingMode,
    /// Background activity is paused.
    pub paused: bool,
    /// An update of the daemon is in preparation.
    pub update_pending: bool,
}

impl Default for PowerState {
    fn default() -> Self {
        Self {
            power_adapter_enabled: true,
            charging_enabled: true,
            charging_mode: ChargingMode::Standard,
            paused: false,
            update_pending: false,
        }
    }
}

/// Errors from privileged operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PowerError {
    /// The machine does not support the operation.
    #[error("operation not supported on this machine")]
    Unsupported,

    /// The requested charge limits are out of range.
    #[error("invalid charge limits: min {min_charge}, max {max_charge}")]
    InvalidSettings {
        /// Requested lower limit.
        min_charge: u8,
        /// Requested upper limit.
        max_charge: u8,
    },

    /// The operation was refused by the current state.
    #[error("operation refused: {reason}")]
    Refused {
        /// Why.
        reason: String,
    },
}

/// Power-management operations exposed over the control socket.
pub trait PowerOperations: Send + Sync {
    /// Whether this machine supports power management at all.
    fn is_supported(&self) -> bool;

    /// Current power state.
    fn state(&self) -> PowerState;

    /// Current settings.
    fn settings(&self) -> Settings;

    /// Replaces the settings after validating them.
    fn set_settings(&self, settings: Settings) -> Result<(), PowerError>;

    /// Stops drawing power from the adapter.
    fn disable_power_adapter(&self) -> Result<(), PowerError>;

    /// Resumes drawing power from the adapter.
    fn enable_power_adapter(&self) -> Result<(), PowerError>;

    /// Charges to 100% once.
    fn charge_to_full(&self) -> Result<(), PowerError>;

    /// Charges to the upper limit once.
    fn charge_to_limit(&self) -> Result<(), PowerError>;

    /// Stops charging.
    fn disable_charging(&self) -> Result<(), PowerError>;

    /// Pauses background activity.
    fn pause_activity(&self) -> Result<(), PowerError>;

    /// Resumes background activity.
    fn resume_activity(&self) -> Result<(), PowerError>;

    /// Restores a neutral hardware state before the daemon is replaced.
    fn prepare_update(&self) -> Result<(), PowerError>;

    /// Ends a [`PowerOperations::prepare_update`] cycle.
    fn finish_update(&self) -> Result<(), PowerError>;
}

#[derive(Debug, Default)]
struct PowerInner {
    state: PowerState,
    settings: Settings,
}

/// [`PowerOperations`] that only records what was requested.
#[derive(Debug)]
pub struct InMemoryPower {
    supported: bool,
    inner: Mutex<PowerInner>,
}

impl Default for InMemoryPower {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPower {
    /// Create a supported machine in its default state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            supported: true,
            inner: Mutex::new(PowerInner::default()),
        }
    }

    /// Create a machine that rejects every operation as unsupported.
    #[must_use]
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, PowerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(
        &self,
        operation: &'static str,
        apply: impl FnOnce(&mut PowerState) -> Result<(), PowerError>,
    ) -> Result<(), PowerError> {
        if !self.supported {
            return Err(PowerError::Unsupported);
        }
        let mut inner = self.lock();
        apply(&mut inner.state)?;
        info!(operation, state = ?inner.state, "Power state changed");
        Ok(())
    }
}

impl PowerOperations for InMemoryPower {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn state(&self) -> PowerState {
        self.lock().state
    }

    fn settings(&self) -> Settings {
        self.lock().settings
    }

    fn set_settings(&self, settings: Settings) -> Result<(), PowerError> {
        if !self.supported {
            return Err(PowerError::Unsupported);
        }
        settings.validate()?;
        self.lock().settings = settings;
        info!(?settings, "Settings changed");
        Ok(())
    }

    fn disable_power_adapter(&self) -> Result<(), PowerError> {
        self.update("disable_power_adapter", |state| {
            state.power_adapter_enabled = false;
            Ok(())
        })
    }

    fn enable_power_adapter(&self) -> Result<(), PowerError> {
        self.update("enable_power_adapter", |state| {
            state.power_adapter_enabled = true;
            Ok(())
        })
    }

    fn charge_to_full(&self) -> Result<(), PowerError> {
        self.update("charge_to_full", |state| {
            state.charging_enabled = true;
            state.charging_mode = ChargingMode::ToFull;
            Ok(())
        })
    }

    fn charge_to_limit(&self) -> Result<(), PowerError> {
        self.update("charge_to_limit", |state| {
            state.charging_enabled = true;
            state.charging_mode = ChargingMode::ToMaximum;
            Ok(())
        })
    }

    fn disable_charging(&self) -> Result<(), PowerError> {
        self.update("disable_charging", |state| {
            state.charging_enabled = false;
            state.charging_mode = ChargingMode::Standard;
            Ok(())
        })
    }

    fn pause_activity(&self) -> Result<(), PowerError> {
        self.update("pause_activity", |state| {
            state.paused = true;
            Ok(())
        })
    }

    fn resume_activity(&self) -> Result<(), PowerError> {
        self.update("resume_activity", |state| {
            state.paused = false;
            Ok(())
        })
    }

    fn prepare_update(&self) -> Result<(), PowerError> {
        self.update("prepare_update", |state| {
            state.update_pending = true;
            state.power_adapter_enabled = true;
            state.charging_enabled = true;
            state.charging_mode = ChargingMode::Standard;
            Ok(())
        })
    }

    fn finish_update(&self) -> Result<(), PowerError> {
        self.update("finish_update", |state| {
            if !state.update_pending {
                return Err(PowerError::Refused {
                    reason: "no update in preparation".to_string(),
                });
            }
            state.update_pending = false;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.min_charge, 70);
        assert_eq!(settings.max_charge, 80);
        assert!(!settings.adapter_sleep);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_bounds() {
        let check = |min_charge, max_charge| {
            Settings {
                min_charge,
                max_charge,
                adapter_sleep: false,
            }
            .validate()
            .is_ok()
        };

        assert!(check(20, 50));
        assert!(check(50, 100));
        assert!(!check(19, 80));
        assert!(!check(81, 80));
        assert!(!check(20, 49));
        assert!(!check(20, 101));
    }

    #[test]
    fn test_operations_update_state() {
        let power = InMemoryPower::new();

        power.disable_power_adapter().unwrap();
        assert!(!power.state().power_adapter_enabled);

        power.charge_to_full().unwrap();
        assert_eq!(power.state().charging_mode, ChargingMode::ToFull);

        power.disable_charging().unwrap();
        let state = power.state();
        assert!(!state.charging_enabled);
        assert_eq!(state.charging_mode, ChargingMode::Standard);
    }

    #[test]
    fn test_invalid_settings_preserve_current() {
        let power = InMemoryPower::new();
        let bad = Settings {
            min_charge: 90,
            max_charge: 60,
            adapter_sleep: true,
        };

        assert!(matches!(
            power.set_settings(bad),
            Err(PowerError::InvalidSettings { .. })
        ));
        assert_eq!(power.settings(), Settings::default());
    }

    #[test]
    fn test_update_cycle() {
        let power = InMemoryPower::new();
        assert!(power.finish_update().is_err());

        power.disable_power_adapter().unwrap();
        power.prepare_update().unwrap();
        assert!(power.state().power_adapter_enabled);
        power.finish_update().unwrap();
        assert!(!power.state().update_pending);
    }

    #[test]
    fn test_unsupported_machine() {
        let power = InMemoryPower::unsupported();
        assert!(!power.is_supported());
        assert_eq!(power.charge_to_full(), Err(PowerError::Unsupported));
        assert_eq!(
            power.set_settings(Settings::default()),
            Err(PowerError::Unsupported)
        );
    }
}
