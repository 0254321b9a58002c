//! Configuration options recognized by the driver, deserialized from
//! TOML via `serde` -- the wider example pack's convention over
//! hand-rolled key/value parsing (e.g. `oxidized`'s use of the `toml`
//! crate).

use serde::Deserialize;

use crate::error::{Result, WeError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriversConfig {
    pub data_manager: String,
    pub we_driver: String,
    pub work_manager: String,
    pub propagator: Option<String>,
}

impl Default for DriversConfig {
    fn default() -> Self {
        DriversConfig {
            data_manager: "memory".to_string(),
            we_driver: "default".to_string(),
            work_manager: "threads".to_string(),
            propagator: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SystemConfig {
    pub system_driver: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Wall-clock budget for the whole run, in seconds; no limit if
    /// unset.
    pub max_wallclock_secs: Option<u64>,
    /// Defaulted (current + 1, i.e. do one more iteration) at the call
    /// site, since the default depends on the store's current
    /// iteration, which `Config` does not know about.
    pub max_iterations: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig { max_wallclock_secs: None, max_iterations: None }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ArgsConfig {
    pub profile_mode: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub drivers: DriversConfig,
    pub system: SystemConfig,
    pub limits: LimitsConfig,
    pub args: ArgsConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| WeError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates the required keys and fails fast with a
    /// `WeError::Config` naming the missing key, rather than panicking
    /// later when a collaborator is constructed.
    pub fn validate(&self) -> Result<()> {
        if self.drivers.propagator.is_none() {
            return Err(WeError::Config("drivers.propagator is required".to_string()));
        }
        if self.system.system_driver.is_none() {
            return Err(WeError::Config("system.system_driver is required".to_string()));
        }
        Ok(())
    }
}
