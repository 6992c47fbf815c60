use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::run::DEFAULT_POLL_TIMEOUT;
use crate::sdk::SensorKind;
use crate::sim::{default_profiles, HotplugStep, SimDeviceProfile};

pub const CONFIG_ENV: &str = "DEPTHTAP_CONFIG";

/// How frames reach the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    #[default]
    Poll,
    Callback,
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionMode::Poll => f.write_str("poll"),
            AcquisitionMode::Callback => f.write_str("callback"),
        }
    }
}

impl std::str::FromStr for AcquisitionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "polling" => Ok(AcquisitionMode::Poll),
            "callback" | "listener" => Ok(AcquisitionMode::Callback),
            other => Err(format!("unknown acquisition mode '{}'", other)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DepthtapConfigFile {
    device_uri: Option<String>,
    sensor: Option<SensorKind>,
    mode: Option<AcquisitionMode>,
    poll_timeout_ms: Option<u64>,
    monitor: Option<bool>,
    devices: Option<Vec<SimDeviceProfile>>,
    hotplug: Option<Vec<HotplugStep>>,
}

#[derive(Debug, Clone)]
pub struct DepthtapConfig {
    /// `None` opens whichever device the SDK finds first.
    pub device_uri: Option<String>,
    pub sensor: SensorKind,
    pub mode: AcquisitionMode,
    pub poll_timeout: Duration,
    pub monitor_devices: bool,
    /// Devices the simulated SDK starts with.
    pub devices: Vec<SimDeviceProfile>,
    /// Connectivity changes the simulated SDK plays while streaming.
    pub hotplug: Vec<HotplugStep>,
}

impl Default for DepthtapConfig {
    fn default() -> Self {
        Self {
            device_uri: None,
            sensor: SensorKind::Depth,
            mode: AcquisitionMode::Poll,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            monitor_devices: false,
            devices: default_profiles(),
            hotplug: Vec::new(),
        }
    }
}

impl DepthtapConfig {
    /// Load from the file named by `DEPTHTAP_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Defaults, then `path`, then environment overrides, then validation.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DepthtapConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            device_uri: file.device_uri.filter(|uri| !uri.trim().is_empty()),
            sensor: file.sensor.unwrap_or(defaults.sensor),
            mode: file.mode.unwrap_or(defaults.mode),
            poll_timeout: file
                .poll_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_timeout),
            monitor_devices: file.monitor.unwrap_or(defaults.monitor_devices),
            devices: file.devices.unwrap_or(defaults.devices),
            hotplug: file.hotplug.unwrap_or(defaults.hotplug),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("DEPTHTAP_DEVICE_URI") {
            if !uri.trim().is_empty() {
                self.device_uri = Some(uri);
            }
        }
        if let Ok(sensor) = std::env::var("DEPTHTAP_SENSOR") {
            self.sensor = sensor
                .parse()
                .map_err(|e| anyhow!("DEPTHTAP_SENSOR: {}", e))?;
        }
        if let Ok(mode) = std::env::var("DEPTHTAP_MODE") {
            self.mode = mode.parse().map_err(|e| anyhow!("DEPTHTAP_MODE: {}", e))?;
        }
        if let Ok(timeout) = std::env::var("DEPTHTAP_POLL_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("DEPTHTAP_POLL_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.poll_timeout = Duration::from_millis(millis);
        }
        if let Ok(monitor) = std::env::var("DEPTHTAP_MONITOR") {
            self.monitor_devices = parse_flag(&monitor)
                .ok_or_else(|| anyhow!("DEPTHTAP_MONITOR must be true/false or 1/0"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(anyhow!("poll timeout must be greater than zero"));
        }
        if self.devices.is_empty() {
            return Err(anyhow!("at least one simulated device is required"));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.uri.trim().is_empty() {
                return Err(anyhow!("device uri must not be empty"));
            }
            if !seen.insert(device.uri.as_str()) {
                return Err(anyhow!("duplicate device uri {}", device.uri));
            }
            for sensor in &device.sensors {
                if sensor.width == 0 || sensor.height == 0 {
                    return Err(anyhow!(
                        "{} sensor on {} must have non-zero dimensions",
                        sensor.kind,
                        device.uri
                    ));
                }
            }
        }
        for step in &self.hotplug {
            step.validate().map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<DepthtapConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::DeviceState;
    use crate::sim::SimSensorProfile;

    #[test]
    fn defaults_describe_one_vga_device() {
        let cfg = DepthtapConfig::default();
        assert_eq!(cfg.mode, AcquisitionMode::Poll);
        assert_eq!(cfg.sensor, SensorKind::Depth);
        assert_eq!(cfg.poll_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.devices.len(), 1);
        assert_eq!(cfg.devices[0].uri, "sim://depth/0");
        cfg.validate().unwrap();
    }

    #[test]
    fn duplicate_uris_are_rejected() {
        let mut cfg = DepthtapConfig::default();
        cfg.devices.push(cfg.devices[0].clone());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn zero_sized_sensor_is_rejected() {
        let mut cfg = DepthtapConfig::default();
        cfg.devices = vec![SimDeviceProfile::new("sim://flat")
            .with_sensor(SimSensorProfile::new(SensorKind::Depth, 0, 480, 30))];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mode_and_flag_parsing() {
        assert_eq!(
            "Callback".parse::<AcquisitionMode>(),
            Ok(AcquisitionMode::Callback)
        );
        assert!("push".parse::<AcquisitionMode>().is_err());
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn hotplug_state_step_needs_a_state() {
        let mut cfg = DepthtapConfig::default();
        cfg.hotplug = vec![HotplugStep::state(10, "sim://depth/0", DeviceState::Error)];
        cfg.validate().unwrap();

        cfg.hotplug[0].state = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("needs a state"));
    }
}
