//! Timed hot-plug script for the simulated SDK.
//!
//! Each step fires `after_ms` milliseconds after the script starts. Steps run
//! in the order listed; a step whose time has already passed fires at once.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use super::{SimDeviceProfile, SimSdk};
use crate::sdk::DeviceState;
use crate::signal::StopSignal;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotplugAction {
    /// Reconnect a device unplugged earlier, or connect a new sensorless one.
    Plug,
    Unplug,
    /// Report `state` for a connected device.
    State,
}

impl fmt::Display for HotplugAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotplugAction::Plug => f.write_str("plug"),
            HotplugAction::Unplug => f.write_str("unplug"),
            HotplugAction::State => f.write_str("state"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugStep {
    #[serde(default)]
    pub after_ms: u64,
    pub action: HotplugAction,
    pub uri: String,
    /// Required for `state` steps, ignored otherwise.
    #[serde(default)]
    pub state: Option<DeviceState>,
}

impl HotplugStep {
    pub fn plug(after_ms: u64, uri: impl Into<String>) -> Self {
        Self {
            after_ms,
            action: HotplugAction::Plug,
            uri: uri.into(),
            state: None,
        }
    }

    pub fn unplug(after_ms: u64, uri: impl Into<String>) -> Self {
        Self {
            after_ms,
            action: HotplugAction::Unplug,
            uri: uri.into(),
            state: None,
        }
    }

    pub fn state(after_ms: u64, uri: impl Into<String>, state: DeviceState) -> Self {
        Self {
            after_ms,
            action: HotplugAction::State,
            uri: uri.into(),
            state: Some(state),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.uri.trim().is_empty() {
            return Err(format!("hotplug {} step needs a device uri", self.action));
        }
        if self.action == HotplugAction::State && self.state.is_none() {
            return Err(format!("hotplug state step for {} needs a state", self.uri));
        }
        Ok(())
    }
}

impl SimSdk {
    /// Apply one step now. Returns false when the step names an unknown
    /// device or lacks a state.
    pub fn apply_hotplug(&self, step: &HotplugStep) -> bool {
        match step.action {
            HotplugAction::Plug => {
                if !self.replug(&step.uri) {
                    self.plug(SimDeviceProfile::new(step.uri.clone()));
                }
                true
            }
            HotplugAction::Unplug => self.unplug(&step.uri),
            HotplugAction::State => match step.state {
                Some(state) => self.report_state(&step.uri, state),
                None => false,
            },
        }
    }
}

/// Play `steps` against `sdk` until done or `stop` is raised.
///
/// Returns the number of steps applied.
pub fn run_hotplug_script(sdk: &SimSdk, steps: &[HotplugStep], stop: &StopSignal) -> usize {
    let started = Instant::now();
    let mut applied = 0;
    for step in steps {
        let due = started + Duration::from_millis(step.after_ms);
        if stop.wait_timeout(due.saturating_duration_since(Instant::now())) {
            break;
        }
        if sdk.apply_hotplug(step) {
            applied += 1;
        } else {
            log::warn!("hotplug {} skipped: no device {}", step.action, step.uri);
        }
    }
    log::debug!("hotplug script applied {} of {} step(s)", applied, steps.len());
    applied
}
