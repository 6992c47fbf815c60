//! Sensor SDK abstraction.
//!
//! The vendor SDK is an external collaborator. This module names the small
//! surface the acquisition layer needs from it:
//! - process-wide initialize/shutdown
//! - device enumeration and open (by URI or "any device")
//! - per-sensor stream create/start/stop/destroy
//! - synchronous frame reads with a bounded wait
//! - a frame-listener slot driven by the SDK's delivery thread
//! - connectivity listeners for hot-plug notifications
//!
//! `SdkSession` and `DeviceHandle` are scope guards: dropping them shuts the
//! SDK down and closes the device, so teardown happens on every exit path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::VideoFrame;

/// Errors reported by an SDK implementation.
///
/// `Failed` carries the SDK's extended diagnostic string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdkError {
    #[error("sdk not initialized")]
    NotInitialized,

    #[error("sdk already initialized")]
    AlreadyInitialized,

    #[error("no device available")]
    NoDevice,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device has no {0} sensor")]
    NoSensor(SensorKind),

    #[error("wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid stream state: {0}")]
    InvalidState(&'static str),

    #[error("{0}")]
    Failed(String),
}

/// Sensor channels a device may expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Depth,
    Color,
    Ir,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorKind::Depth => "depth",
            SensorKind::Color => "color",
            SensorKind::Ir => "ir",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "depth" => Ok(SensorKind::Depth),
            "color" | "colour" | "rgb" => Ok(SensorKind::Color),
            "ir" | "infrared" => Ok(SensorKind::Ir),
            other => Err(format!("unknown sensor kind '{}'", other)),
        }
    }
}

/// Identifying record for a physical device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub uri: String,
    pub name: String,
    pub vendor: String,
    pub usb_vendor_id: u16,
    pub usb_product_id: u16,
}

impl DeviceInfo {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: String::new(),
            vendor: String::new(),
            usb_vendor_id: 0,
            usb_product_id: 0,
        }
    }
}

/// Device health condition carried by state-change events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Ok,
    Error,
    NotReady,
    Eof,
}

impl DeviceState {
    /// Numeric code as printed by connectivity event lines.
    pub fn code(&self) -> u8 {
        match self {
            DeviceState::Ok => 0,
            DeviceState::Error => 1,
            DeviceState::NotReady => 2,
            DeviceState::Eof => 3,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Identifier returned when a connectivity listener is registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Process-wide SDK entry points.
///
/// All methods take `&self` so the SDK can be shared as `Arc<dyn SensorSdk>`;
/// implementations use interior mutability.
pub trait SensorSdk: Send + Sync {
    /// Load drivers. Must succeed before any other call.
    fn initialize(&self) -> Result<(), SdkError>;

    /// Unload drivers. Every device must be closed first.
    fn shutdown(&self);

    /// Snapshot of the devices connected right now.
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, SdkError>;

    /// Open a device by URI, or any available device when `uri` is `None`.
    fn open_device(&self, uri: Option<&str>) -> Result<Box<dyn SensorDevice>, SdkError>;

    fn add_connectivity_listener(
        &self,
        listener: Arc<dyn ConnectivityListener>,
    ) -> Result<ListenerId, SdkError>;

    /// Remove a listener. Unknown ids are ignored.
    fn remove_connectivity_listener(&self, id: ListenerId);
}

/// An opened device.
pub trait SensorDevice: Send {
    fn info(&self) -> &DeviceInfo;

    fn has_sensor(&self, kind: SensorKind) -> bool;

    /// Create a stream for one sensor. The stream must be destroyed before
    /// the device is closed.
    fn create_stream(&mut self, kind: SensorKind) -> Result<Box<dyn SensorStream>, SdkError>;

    fn close(&mut self);
}

/// Synchronous frame access.
///
/// The returned frame borrows the reader's backing buffer, so it cannot be
/// held across the next read.
pub trait FrameReader {
    fn read_frame(&mut self) -> Result<VideoFrame<'_>, SdkError>;
}

/// One sensor's data channel.
pub trait SensorStream: FrameReader + Send {
    fn kind(&self) -> SensorKind;

    fn start(&mut self) -> Result<(), SdkError>;

    fn stop(&mut self);

    fn destroy(&mut self);

    /// Block until a frame is ready to read, or fail with
    /// `SdkError::Timeout` once `timeout` elapses.
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SdkError>;

    /// Install (`Some`) or remove (`None`) the frame listener.
    ///
    /// Removing the listener must not return while the SDK is still about to
    /// start a new delivery, unless called from the delivery thread itself.
    fn set_frame_listener(
        &mut self,
        listener: Option<Arc<dyn FrameListener>>,
    ) -> Result<(), SdkError>;
}

/// Invoked by the SDK's delivery thread once per new frame.
///
/// Delivery is not reentrant: the SDK waits for one call to return before
/// making the next.
pub trait FrameListener: Send + Sync {
    fn on_new_frame(&self, stream: &mut dyn FrameReader);
}

/// Hot-plug notifications, delivered off the caller's thread.
pub trait ConnectivityListener: Send + Sync {
    fn on_device_connected(&self, info: &DeviceInfo);
    fn on_device_disconnected(&self, info: &DeviceInfo);
    fn on_device_state_changed(&self, info: &DeviceInfo, state: DeviceState);
}

// ----------------------------------------------------------------------------
// Scope guards
// ----------------------------------------------------------------------------

/// Initialized SDK. Dropping the session shuts the SDK down.
pub struct SdkSession {
    sdk: Arc<dyn SensorSdk>,
}

impl SdkSession {
    pub fn initialize(sdk: Arc<dyn SensorSdk>) -> Result<Self, SdkError> {
        sdk.initialize()?;
        log::debug!("sensor sdk initialized");
        Ok(Self { sdk })
    }

    pub fn sdk(&self) -> &Arc<dyn SensorSdk> {
        &self.sdk
    }

    pub fn open_device(&self, uri: Option<&str>) -> Result<DeviceHandle, SdkError> {
        let device = self.sdk.open_device(uri)?;
        log::info!("opened device {}", device.info().uri);
        Ok(DeviceHandle::new(device))
    }
}

impl Drop for SdkSession {
    fn drop(&mut self) {
        self.sdk.shutdown();
        log::debug!("sensor sdk shut down");
    }
}

/// Opened device. Dropping the handle closes the device.
pub struct DeviceHandle {
    device: Box<dyn SensorDevice>,
}

impl DeviceHandle {
    pub fn new(device: Box<dyn SensorDevice>) -> Self {
        Self { device }
    }
}

impl Deref for DeviceHandle {
    type Target = dyn SensorDevice;

    fn deref(&self) -> &Self::Target {
        self.device.as_ref()
    }
}

impl DerefMut for DeviceHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.device.as_mut()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        log::debug!("closing device {}", self.device.info().uri);
        self.device.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_kind_parses_aliases() {
        assert_eq!("Depth".parse::<SensorKind>().unwrap(), SensorKind::Depth);
        assert_eq!("rgb".parse::<SensorKind>().unwrap(), SensorKind::Color);
        assert_eq!("infrared".parse::<SensorKind>().unwrap(), SensorKind::Ir);
        assert!("thermal".parse::<SensorKind>().is_err());
    }

    #[test]
    fn device_state_codes_are_stable() {
        assert_eq!(DeviceState::Ok.to_string(), "0");
        assert_eq!(DeviceState::Error.to_string(), "1");
        assert_eq!(DeviceState::NotReady.to_string(), "2");
        assert_eq!(DeviceState::Eof.to_string(), "3");
    }
}
