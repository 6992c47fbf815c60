//! Simulated sensor SDK.
//!
//! `SimSdk` implements the SDK traits without hardware:
//! - devices and sensors come from serde-deserializable profiles
//! - streams produce frames on a fixed clock from a per-sensor format script
//! - failure injection for init, stream create and stream start
//! - hot-plug injection (`plug`, `unplug`, `report_state`), directly or from
//!   a timed script
//!
//! Connectivity events are queued under the hub lock and delivered by a
//! single event thread, so events for one device keep their order.

mod script;
mod stream;

pub use script::{run_hotplug_script, HotplugAction, HotplugStep};
pub use stream::SimStream;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::frame::PixelFormat;
use crate::gate::relock;
use crate::monitor::ConnectivityEvent;
use crate::sdk::{
    ConnectivityListener, DeviceInfo, DeviceState, ListenerId, SdkError, SensorDevice, SensorKind,
    SensorSdk, SensorStream,
};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_BASE_DEPTH_MM: u16 = 1000;

// ----------------------------------------------------------------------------
// Profiles
// ----------------------------------------------------------------------------

/// One simulated sensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimSensorProfile {
    pub kind: SensorKind,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Frames per second. Zero means the sensor never produces data.
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Formats cycled per frame index. Empty selects the sensor's native format.
    #[serde(default)]
    pub formats: Vec<PixelFormat>,
    #[serde(default = "default_base_depth")]
    pub base_depth_mm: u16,
    /// Upper bound of uniform noise added to each depth pixel.
    #[serde(default)]
    pub noise: u16,
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_fps() -> u32 {
    DEFAULT_FPS
}

fn default_base_depth() -> u16 {
    DEFAULT_BASE_DEPTH_MM
}

impl SimSensorProfile {
    pub fn new(kind: SensorKind, width: u32, height: u32, fps: u32) -> Self {
        Self {
            kind,
            width,
            height,
            fps,
            formats: Vec::new(),
            base_depth_mm: DEFAULT_BASE_DEPTH_MM,
            noise: 0,
        }
    }

    pub fn with_formats(mut self, formats: Vec<PixelFormat>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_base_depth(mut self, base_depth_mm: u16) -> Self {
        self.base_depth_mm = base_depth_mm;
        self
    }

    pub fn native_format(&self) -> PixelFormat {
        match self.kind {
            SensorKind::Depth => PixelFormat::Depth1Mm,
            SensorKind::Color => PixelFormat::Rgb888,
            SensorKind::Ir => PixelFormat::Gray16,
        }
    }

    /// Formats in delivery order; never empty.
    pub fn format_script(&self) -> Vec<PixelFormat> {
        if self.formats.is_empty() {
            vec![self.native_format()]
        } else {
            self.formats.clone()
        }
    }

    /// Noise-free depth of frame `index`: a slow ramp above the base depth.
    pub fn depth_at(&self, index: u64) -> u16 {
        self.base_depth_mm.saturating_add((index % 64) as u16)
    }
}

/// One simulated device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimDeviceProfile {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub usb_vendor_id: u16,
    #[serde(default)]
    pub usb_product_id: u16,
    #[serde(default)]
    pub sensors: Vec<SimSensorProfile>,
    /// Every `create_stream` on this device fails.
    #[serde(default)]
    pub fail_create: bool,
    /// Every stream created on this device fails to start.
    #[serde(default)]
    pub fail_start: bool,
}

impl SimDeviceProfile {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: "Simulated depth sensor".to_string(),
            vendor: "depthtap".to_string(),
            usb_vendor_id: 0,
            usb_product_id: 0,
            sensors: Vec::new(),
            fail_create: false,
            fail_start: false,
        }
    }

    pub fn with_sensor(mut self, sensor: SimSensorProfile) -> Self {
        self.sensors.push(sensor);
        self
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            uri: self.uri.clone(),
            name: self.name.clone(),
            vendor: self.vendor.clone(),
            usb_vendor_id: self.usb_vendor_id,
            usb_product_id: self.usb_product_id,
        }
    }

    fn sensor(&self, kind: SensorKind) -> Option<&SimSensorProfile> {
        self.sensors.iter().find(|sensor| sensor.kind == kind)
    }
}

/// A VGA depth + color device at 30 fps.
pub fn default_profiles() -> Vec<SimDeviceProfile> {
    vec![SimDeviceProfile::new("sim://depth/0")
        .with_sensor(SimSensorProfile::new(
            SensorKind::Depth,
            DEFAULT_WIDTH,
            DEFAULT_HEIGHT,
            DEFAULT_FPS,
        ))
        .with_sensor(SimSensorProfile::new(
            SensorKind::Color,
            DEFAULT_WIDTH,
            DEFAULT_HEIGHT,
            DEFAULT_FPS,
        ))]
}

// ----------------------------------------------------------------------------
// SimSdk
// ----------------------------------------------------------------------------

struct HubState {
    initialized: bool,
    init_failure: Option<String>,
    devices: Vec<SimDeviceProfile>,
    /// Profiles of unplugged devices, kept so they can be plugged back in.
    detached: Vec<SimDeviceProfile>,
    listeners: Vec<(ListenerId, Arc<dyn ConnectivityListener>)>,
    next_listener: u64,
    events: Option<mpsc::Sender<ConnectivityEvent>>,
    worker: Option<JoinHandle<()>>,
}

struct Hub {
    state: Mutex<HubState>,
    open_devices: AtomicUsize,
}

impl Hub {
    fn publish(state: &HubState, event: ConnectivityEvent) {
        if let Some(events) = &state.events {
            // A closed channel means the SDK is shutting down.
            let _ = events.send(event);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectivityListener>> {
        relock(&self.state)
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

fn run_event_thread(hub: Weak<Hub>, events: mpsc::Receiver<ConnectivityEvent>) {
    while let Ok(event) = events.recv() {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        for listener in hub.listeners() {
            event.dispatch(listener.as_ref());
        }
    }
}

/// In-process SDK backed by device profiles.
#[derive(Clone)]
pub struct SimSdk {
    hub: Arc<Hub>,
}

impl SimSdk {
    pub fn new(profiles: Vec<SimDeviceProfile>) -> Self {
        Self {
            hub: Arc::new(Hub {
                state: Mutex::new(HubState {
                    initialized: false,
                    init_failure: None,
                    devices: profiles,
                    detached: Vec::new(),
                    listeners: Vec::new(),
                    next_listener: 1,
                    events: None,
                    worker: None,
                }),
                open_devices: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `initialize` fail with `reason`.
    pub fn fail_next_initialize(&self, reason: impl Into<String>) {
        relock(&self.hub.state).init_failure = Some(reason.into());
    }

    pub fn is_initialized(&self) -> bool {
        relock(&self.hub.state).initialized
    }

    pub fn open_device_count(&self) -> usize {
        self.hub.open_devices.load(Ordering::SeqCst)
    }

    /// Connect a device, replacing any device with the same URI.
    pub fn plug(&self, profile: SimDeviceProfile) {
        let mut state = relock(&self.hub.state);
        let info = profile.info();
        state.devices.retain(|device| device.uri != profile.uri);
        state.detached.retain(|device| device.uri != profile.uri);
        state.devices.push(profile);
        log::debug!("sim device {} plugged", info.uri);
        Hub::publish(&state, ConnectivityEvent::Connected(info));
    }

    /// Disconnect a device. Returns false when no such device is connected.
    pub fn unplug(&self, uri: &str) -> bool {
        let mut state = relock(&self.hub.state);
        let Some(position) = state.devices.iter().position(|device| device.uri == uri) else {
            return false;
        };
        let profile = state.devices.remove(position);
        log::debug!("sim device {} unplugged", uri);
        Hub::publish(&state, ConnectivityEvent::Disconnected(profile.info()));
        state.detached.push(profile);
        true
    }

    /// Reconnect a device removed by `unplug`, with its original profile.
    pub fn replug(&self, uri: &str) -> bool {
        let profile = {
            let mut state = relock(&self.hub.state);
            let Some(position) = state.detached.iter().position(|device| device.uri == uri) else {
                return false;
            };
            state.detached.remove(position)
        };
        self.plug(profile);
        true
    }

    /// Emit a state change for a connected device.
    pub fn report_state(&self, uri: &str, device_state: DeviceState) -> bool {
        let state = relock(&self.hub.state);
        let Some(profile) = state.devices.iter().find(|device| device.uri == uri) else {
            return false;
        };
        let info = profile.info();
        Hub::publish(&state, ConnectivityEvent::StateChanged(info, device_state));
        true
    }
}

impl Default for SimSdk {
    fn default() -> Self {
        Self::new(default_profiles())
    }
}

impl SensorSdk for SimSdk {
    fn initialize(&self) -> Result<(), SdkError> {
        let mut state = relock(&self.hub.state);
        if state.initialized {
            return Err(SdkError::AlreadyInitialized);
        }
        if let Some(reason) = state.init_failure.take() {
            return Err(SdkError::Failed(reason));
        }

        let (tx, rx) = mpsc::channel();
        let hub = Arc::downgrade(&self.hub);
        let worker = std::thread::Builder::new()
            .name("sim-connectivity".to_string())
            .spawn(move || run_event_thread(hub, rx))
            .map_err(|err| SdkError::Failed(format!("spawn event thread: {}", err)))?;

        state.events = Some(tx);
        state.worker = Some(worker);
        state.initialized = true;
        log::info!(
            "sim sdk initialized ({} device(s) connected)",
            state.devices.len()
        );
        Ok(())
    }

    fn shutdown(&self) {
        let (events, worker) = {
            let mut state = relock(&self.hub.state);
            if !state.initialized {
                return;
            }
            state.initialized = false;
            state.listeners.clear();
            (state.events.take(), state.worker.take())
        };
        let open = self.open_device_count();
        if open > 0 {
            log::warn!("sim sdk shut down with {} device(s) still open", open);
        }

        drop(events);
        if let Some(worker) = worker {
            if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
                log::error!("sim connectivity thread panicked");
            }
        }
        log::info!("sim sdk shut down");
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, SdkError> {
        let state = relock(&self.hub.state);
        if !state.initialized {
            return Err(SdkError::NotInitialized);
        }
        Ok(state.devices.iter().map(SimDeviceProfile::info).collect())
    }

    fn open_device(&self, uri: Option<&str>) -> Result<Box<dyn SensorDevice>, SdkError> {
        let state = relock(&self.hub.state);
        if !state.initialized {
            return Err(SdkError::NotInitialized);
        }
        let profile = match uri {
            None => state.devices.first().ok_or(SdkError::NoDevice)?,
            Some(uri) => state
                .devices
                .iter()
                .find(|device| device.uri == uri)
                .ok_or_else(|| SdkError::DeviceNotFound(uri.to_string()))?,
        };

        self.hub.open_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimDevice {
            info: profile.info(),
            profile: profile.clone(),
            hub: self.hub.clone(),
            live_streams: Arc::new(AtomicUsize::new(0)),
            closed: false,
        }))
    }

    fn add_connectivity_listener(
        &self,
        listener: Arc<dyn ConnectivityListener>,
    ) -> Result<ListenerId, SdkError> {
        let mut state = relock(&self.hub.state);
        if !state.initialized {
            return Err(SdkError::NotInitialized);
        }
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, listener));
        Ok(id)
    }

    fn remove_connectivity_listener(&self, id: ListenerId) {
        relock(&self.hub.state)
            .listeners
            .retain(|(existing, _)| *existing != id);
    }
}

// ----------------------------------------------------------------------------
// SimDevice
// ----------------------------------------------------------------------------

/// Device opened from a `SimSdk`.
pub struct SimDevice {
    info: DeviceInfo,
    profile: SimDeviceProfile,
    hub: Arc<Hub>,
    live_streams: Arc<AtomicUsize>,
    closed: bool,
}

impl SensorDevice for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn has_sensor(&self, kind: SensorKind) -> bool {
        self.profile.sensor(kind).is_some()
    }

    fn create_stream(&mut self, kind: SensorKind) -> Result<Box<dyn SensorStream>, SdkError> {
        if self.closed {
            return Err(SdkError::InvalidState("device closed"));
        }
        if self.profile.fail_create {
            return Err(SdkError::Failed(format!(
                "simulated stream creation failure on {}",
                self.info.uri
            )));
        }
        let sensor = self.profile.sensor(kind).ok_or(SdkError::NoSensor(kind))?;
        Ok(Box::new(SimStream::new(
            sensor.clone(),
            self.info.uri.clone(),
            self.profile.fail_start,
            self.live_streams.clone(),
        )))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        let live = self.live_streams.load(Ordering::SeqCst);
        if live > 0 {
            log::warn!(
                "device {} closed with {} stream(s) not destroyed",
                self.info.uri,
                live
            );
        }
        self.closed = true;
        self.hub.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_require_initialize() {
        let sdk = SimSdk::default();
        assert_eq!(sdk.enumerate_devices(), Err(SdkError::NotInitialized));
        assert!(matches!(
            sdk.open_device(None),
            Err(SdkError::NotInitialized)
        ));

        sdk.initialize().unwrap();
        assert_eq!(sdk.initialize(), Err(SdkError::AlreadyInitialized));
        sdk.shutdown();
        assert!(!sdk.is_initialized());
    }

    #[test]
    fn injected_init_failure_fires_once() {
        let sdk = SimSdk::default();
        sdk.fail_next_initialize("driver not found");
        assert_eq!(
            sdk.initialize(),
            Err(SdkError::Failed("driver not found".into()))
        );
        sdk.initialize().unwrap();
        sdk.shutdown();
    }

    #[test]
    fn open_any_picks_first_device() {
        let sdk = SimSdk::new(vec![
            SimDeviceProfile::new("sim://a"),
            SimDeviceProfile::new("sim://b"),
        ]);
        sdk.initialize().unwrap();

        let any = sdk.open_device(None).unwrap();
        assert_eq!(any.info().uri, "sim://a");
        let by_uri = sdk.open_device(Some("sim://b")).unwrap();
        assert_eq!(by_uri.info().uri, "sim://b");
        assert!(matches!(
            sdk.open_device(Some("sim://missing")),
            Err(SdkError::DeviceNotFound(uri)) if uri == "sim://missing"
        ));
        assert_eq!(sdk.open_device_count(), 2);

        drop(any);
        drop(by_uri);
        assert_eq!(sdk.open_device_count(), 0);
        sdk.shutdown();
    }

    #[test]
    fn open_any_without_devices_fails() {
        let sdk = SimSdk::new(vec![]);
        sdk.initialize().unwrap();
        assert!(matches!(sdk.open_device(None), Err(SdkError::NoDevice)));
        sdk.shutdown();
    }

    #[test]
    fn missing_sensor_is_reported() {
        let sdk = SimSdk::new(vec![SimDeviceProfile::new("sim://color-only")
            .with_sensor(SimSensorProfile::new(SensorKind::Color, 4, 4, 30))]);
        sdk.initialize().unwrap();

        let mut device = sdk.open_device(None).unwrap();
        assert!(!device.has_sensor(SensorKind::Depth));
        assert!(matches!(
            device.create_stream(SensorKind::Depth),
            Err(SdkError::NoSensor(SensorKind::Depth))
        ));
        device.close();
        sdk.shutdown();
    }

    #[test]
    fn profiles_deserialize_with_defaults() {
        let json = r#"{
            "uri": "sim://kinect",
            "sensors": [
                { "kind": "depth", "formats": ["depth_100_um"] },
                { "kind": "ir", "fps": 0 }
            ]
        }"#;
        let profile: SimDeviceProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.sensors.len(), 2);
        assert_eq!(profile.sensors[0].width, 640);
        assert_eq!(profile.sensors[0].fps, 30);
        assert_eq!(
            profile.sensors[0].format_script(),
            vec![PixelFormat::Depth100Um]
        );
        assert_eq!(profile.sensors[1].fps, 0);
        assert_eq!(profile.sensors[1].format_script(), vec![PixelFormat::Gray16]);
        assert!(!profile.fail_start);
    }

    #[test]
    fn replug_restores_the_unplugged_profile() {
        let sdk = SimSdk::default();
        sdk.initialize().unwrap();
        assert!(!sdk.replug("sim://depth/0"));

        assert!(sdk.unplug("sim://depth/0"));
        assert!(sdk.enumerate_devices().unwrap().is_empty());
        assert!(sdk.replug("sim://depth/0"));
        assert!(!sdk.replug("sim://depth/0"));

        let device = sdk.open_device(Some("sim://depth/0")).unwrap();
        assert!(device.has_sensor(SensorKind::Depth));
        assert!(device.has_sensor(SensorKind::Color));
        drop(device);
        sdk.shutdown();
    }
}
