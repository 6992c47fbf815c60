//! Session setup: initialize the SDK, open a device, attach a stream.
//!
//! Each setup failure maps to its own process exit code so scripted callers
//! can tell them apart. The session owns its resources in teardown order:
//! the stream is destroyed first, then the device is closed, then the SDK is
//! shut down.

use std::sync::Arc;

use crate::dispatcher::{AcquireError, AcquisitionDispatcher};
use crate::sdk::{DeviceHandle, DeviceInfo, SdkError, SdkSession, SensorKind, SensorSdk};

/// Clean shutdown.
pub const EXIT_OK: i32 = 0;
pub const EXIT_INIT_FAILED: i32 = 1;
pub const EXIT_OPEN_FAILED: i32 = 2;
pub const EXIT_CREATE_FAILED: i32 = 3;
pub const EXIT_START_FAILED: i32 = 4;
pub const EXIT_SENSOR_MISSING: i32 = 5;
/// Configuration or environment problems outside the setup taxonomy.
pub const EXIT_USAGE: i32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupFailure {
    #[error("initialize failed\n{0}")]
    Init(SdkError),

    #[error("couldn't open device\n{0}")]
    OpenDevice(SdkError),

    #[error("device has no {0} sensor")]
    SensorUnavailable(SensorKind),

    #[error("couldn't create {kind} stream\n{diagnostic}")]
    CreateStream { kind: SensorKind, diagnostic: String },

    #[error("couldn't start {kind} stream\n{diagnostic}")]
    StartStream { kind: SensorKind, diagnostic: String },
}

impl SetupFailure {
    pub fn exit_code(&self) -> i32 {
        match self {
            SetupFailure::Init(_) => EXIT_INIT_FAILED,
            SetupFailure::OpenDevice(_) => EXIT_OPEN_FAILED,
            SetupFailure::CreateStream { .. } => EXIT_CREATE_FAILED,
            SetupFailure::StartStream { .. } => EXIT_START_FAILED,
            SetupFailure::SensorUnavailable(_) => EXIT_SENSOR_MISSING,
        }
    }

    fn from_attach(kind: SensorKind, err: AcquireError) -> Self {
        match err {
            AcquireError::SensorUnavailable(kind) => SetupFailure::SensorUnavailable(kind),
            AcquireError::StartFailed(diagnostic) => {
                SetupFailure::StartStream { kind, diagnostic }
            }
            other => SetupFailure::CreateStream {
                kind,
                diagnostic: match other {
                    AcquireError::CreateFailed(diagnostic) => diagnostic,
                    other => other.to_string(),
                },
            },
        }
    }
}

/// Initialize the SDK just long enough to list the connected devices.
///
/// Both an initialize and an enumerate failure report as `Init`, so listing
/// exits with the same code as a session whose SDK would not start.
pub fn list_devices(sdk: Arc<dyn SensorSdk>) -> Result<Vec<DeviceInfo>, SetupFailure> {
    let session = SdkSession::initialize(sdk).map_err(SetupFailure::Init)?;
    session
        .sdk()
        .enumerate_devices()
        .map_err(SetupFailure::Init)
}

/// An initialized SDK with one open device and one started stream.
///
/// Field order is drop order.
pub struct AcquisitionSession {
    dispatcher: AcquisitionDispatcher,
    device: DeviceHandle,
    sdk: SdkSession,
}

impl AcquisitionSession {
    /// Open `uri`, or any device when `None`, and attach to `kind`.
    pub fn open(
        sdk: Arc<dyn SensorSdk>,
        uri: Option<&str>,
        kind: SensorKind,
    ) -> Result<Self, SetupFailure> {
        let sdk = SdkSession::initialize(sdk).map_err(SetupFailure::Init)?;
        let mut device = sdk.open_device(uri).map_err(SetupFailure::OpenDevice)?;
        let dispatcher = AcquisitionDispatcher::attach(&mut *device, kind)
            .map_err(|err| SetupFailure::from_attach(kind, err))?;
        Ok(Self {
            dispatcher,
            device,
            sdk,
        })
    }

    pub fn dispatcher(&mut self) -> &mut AcquisitionDispatcher {
        &mut self.dispatcher
    }

    pub fn device_info(&self) -> &DeviceInfo {
        self.device.info()
    }

    pub fn sdk(&self) -> Arc<dyn SensorSdk> {
        self.sdk.sdk().clone()
    }

    /// Tear down in order. Equivalent to dropping the session.
    pub fn close(mut self) {
        self.dispatcher.detach();
    }
}
