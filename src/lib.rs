//! depthtap: frame acquisition and device connectivity for depth cameras.
//!
//! The crate sits on top of a camera SDK abstraction (`sdk`) and provides:
//!
//! - `AcquisitionDispatcher`: one sensor stream, read either by polling with a
//!   timeout or through a frame callback. Each frame is reduced to a
//!   `DecodedSample`, the center pixel as a depth value or an RGB triplet.
//! - `DeviceConnectivityMonitor`: device enumeration and connect, disconnect
//!   and state-change notifications.
//! - `sim`: a simulated SDK with scripted devices, frame clocks, hot-plug and
//!   failure injection. It backs the `depthtap` binary and the tests.
//!
//! # Module Structure
//!
//! - `sdk`: SDK traits, error type and scoped guards for init and device close
//! - `frame`: borrowed frames, pixel formats and center-pixel decoding
//! - `dispatcher`, `monitor`: the two public components
//! - `setup`, `run`, `signal`, `console`: the session flow used by the binary
//! - `config`: file and environment configuration

pub mod config;
pub mod console;
pub mod dispatcher;
pub mod frame;
mod gate;
pub mod monitor;
pub mod run;
pub mod sdk;
pub mod setup;
pub mod signal;
pub mod sim;

pub use config::{AcquisitionMode, DepthtapConfig};
pub use console::{format_event, format_sample, ConsoleSink, SampleSink, VecSink, RAW_LINE_END};
pub use dispatcher::{
    read_and_decode, AcquireError, AcquisitionDispatcher, CallbackStats, StreamState,
};
pub use frame::{
    center_index, decode, DecodeError, DecodedSample, DepthUnit, PixelFormat, VideoFrame,
};
pub use monitor::{ConnectivityEvent, DeviceConnectivityMonitor};
pub use run::{run_callback, run_polling, RunOptions, RunStats};
pub use sdk::{
    ConnectivityListener, DeviceHandle, DeviceInfo, DeviceState, FrameListener, FrameReader,
    ListenerId, SdkError, SdkSession, SensorDevice, SensorKind, SensorSdk, SensorStream,
};
pub use setup::{AcquisitionSession, SetupFailure};
pub use signal::{KeyWatch, StopSignal};
pub use sim::{
    run_hotplug_script, HotplugAction, HotplugStep, SimDeviceProfile, SimSdk, SimSensorProfile,
};
