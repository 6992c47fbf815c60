use std::sync::Arc;
use std::time::Duration;

use depthtap::setup::{
    list_devices, EXIT_CREATE_FAILED, EXIT_INIT_FAILED, EXIT_OPEN_FAILED, EXIT_SENSOR_MISSING,
    EXIT_START_FAILED,
};
use depthtap::{
    AcquisitionSession, SdkError, SensorKind, SensorSdk, SetupFailure, SimDeviceProfile, SimSdk,
    SimSensorProfile, StreamState,
};

fn color_only(uri: &str) -> SimDeviceProfile {
    SimDeviceProfile::new(uri).with_sensor(SimSensorProfile::new(SensorKind::Color, 640, 480, 30))
}

fn open(
    sdk: &SimSdk,
    uri: Option<&str>,
    kind: SensorKind,
) -> Result<AcquisitionSession, SetupFailure> {
    AcquisitionSession::open(Arc::new(sdk.clone()), uri, kind)
}

fn assert_released(sdk: &SimSdk) {
    assert_eq!(sdk.open_device_count(), 0);
    assert!(!sdk.is_initialized());
}

#[test]
fn missing_depth_sensor_exits_with_its_own_code() {
    let sdk = SimSdk::new(vec![color_only("sim://rgb/0")]);
    let failure = open(&sdk, None, SensorKind::Depth).err().expect("setup must fail");

    assert_eq!(failure, SetupFailure::SensorUnavailable(SensorKind::Depth));
    assert_eq!(failure.exit_code(), EXIT_SENSOR_MISSING);
    assert_released(&sdk);
}

#[test]
fn init_failure_exits_with_code_1() {
    let sdk = SimSdk::default();
    sdk.fail_next_initialize("driver not loaded");
    let failure = open(&sdk, None, SensorKind::Depth).err().expect("setup must fail");

    assert_eq!(failure.exit_code(), EXIT_INIT_FAILED);
    assert!(failure.to_string().contains("driver not loaded"));
    assert_released(&sdk);
}

#[test]
fn listing_devices_after_init_failure_exits_with_code_1() {
    let sdk = SimSdk::default();
    sdk.fail_next_initialize("usb subsystem unavailable");
    let failure = list_devices(Arc::new(sdk.clone())).expect_err("listing must fail");

    assert_eq!(failure.exit_code(), EXIT_INIT_FAILED);
    assert!(failure.to_string().starts_with("initialize failed"));
    assert_released(&sdk);

    let devices = list_devices(Arc::new(sdk.clone())).expect("second attempt lists");
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].uri, "sim://depth/0");
    assert_released(&sdk);
}

#[test]
fn open_failures_exit_with_code_2() {
    let sdk = SimSdk::default();
    let failure = open(&sdk, Some("sim://nowhere"), SensorKind::Depth)
        .err()
        .expect("setup must fail");
    assert_eq!(
        failure,
        SetupFailure::OpenDevice(SdkError::DeviceNotFound("sim://nowhere".into()))
    );
    assert_eq!(failure.exit_code(), EXIT_OPEN_FAILED);
    assert_released(&sdk);

    let empty = SimSdk::new(Vec::new());
    let failure = open(&empty, None, SensorKind::Depth).err().expect("setup must fail");
    assert_eq!(failure, SetupFailure::OpenDevice(SdkError::NoDevice));
    assert_released(&empty);
}

#[test]
fn stream_create_failure_exits_with_code_3() {
    let mut profile = color_only("sim://rgb/0");
    profile.fail_create = true;
    let sdk = SimSdk::new(vec![profile]);
    let failure = open(&sdk, None, SensorKind::Color).err().expect("setup must fail");

    assert!(matches!(
        failure,
        SetupFailure::CreateStream {
            kind: SensorKind::Color,
            ..
        }
    ));
    assert_eq!(failure.exit_code(), EXIT_CREATE_FAILED);
    assert_released(&sdk);
}

#[test]
fn stream_start_failure_exits_with_code_4() {
    let mut profile = color_only("sim://rgb/0");
    profile.fail_start = true;
    let sdk = SimSdk::new(vec![profile]);
    let failure = open(&sdk, Some("sim://rgb/0"), SensorKind::Color)
        .err()
        .expect("setup must fail");

    assert_eq!(failure.exit_code(), EXIT_START_FAILED);
    assert_released(&sdk);
}

#[test]
fn successful_setup_streams_until_closed() {
    let sdk = SimSdk::default();
    let mut session = open(&sdk, Some("sim://depth/0"), SensorKind::Color).expect("setup");

    assert_eq!(session.device_info().uri, "sim://depth/0");
    assert_eq!(session.dispatcher().state(), StreamState::Started);
    assert_eq!(session.dispatcher().sensor_kind(), SensorKind::Color);
    assert!(session
        .dispatcher()
        .poll_once(Duration::from_secs(2))
        .is_ok());
    assert_eq!(session.sdk().enumerate_devices().unwrap().len(), 1);
    assert_eq!(sdk.open_device_count(), 1);

    session.close();
    assert_released(&sdk);
}
