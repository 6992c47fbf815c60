use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use depthtap::config::{AcquisitionMode, DepthtapConfig};
use depthtap::{DeviceState, HotplugStep, PixelFormat, SensorKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "DEPTHTAP_CONFIG",
        "DEPTHTAP_DEVICE_URI",
        "DEPTHTAP_SENSOR",
        "DEPTHTAP_MODE",
        "DEPTHTAP_POLL_TIMEOUT_MS",
        "DEPTHTAP_MONITOR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DepthtapConfig::load().expect("load config");
    assert_eq!(cfg.device_uri, None);
    assert_eq!(cfg.sensor, SensorKind::Depth);
    assert_eq!(cfg.mode, AcquisitionMode::Poll);
    assert_eq!(cfg.poll_timeout, Duration::from_millis(2000));
    assert!(!cfg.monitor_devices);
    assert_eq!(cfg.devices[0].uri, "sim://depth/0");
    assert_eq!(cfg.devices[0].sensors.len(), 2);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "device_uri": "sim://bench/1",
        "sensor": "color",
        "mode": "callback",
        "poll_timeout_ms": 500,
        "devices": [
            {
                "uri": "sim://bench/1",
                "name": "Bench rig",
                "usb_vendor_id": 7463,
                "sensors": [
                    { "kind": "color", "width": 320, "height": 240, "fps": 15 },
                    { "kind": "depth", "formats": ["depth_100_um"] }
                ]
            }
        ]
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("DEPTHTAP_CONFIG", file.path());
    std::env::set_var("DEPTHTAP_MODE", "poll");
    std::env::set_var("DEPTHTAP_MONITOR", "1");

    let cfg = DepthtapConfig::load().expect("load config");

    assert_eq!(cfg.device_uri.as_deref(), Some("sim://bench/1"));
    assert_eq!(cfg.sensor, SensorKind::Color);
    assert_eq!(cfg.mode, AcquisitionMode::Poll);
    assert_eq!(cfg.poll_timeout, Duration::from_millis(500));
    assert!(cfg.monitor_devices);

    let device = &cfg.devices[0];
    assert_eq!(device.name, "Bench rig");
    assert_eq!(device.usb_vendor_id, 7463);
    assert_eq!(device.sensors[0].width, 320);
    assert_eq!(device.sensors[0].fps, 15);
    assert_eq!(device.sensors[1].width, 640);
    assert_eq!(device.sensors[1].formats, vec![PixelFormat::Depth100Um]);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
sensor = "ir"
poll_timeout_ms = 250

[[devices]]
uri = "sim://ir/0"

[[devices.sensors]]
kind = "ir"
fps = 60
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("DEPTHTAP_CONFIG", file.path());

    let cfg = DepthtapConfig::load().expect("load config");
    assert_eq!(cfg.sensor, SensorKind::Ir);
    assert_eq!(cfg.poll_timeout, Duration::from_millis(250));
    assert_eq!(cfg.devices.len(), 1);
    assert_eq!(cfg.devices[0].sensors[0].fps, 60);

    clear_env();
}

#[test]
fn rejects_invalid_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("DEPTHTAP_POLL_TIMEOUT_MS", "soon");
    assert!(DepthtapConfig::load().is_err());

    std::env::set_var("DEPTHTAP_POLL_TIMEOUT_MS", "0");
    let err = DepthtapConfig::load().unwrap_err();
    assert!(err.to_string().contains("greater than zero"));

    clear_env();
    std::env::set_var("DEPTHTAP_SENSOR", "thermal");
    assert!(DepthtapConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_duplicate_device_uris() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "devices": [ { "uri": "sim://a" }, { "uri": "sim://a" } ] }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("DEPTHTAP_CONFIG", file.path());

    let err = DepthtapConfig::load().unwrap_err();
    assert!(err.to_string().contains("duplicate device uri sim://a"));

    clear_env();
}

#[test]
fn loads_hotplug_script_from_toml() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
monitor = true

[[hotplug]]
after_ms = 300
action = "state"
uri = "sim://depth/0"
state = "not_ready"

[[hotplug]]
after_ms = 600
action = "unplug"
uri = "sim://depth/0"

[[hotplug]]
after_ms = 900
action = "plug"
uri = "sim://depth/0"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("DEPTHTAP_CONFIG", file.path());

    let cfg = DepthtapConfig::load().expect("load config");
    assert!(cfg.monitor_devices);
    assert_eq!(
        cfg.hotplug,
        vec![
            HotplugStep::state(300, "sim://depth/0", DeviceState::NotReady),
            HotplugStep::unplug(600, "sim://depth/0"),
            HotplugStep::plug(900, "sim://depth/0"),
        ]
    );

    clear_env();
}

#[test]
fn rejects_hotplug_state_step_without_state() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "hotplug": [ { "action": "state", "uri": "sim://depth/0" } ] }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("DEPTHTAP_CONFIG", file.path());

    let err = DepthtapConfig::load().unwrap_err();
    assert!(err.to_string().contains("needs a state"));

    clear_env();
}
