//! depthtap - read center-pixel samples from a depth camera
//!
//! This binary:
//! 1. Loads configuration (file, environment, then flags)
//! 2. Initializes the SDK and opens the requested device
//! 3. Attaches to one sensor stream and prints one line per frame, by polling
//!    or from the SDK's frame callback
//! 4. Optionally prints the connected devices and later connect, disconnect
//!    and state events, while playing the configured hot-plug script
//! 5. Stops on Ctrl-C, any key, or after `--frames` samples
//!
//! Setup failures exit with distinct codes (see `depthtap::setup`).

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use depthtap::setup::{list_devices, EXIT_OK, EXIT_USAGE};
use depthtap::{
    format_event, run_callback, run_hotplug_script, run_polling, AcquisitionMode,
    AcquisitionSession, ConnectivityEvent, ConsoleSink, DepthtapConfig, DeviceConnectivityMonitor,
    RunOptions, RunStats, SensorKind, SimSdk, StopSignal, RAW_LINE_END,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Print center-pixel depth or color samples from a depth camera"
)]
struct Args {
    /// Device URI to open. Opens the first device found when omitted.
    #[arg(value_name = "URI")]
    uri: Option<String>,

    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "DEPTHTAP_CONFIG")]
    config: Option<PathBuf>,

    /// Acquisition mode (poll|callback).
    #[arg(long, value_name = "MODE")]
    mode: Option<AcquisitionMode>,

    /// Sensor to stream (depth|color|ir).
    #[arg(long)]
    sensor: Option<SensorKind>,

    /// Poll timeout in milliseconds.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Stop after this many samples.
    #[arg(long, value_name = "N")]
    frames: Option<u64>,

    /// Print connected devices, then connectivity events while streaming.
    #[arg(long)]
    monitor: bool,

    /// List connected devices and exit.
    #[arg(long)]
    list: bool,

    /// With --list, print JSON.
    #[arg(long, requires = "list")]
    json: bool,
}

fn main() {
    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if std::io::stdin().is_terminal() {
        // The key watcher puts the terminal in raw mode.
        logger.format_suffix(RAW_LINE_END);
    }
    logger.init();

    let code = match run(Args::parse()) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<i32> {
    let cfg = load_config(&args)?;
    let sdk = SimSdk::new(cfg.devices.clone());

    if args.list {
        return print_devices(sdk, args.json);
    }

    let mut session = match AcquisitionSession::open(
        Arc::new(sdk.clone()),
        cfg.device_uri.as_deref(),
        cfg.sensor,
    ) {
        Ok(session) => session,
        Err(failure) => {
            log::error!("{}", failure);
            return Ok(failure.exit_code());
        }
    };
    log::info!(
        "streaming {} from {} in {} mode",
        cfg.sensor,
        session.device_info().uri,
        cfg.mode
    );

    let stop = StopSignal::new();
    let keys = stop.install()?;
    let line_end = if keys.is_raw_terminal() {
        RAW_LINE_END
    } else {
        "\n"
    };

    let mut monitor = DeviceConnectivityMonitor::new(session.sdk());
    if cfg.monitor_devices {
        for info in monitor.enumerate().context("enumerate devices")? {
            print_event(ConnectivityEvent::Connected(info), line_end);
        }
        monitor
            .subscribe(
                move |info| print_event(ConnectivityEvent::Connected(info.clone()), line_end),
                move |info| print_event(ConnectivityEvent::Disconnected(info.clone()), line_end),
                move |info, state| {
                    print_event(ConnectivityEvent::StateChanged(info.clone(), state), line_end)
                },
            )
            .context("subscribe to device events")?;
    }

    let script_stop = StopSignal::new();
    let script = if cfg.hotplug.is_empty() {
        None
    } else {
        let steps = cfg.hotplug.clone();
        let script_sdk = sdk.clone();
        let stop_script = script_stop.clone();
        let handle = std::thread::Builder::new()
            .name("sim-hotplug".to_string())
            .spawn(move || run_hotplug_script(&script_sdk, &steps, &stop_script))
            .context("spawn hotplug script")?;
        Some(handle)
    };

    let options = RunOptions {
        poll_timeout: cfg.poll_timeout,
        max_samples: args.frames,
    };
    let result = match cfg.mode {
        AcquisitionMode::Poll => {
            let mut sink = ConsoleSink::stdout().raw_terminal(keys.is_raw_terminal());
            run_polling(session.dispatcher(), &options, &stop, &mut sink)
        }
        AcquisitionMode::Callback => {
            let sink = ConsoleSink::stdout().raw_terminal(keys.is_raw_terminal());
            run_callback(session.dispatcher(), &options, &stop, Arc::new(Mutex::new(sink)))
        }
    };

    script_stop.raise();
    if let Some(script) = script {
        if script.join().is_err() {
            log::error!("hotplug script panicked");
        }
    }
    monitor.unsubscribe();
    session.close();
    drop(keys);

    let stats: RunStats = result.context("acquisition stopped")?;
    log::info!(
        "{} samples, {} timeouts, {} read failures, {} unsupported frames, {} corrupt frames",
        stats.samples,
        stats.timeouts,
        stats.read_failures,
        stats.unsupported,
        stats.decode_failures
    );
    Ok(EXIT_OK)
}

fn load_config(args: &Args) -> Result<DepthtapConfig> {
    let mut cfg = DepthtapConfig::load_from(args.config.as_deref())?;
    if let Some(uri) = &args.uri {
        cfg.device_uri = Some(uri.clone());
    }
    if let Some(mode) = args.mode {
        cfg.mode = mode;
    }
    if let Some(sensor) = args.sensor {
        cfg.sensor = sensor;
    }
    if let Some(millis) = args.timeout_ms {
        anyhow::ensure!(millis > 0, "--timeout-ms must be greater than zero");
        cfg.poll_timeout = Duration::from_millis(millis);
    }
    if args.monitor {
        cfg.monitor_devices = true;
    }
    Ok(cfg)
}

fn print_event(event: ConnectivityEvent, line_end: &str) {
    print!("{}{}", format_event(&event), line_end);
}

fn print_devices(sdk: SimSdk, json: bool) -> Result<i32> {
    let devices = match list_devices(Arc::new(sdk)) {
        Ok(devices) => devices,
        Err(failure) => {
            log::error!("{}", failure);
            return Ok(failure.exit_code());
        }
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(EXIT_OK);
    }
    if devices.is_empty() {
        println!("no devices found");
    }
    for device in &devices {
        println!(
            "{}  {} ({}) usb {:04x}:{:04x}",
            device.uri, device.name, device.vendor, device.usb_vendor_id, device.usb_product_id
        );
    }
    Ok(EXIT_OK)
}
