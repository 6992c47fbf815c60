//! Acquisition loops.
//!
//! Both loops run until the stop signal is raised or the sample limit is
//! reached. Transient errors are logged and counted; they never end a loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::console::SampleSink;
use crate::dispatcher::{AcquireError, AcquisitionDispatcher};
use crate::gate::relock;
use crate::signal::StopSignal;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(2000);

/// How often callback mode checks the stop signal.
const CALLBACK_IDLE_STEP: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub poll_timeout: Duration,
    /// Stop after this many samples.
    pub max_samples: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_samples: None,
        }
    }
}

impl RunOptions {
    fn limit_reached(&self, samples: u64) -> bool {
        self.max_samples.is_some_and(|max| samples >= max)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub samples: u64,
    pub timeouts: u64,
    pub read_failures: u64,
    /// Frames with a pixel format the decoder does not handle.
    pub unsupported: u64,
    /// Frames whose buffer did not hold the advertised resolution.
    pub decode_failures: u64,
}

/// Poll the dispatcher in a loop, writing each sample to `sink`.
///
/// Only non-transient errors (stream not started, callback mode active) end
/// the loop early.
pub fn run_polling(
    dispatcher: &mut AcquisitionDispatcher,
    options: &RunOptions,
    stop: &StopSignal,
    sink: &mut dyn SampleSink,
) -> Result<RunStats, AcquireError> {
    let mut stats = RunStats::default();
    while !stop.is_raised() && !options.limit_reached(stats.samples) {
        match dispatcher.poll_once(options.poll_timeout) {
            Ok(sample) => {
                sink.sample(&sample);
                stats.samples += 1;
            }
            Err(err @ AcquireError::Timeout(_)) => {
                log::warn!("{}", err);
                stats.timeouts += 1;
            }
            Err(err @ AcquireError::ReadFailed(_)) => {
                log::warn!("{}", err);
                stats.read_failures += 1;
            }
            Err(err @ AcquireError::UnsupportedFormat(_)) => {
                log::warn!("unexpected frame format: {}", err);
                stats.unsupported += 1;
            }
            Err(err @ AcquireError::Decode(_)) => {
                log::warn!("dropping corrupt frame: {}", err);
                stats.decode_failures += 1;
            }
            Err(err) => return Err(err),
        }
    }
    log::debug!("polling loop finished: {:?}", stats);
    Ok(stats)
}

/// Deliver samples through callback mode until stopped.
///
/// The callback is unregistered before this returns.
pub fn run_callback<S>(
    dispatcher: &mut AcquisitionDispatcher,
    options: &RunOptions,
    stop: &StopSignal,
    sink: Arc<Mutex<S>>,
) -> Result<RunStats, AcquireError>
where
    S: SampleSink + 'static,
{
    if options.limit_reached(0) {
        return Ok(RunStats::default());
    }
    let delivered = Arc::new(AtomicU64::new(0));
    let done = StopSignal::new();

    let counter = delivered.clone();
    let limit = options.clone();
    let finished = done.clone();
    dispatcher.start_callback_mode(move |sample| {
        let seen = counter.load(Ordering::SeqCst);
        if limit.limit_reached(seen) {
            return;
        }
        relock(&sink).sample(&sample);
        if limit.limit_reached(counter.fetch_add(1, Ordering::SeqCst) + 1) {
            finished.raise();
        }
    })?;

    while !stop.is_raised() && !done.is_raised() {
        std::thread::sleep(CALLBACK_IDLE_STEP);
    }

    let callback = dispatcher.stop_callback_mode().unwrap_or_default();
    let stats = RunStats {
        samples: delivered.load(Ordering::SeqCst),
        timeouts: 0,
        read_failures: callback.read_failures,
        unsupported: callback.unsupported,
        decode_failures: callback.decode_failures,
    };
    log::debug!("callback loop finished: {:?}", stats);
    Ok(stats)
}
