//! Console output: one line per sample or connectivity event.

use std::io::Write;

use crate::frame::DecodedSample;
use crate::monitor::ConnectivityEvent;

/// `[00033333]     1000` for depth, `[00033333] 0x12ab56` for color.
pub fn format_sample(sample: &DecodedSample) -> String {
    match sample {
        DecodedSample::Depth {
            timestamp, value, ..
        } => format!("[{:08}] {:8}", timestamp, value),
        DecodedSample::Color { timestamp, rgb, .. } => format!(
            "[{:08}] 0x{:02x}{:02x}{:02x}",
            timestamp, rgb[0], rgb[1], rgb[2]
        ),
    }
}

pub fn format_event(event: &ConnectivityEvent) -> String {
    match event {
        ConnectivityEvent::Connected(info) => format!("Device \"{}\" connected", info.uri),
        ConnectivityEvent::Disconnected(info) => format!("Device \"{}\" disconnected", info.uri),
        ConnectivityEvent::StateChanged(info, state) => {
            format!("Device \"{}\" error state changed to {}", info.uri, state)
        }
    }
}

/// Receives decoded samples from a run loop.
pub trait SampleSink: Send {
    fn sample(&mut self, sample: &DecodedSample);
}

/// Line terminator for a terminal in raw mode, where `\n` alone does not
/// return the cursor to the first column.
pub const RAW_LINE_END: &str = "\r\n";

/// Writes `format_sample` lines to a writer (stdout by default).
pub struct ConsoleSink<W: Write + Send = std::io::Stdout> {
    out: W,
    line_end: &'static str,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, line_end: "\n" }
    }

    /// End lines with `\r\n` while the terminal is in raw mode.
    pub fn raw_terminal(mut self, raw: bool) -> Self {
        self.line_end = if raw { RAW_LINE_END } else { "\n" };
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> SampleSink for ConsoleSink<W> {
    fn sample(&mut self, sample: &DecodedSample) {
        if let Err(err) = write!(self.out, "{}{}", format_sample(sample), self.line_end) {
            log::warn!("failed to write sample: {}", err);
        }
    }
}

/// Collects samples in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub samples: Vec<DecodedSample>,
}

impl SampleSink for VecSink {
    fn sample(&mut self, sample: &DecodedSample) {
        self.samples.push(sample.clone());
    }
}
