//! Acquisition dispatcher.
//!
//! `AcquisitionDispatcher` owns one sensor stream and offers two mutually
//! exclusive ways of pulling samples out of it:
//! - polling: `poll_once` blocks up to a timeout, then reads and decodes
//! - callback: `start_callback_mode` installs a listener that the SDK's
//!   delivery thread invokes per frame; the listener reads and decodes on
//!   that thread and forwards the sample
//!
//! Both paths share `read_and_decode`. The stream moves through
//! `Created -> Started -> Stopped -> Destroyed` and is never read outside
//! `Started`. A stopped stream cannot be restarted; attach again instead.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{decode, DecodeError, DecodedSample, PixelFormat};
use crate::gate::CallbackSlot;
use crate::sdk::{FrameListener, FrameReader, SdkError, SensorDevice, SensorKind, SensorStream};

/// Lifecycle of the owned stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Created => "created",
            StreamState::Started => "started",
            StreamState::Stopped => "stopped",
            StreamState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("device has no {0} sensor")]
    SensorUnavailable(SensorKind),

    #[error("couldn't create stream: {0}")]
    CreateFailed(String),

    #[error("couldn't start stream: {0}")]
    StartFailed(String),

    #[error("wait failed (timeout is {} ms)", .0.as_millis())]
    Timeout(Duration),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("unexpected frame format {0}")]
    UnsupportedFormat(PixelFormat),

    #[error("decode failed: {0}")]
    Decode(DecodeError),

    #[error("stream is {0}, not started")]
    NotStarted(StreamState),

    #[error("callback mode is active on this stream")]
    ModeConflict,

    #[error("couldn't register frame listener: {0}")]
    Listener(String),
}

impl AcquireError {
    /// Transient errors are logged and the caller polls again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AcquireError::Timeout(_)
                | AcquireError::ReadFailed(_)
                | AcquireError::UnsupportedFormat(_)
                | AcquireError::Decode(_)
        )
    }
}

impl From<DecodeError> for AcquireError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnsupportedFormat(format) => AcquireError::UnsupportedFormat(format),
            other => AcquireError::Decode(other),
        }
    }
}

/// Read one frame and decode its center sample.
pub fn read_and_decode(reader: &mut dyn FrameReader) -> Result<DecodedSample, AcquireError> {
    let frame = reader
        .read_frame()
        .map_err(|err| AcquireError::ReadFailed(err.to_string()))?;
    Ok(decode(&frame)?)
}

/// Counters collected while callback mode was active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallbackStats {
    pub delivered: u64,
    pub read_failures: u64,
    pub unsupported: u64,
    pub decode_failures: u64,
}

type SampleCallback = dyn FnMut(DecodedSample) + Send;

/// Frame listener installed in callback mode.
struct SampleForwarder {
    slot: CallbackSlot<SampleCallback>,
    delivered: AtomicU64,
    read_failures: AtomicU64,
    unsupported: AtomicU64,
    decode_failures: AtomicU64,
}

impl SampleForwarder {
    fn new(callback: Box<SampleCallback>) -> Self {
        Self {
            slot: CallbackSlot::new(callback),
            delivered: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            unsupported: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> CallbackStats {
        CallbackStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            read_failures: self.read_failures.load(Ordering::SeqCst),
            unsupported: self.unsupported.load(Ordering::SeqCst),
            decode_failures: self.decode_failures.load(Ordering::SeqCst),
        }
    }
}

impl FrameListener for SampleForwarder {
    fn on_new_frame(&self, stream: &mut dyn FrameReader) {
        if !self.slot.is_open() {
            return;
        }
        match read_and_decode(stream) {
            Ok(sample) => {
                self.slot.invoke(|callback| {
                    callback(sample);
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                });
            }
            Err(err @ AcquireError::ReadFailed(_)) => {
                self.read_failures.fetch_add(1, Ordering::SeqCst);
                log::warn!("{}", err);
            }
            Err(err @ AcquireError::Decode(_)) => {
                self.decode_failures.fetch_add(1, Ordering::SeqCst);
                log::warn!("dropping corrupt frame: {}", err);
            }
            Err(err) => {
                self.unsupported.fetch_add(1, Ordering::SeqCst);
                log::warn!("unexpected frame format: {}", err);
            }
        }
    }
}

/// Owns one started sensor stream and dispatches its frames.
pub struct AcquisitionDispatcher {
    stream: Box<dyn SensorStream>,
    kind: SensorKind,
    device_uri: String,
    state: StreamState,
    forwarder: Option<Arc<SampleForwarder>>,
}

impl AcquisitionDispatcher {
    /// Create and start a stream for `kind` on `device`.
    ///
    /// A stream that was created but failed to start is destroyed before
    /// returning.
    pub fn attach(device: &mut dyn SensorDevice, kind: SensorKind) -> Result<Self, AcquireError> {
        let device_uri = device.info().uri.clone();
        if !device.has_sensor(kind) {
            return Err(AcquireError::SensorUnavailable(kind));
        }

        let mut stream = device.create_stream(kind).map_err(|err| match err {
            SdkError::NoSensor(kind) => AcquireError::SensorUnavailable(kind),
            other => AcquireError::CreateFailed(other.to_string()),
        })?;
        log::debug!("{} stream created on {}", kind, device_uri);

        if let Err(err) = stream.start() {
            stream.destroy();
            return Err(AcquireError::StartFailed(err.to_string()));
        }
        log::info!("{} stream started on {}", kind, device_uri);

        Ok(Self {
            stream,
            kind,
            device_uri,
            state: StreamState::Started,
            forwarder: None,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn sensor_kind(&self) -> SensorKind {
        self.kind
    }

    pub fn device_uri(&self) -> &str {
        &self.device_uri
    }

    pub fn is_callback_mode(&self) -> bool {
        self.forwarder.is_some()
    }

    /// Wait up to `timeout` for a frame, then read and decode it.
    ///
    /// `Timeout` and `ReadFailed` are transient: poll again.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<DecodedSample, AcquireError> {
        if self.state != StreamState::Started {
            return Err(AcquireError::NotStarted(self.state));
        }
        if self.forwarder.is_some() {
            return Err(AcquireError::ModeConflict);
        }

        match self.stream.wait_for_frame(timeout) {
            Ok(()) => {}
            Err(SdkError::Timeout(_)) => return Err(AcquireError::Timeout(timeout)),
            Err(other) => return Err(AcquireError::ReadFailed(other.to_string())),
        }
        read_and_decode(self.stream.as_mut())
    }

    /// Install `on_sample` as the per-frame callback.
    ///
    /// The callback runs on the SDK's delivery thread, one frame at a time.
    /// Frames that fail to read or decode are logged and skipped.
    pub fn start_callback_mode<F>(&mut self, on_sample: F) -> Result<(), AcquireError>
    where
        F: FnMut(DecodedSample) + Send + 'static,
    {
        if self.state != StreamState::Started {
            return Err(AcquireError::NotStarted(self.state));
        }
        if self.forwarder.is_some() {
            return Err(AcquireError::ModeConflict);
        }

        let forwarder = Arc::new(SampleForwarder::new(Box::new(on_sample)));
        let listener: Arc<dyn FrameListener> = forwarder.clone();
        self.stream
            .set_frame_listener(Some(listener))
            .map_err(|err| AcquireError::Listener(err.to_string()))?;
        self.forwarder = Some(forwarder);
        log::debug!("callback mode enabled on {}", self.device_uri);
        Ok(())
    }

    /// Remove the callback. No invocation starts after this returns.
    ///
    /// Returns `None` when callback mode was not active.
    pub fn stop_callback_mode(&mut self) -> Option<CallbackStats> {
        let forwarder = self.forwarder.take()?;
        forwarder.slot.close();
        if let Err(err) = self.stream.set_frame_listener(None) {
            log::warn!("failed to remove frame listener: {}", err);
        }
        let stats = forwarder.stats();
        log::debug!(
            "callback mode disabled on {} (delivered={})",
            self.device_uri,
            stats.delivered
        );
        Some(stats)
    }

    /// Stop acquisition. A stopped stream is not restarted.
    pub fn stop(&mut self) {
        self.stop_callback_mode();
        if self.state == StreamState::Started {
            self.stream.stop();
            self.state = StreamState::Stopped;
            log::info!("{} stream stopped on {}", self.kind, self.device_uri);
        }
    }

    /// Stop and destroy the stream. Idempotent.
    pub fn detach(&mut self) {
        if self.state == StreamState::Destroyed {
            return;
        }
        self.stop();
        self.stream.destroy();
        self.state = StreamState::Destroyed;
        log::debug!("{} stream destroyed on {}", self.kind, self.device_uri);
    }
}

impl Drop for AcquisitionDispatcher {
    fn drop(&mut self) {
        self.detach();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
