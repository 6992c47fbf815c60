//! Simulated sensor stream.
//!
//! A `Feed` produces frame *n* at `start + n / fps`. Reads return the oldest
//! pending frame, keeping at most `QUEUE_DEPTH` frames of backlog the way a
//! capture driver's buffer pool does. A listener, when installed on a started
//! stream, is driven by one delivery thread.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::SimSensorProfile;
use crate::frame::{PixelFormat, VideoFrame};
use crate::gate::relock;
use crate::sdk::{FrameListener, FrameReader, SdkError, SensorKind, SensorStream};

/// Frames kept pending before the oldest are dropped.
const QUEUE_DEPTH: u64 = 4;

/// How long the delivery thread sleeps between cancellation checks.
const DELIVERY_WAIT: Duration = Duration::from_millis(50);

struct FeedState {
    running: bool,
    started_at: Instant,
    next_index: u64,
}

pub(crate) struct Feed {
    profile: SimSensorProfile,
    uri: String,
    state: Mutex<FeedState>,
    wake: Condvar,
}

struct FrameMeta {
    index: u64,
    timestamp: u64,
    format: PixelFormat,
}

impl Feed {
    fn new(profile: SimSensorProfile, uri: String) -> Self {
        Self {
            profile,
            uri,
            state: Mutex::new(FeedState {
                running: false,
                started_at: Instant::now(),
                next_index: 0,
            }),
            wake: Condvar::new(),
        }
    }

    fn period(&self) -> Option<Duration> {
        if self.profile.fps == 0 {
            None
        } else {
            Some(Duration::from_nanos(1_000_000_000 / self.profile.fps as u64))
        }
    }

    fn due_at(&self, state: &FeedState, index: u64) -> Option<Instant> {
        let period = self.period()?;
        let offset = (period.as_nanos() as u64).checked_mul(index)?;
        state.started_at.checked_add(Duration::from_nanos(offset))
    }

    /// Index of the newest frame due at `now`.
    fn latest_due(&self, state: &FeedState, now: Instant) -> Option<u64> {
        let period = self.period()?;
        let elapsed = now.checked_duration_since(state.started_at)?;
        Some((elapsed.as_nanos() / period.as_nanos()) as u64)
    }

    fn set_running(&self, running: bool) {
        let mut state = relock(&self.state);
        if running && !state.running {
            state.started_at = Instant::now();
            state.next_index = 0;
        }
        state.running = running;
        drop(state);
        self.wake.notify_all();
    }

    fn is_running(&self) -> bool {
        relock(&self.state).running
    }

    /// Block until a frame is pending. Never returns `Timeout` before
    /// `timeout` has fully elapsed.
    fn wait_ready(&self, timeout: Duration) -> Result<(), SdkError> {
        let deadline = Instant::now() + timeout;
        let mut state = relock(&self.state);
        loop {
            if !state.running {
                return Err(SdkError::InvalidState("stream not started"));
            }
            let now = Instant::now();
            let due = self.due_at(&state, state.next_index);
            if let Some(due) = due {
                if now >= due {
                    return Ok(());
                }
            }
            if now >= deadline {
                return Err(SdkError::Timeout(timeout));
            }
            let wake_at = due.map_or(deadline, |due| due.min(deadline));
            let (guard, _) = self
                .wake
                .wait_timeout(state, wake_at.saturating_duration_since(now))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    /// Claim the oldest pending frame.
    fn claim(&self) -> Result<FrameMeta, SdkError> {
        let mut state = relock(&self.state);
        if !state.running {
            return Err(SdkError::InvalidState("stream not started"));
        }
        let latest = self
            .latest_due(&state, Instant::now())
            .filter(|latest| *latest >= state.next_index)
            .ok_or_else(|| SdkError::Failed("no new frame available".to_string()))?;
        let index = state
            .next_index
            .max(latest.saturating_sub(QUEUE_DEPTH - 1));
        state.next_index = index + 1;
        drop(state);

        let period_us = self.period().map_or(0, |p| p.as_micros() as u64);
        let formats = self.profile.format_script();
        let format = formats[(index % formats.len() as u64) as usize];
        Ok(FrameMeta {
            index,
            timestamp: index * period_us,
            format,
        })
    }

    /// Mark `index` as delivered even if the listener did not read it.
    fn skip_past(&self, index: u64) {
        let mut state = relock(&self.state);
        state.next_index = state.next_index.max(index + 1);
    }

    fn pending_index(&self) -> u64 {
        relock(&self.state).next_index
    }

    fn render(&self, meta: &FrameMeta, buffer: &mut Vec<u8>) {
        let width = self.profile.width as usize;
        let height = self.profile.height as usize;
        let bpp = meta.format.bytes_per_pixel();
        buffer.clear();
        buffer.resize(width * height * bpp, 0);

        match meta.format {
            PixelFormat::Depth1Mm | PixelFormat::Depth100Um => {
                let mut rng = rand::thread_rng();
                let base = self.profile.depth_at(meta.index);
                for pixel in buffer.chunks_exact_mut(2) {
                    let noise = if self.profile.noise == 0 {
                        0
                    } else {
                        rng.gen_range(0..=self.profile.noise)
                    };
                    let mm = base.saturating_add(noise);
                    let value = if meta.format == PixelFormat::Depth100Um {
                        mm.saturating_mul(10)
                    } else {
                        mm
                    };
                    pixel.copy_from_slice(&value.to_le_bytes());
                }
            }
            PixelFormat::Rgb888 => {
                for (i, pixel) in buffer.chunks_exact_mut(3).enumerate() {
                    let (x, y) = (i % width, i / width);
                    pixel[0] = (x * 255 / width.max(1)) as u8;
                    pixel[1] = (y * 255 / height.max(1)) as u8;
                    pixel[2] = meta.index as u8;
                }
            }
            _ => buffer.fill(meta.index as u8),
        }
    }
}

/// Reads frames from a feed into its own backing buffer.
pub(crate) struct FeedReader {
    feed: Arc<Feed>,
    buffer: Vec<u8>,
}

impl FeedReader {
    fn new(feed: Arc<Feed>) -> Self {
        Self {
            feed,
            buffer: Vec::new(),
        }
    }
}

impl FrameReader for FeedReader {
    fn read_frame(&mut self) -> Result<VideoFrame<'_>, SdkError> {
        let meta = self.feed.claim()?;
        self.feed.render(&meta, &mut self.buffer);
        Ok(VideoFrame::new(
            &self.buffer,
            self.feed.profile.width,
            self.feed.profile.height,
            meta.format,
        )
        .with_timestamp(meta.timestamp)
        .with_index(meta.index))
    }
}

struct Delivery {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Delivery {
    fn spawn(feed: Arc<Feed>, listener: Arc<dyn FrameListener>) -> Result<Self, SdkError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancelled = cancel.clone();
        let name = format!("sim-delivery-{}", feed.profile.kind);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut reader = FeedReader::new(feed.clone());
                while !cancelled.load(Ordering::SeqCst) {
                    match feed.wait_ready(DELIVERY_WAIT) {
                        Ok(()) => {}
                        Err(SdkError::Timeout(_)) => continue,
                        Err(_) => break,
                    }
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let pending = feed.pending_index();
                    listener.on_new_frame(&mut reader);
                    feed.skip_past(pending);
                }
            })
            .map_err(|err| SdkError::Failed(format!("spawn delivery thread: {}", err)))?;
        Ok(Self { cancel, handle })
    }

    /// Stop delivering. Joins the thread unless called from it.
    fn cancel(self, feed: &Feed) {
        self.cancel.store(true, Ordering::SeqCst);
        feed.wake.notify_all();
        if self.handle.thread().id() == std::thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            log::error!("sim delivery thread for {} panicked", feed.uri);
        }
    }
}

/// Simulated stream for one sensor of a `SimDevice`.
pub struct SimStream {
    reader: FeedReader,
    listener: Option<Arc<dyn FrameListener>>,
    delivery: Option<Delivery>,
    fail_start: bool,
    destroyed: bool,
    live_streams: Arc<AtomicUsize>,
}

impl SimStream {
    pub(crate) fn new(
        profile: SimSensorProfile,
        uri: String,
        fail_start: bool,
        live_streams: Arc<AtomicUsize>,
    ) -> Self {
        live_streams.fetch_add(1, Ordering::SeqCst);
        Self {
            reader: FeedReader::new(Arc::new(Feed::new(profile, uri))),
            listener: None,
            delivery: None,
            fail_start,
            destroyed: false,
            live_streams,
        }
    }

    fn feed(&self) -> &Arc<Feed> {
        &self.reader.feed
    }

    fn stop_delivery(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            delivery.cancel(self.reader.feed.as_ref());
        }
    }

    fn start_delivery(&mut self) -> Result<(), SdkError> {
        if let Some(listener) = self.listener.clone() {
            if self.delivery.is_none() && self.feed().is_running() {
                self.delivery = Some(Delivery::spawn(self.feed().clone(), listener)?);
            }
        }
        Ok(())
    }
}

impl FrameReader for SimStream {
    fn read_frame(&mut self) -> Result<VideoFrame<'_>, SdkError> {
        if self.destroyed {
            return Err(SdkError::InvalidState("stream destroyed"));
        }
        self.reader.read_frame()
    }
}

impl SensorStream for SimStream {
    fn kind(&self) -> SensorKind {
        self.feed().profile.kind
    }

    fn start(&mut self) -> Result<(), SdkError> {
        if self.destroyed {
            return Err(SdkError::InvalidState("stream destroyed"));
        }
        if self.fail_start {
            return Err(SdkError::Failed(format!(
                "simulated start failure on {}",
                self.feed().uri
            )));
        }
        self.feed().set_running(true);
        self.start_delivery()
    }

    fn stop(&mut self) {
        self.feed().set_running(false);
        self.stop_delivery();
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.stop();
        self.listener = None;
        self.destroyed = true;
        self.live_streams.fetch_sub(1, Ordering::SeqCst);
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SdkError> {
        if self.destroyed {
            return Err(SdkError::InvalidState("stream destroyed"));
        }
        self.feed().wait_ready(timeout)
    }

    fn set_frame_listener(
        &mut self,
        listener: Option<Arc<dyn FrameListener>>,
    ) -> Result<(), SdkError> {
        if self.destroyed {
            return Err(SdkError::InvalidState("stream destroyed"));
        }
        self.stop_delivery();
        self.listener = listener;
        self.start_delivery()
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!("sim stream on {} dropped without destroy", self.feed().uri);
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;

    fn stream(profile: SimSensorProfile) -> SimStream {
        SimStream::new(
            profile,
            "sim://test".to_string(),
            false,
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[test]
    fn read_before_start_is_rejected() {
        let mut s = stream(SimSensorProfile::new(SensorKind::Depth, 4, 4, 30));
        assert!(matches!(
            s.read_frame(),
            Err(SdkError::InvalidState("stream not started"))
        ));
    }

    #[test]
    fn first_frame_is_ready_at_start() {
        let mut s = stream(SimSensorProfile::new(SensorKind::Depth, 8, 6, 30));
        s.start().unwrap();
        s.wait_for_frame(Duration::from_millis(500)).unwrap();

        let frame = s.read_frame().unwrap();
        assert_eq!(frame.index, 0);
        assert_eq!(frame.format, PixelFormat::Depth1Mm);
        assert_eq!(frame.data.len(), 8 * 6 * 2);
        let sample = decode(&frame).unwrap();
        assert_eq!(sample.millimeters(), Some(1000.0));
        s.destroy();
    }

    #[test]
    fn stalled_feed_times_out_after_full_timeout() {
        let mut s = stream(SimSensorProfile::new(SensorKind::Depth, 4, 4, 0));
        s.start().unwrap();

        let started = Instant::now();
        let err = s.wait_for_frame(Duration::from_millis(60)).unwrap_err();
        assert_eq!(err, SdkError::Timeout(Duration::from_millis(60)));
        assert!(started.elapsed() >= Duration::from_millis(60));
        s.destroy();
    }

    #[test]
    fn format_script_cycles_per_frame() {
        let profile = SimSensorProfile::new(SensorKind::Depth, 4, 4, 50).with_formats(vec![
            PixelFormat::Depth1Mm,
            PixelFormat::Rgb888,
        ]);
        let mut s = stream(profile);
        s.start().unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            s.wait_for_frame(Duration::from_secs(1)).unwrap();
            let frame = s.read_frame().unwrap();
            seen.push((frame.index, frame.format));
        }
        assert_eq!(
            seen,
            vec![
                (0, PixelFormat::Depth1Mm),
                (1, PixelFormat::Rgb888),
                (2, PixelFormat::Depth1Mm)
            ]
        );
        s.destroy();
    }

    #[test]
    fn destroy_releases_live_stream_count() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut s = SimStream::new(
            SimSensorProfile::new(SensorKind::Color, 4, 4, 30),
            "sim://test".to_string(),
            false,
            live.clone(),
        );
        assert_eq!(live.load(Ordering::SeqCst), 1);
        s.destroy();
        s.destroy();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
