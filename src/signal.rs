//! Termination signal shared by the acquisition loops.

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const WAIT_STEP: Duration = Duration::from_millis(20);

/// How long the key watcher blocks before rechecking its flags.
const KEY_POLL_STEP: Duration = Duration::from_millis(50);

/// Raised once by Ctrl-C, a key press on the terminal, or the caller.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Hook Ctrl-C and, when stdin is a terminal, any key press.
    ///
    /// Ctrl-C can be hooked once per process. The terminal stays in raw mode
    /// until the returned guard is dropped.
    pub fn install(&self) -> Result<KeyWatch> {
        let on_interrupt = self.clone();
        ctrlc::set_handler(move || on_interrupt.raise()).context("install Ctrl-C handler")?;

        if !std::io::stdin().is_terminal() {
            log::info!("press Ctrl-C to stop");
            return Ok(KeyWatch::inactive());
        }
        // Raw mode turns Ctrl-C into a key event, which the watcher also
        // treats as a stop request.
        if let Err(err) = enable_raw_mode() {
            log::warn!("terminal raw mode unavailable ({}); Ctrl-C only", err);
            return Ok(KeyWatch::inactive());
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let on_key = self.clone();
        let watcher_shutdown = shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name("stop-on-key".to_string())
            .spawn(move || {
                let result = watch_keys(&on_key, &watcher_shutdown, |timeout| {
                    if event::poll(timeout)? {
                        event::read().map(Some)
                    } else {
                        Ok(None)
                    }
                });
                if let Err(err) = disable_raw_mode() {
                    log::warn!("failed to restore terminal: {}", err);
                }
                if let Err(err) = result {
                    log::warn!("keyboard watcher stopped: {}", err);
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                let _ = disable_raw_mode();
                return Err(err).context("spawn keyboard watcher");
            }
        };
        log::info!("press any key or Ctrl-C to stop");
        Ok(KeyWatch {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Sleep until raised or `timeout` elapses. Returns whether it was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_raised() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_STEP.min(deadline - now));
        }
    }
}

/// Keyboard watcher started by [`StopSignal::install`].
///
/// Dropping it stops the watcher thread, which restores the terminal.
#[derive(Debug)]
pub struct KeyWatch {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeyWatch {
    fn inactive() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(true)),
            handle: None,
        }
    }

    /// Whether the terminal is in raw mode, so output lines need `\r\n`.
    pub fn is_raw_terminal(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for KeyWatch {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Any key press stops acquisition. Releases and non-key events do not.
fn is_stop_key(event: &Event) -> bool {
    matches!(event, Event::Key(key) if key.kind == KeyEventKind::Press)
}

/// Read events until a stop key arrives, `stop` is raised elsewhere, or
/// `shutdown` is set. `next_event` waits up to the given timeout.
fn watch_keys<F>(
    stop: &StopSignal,
    shutdown: &AtomicBool,
    mut next_event: F,
) -> std::io::Result<()>
where
    F: FnMut(Duration) -> std::io::Result<Option<Event>>,
{
    while !stop.is_raised() && !shutdown.load(Ordering::SeqCst) {
        if let Some(event) = next_event(KEY_POLL_STEP)? {
            if is_stop_key(&event) {
                log::debug!("stop requested from keyboard");
                stop.raise();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use std::collections::VecDeque;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent::new(code, modifiers))
    }

    #[test]
    fn clones_share_the_flag() {
        let signal = StopSignal::new();
        let other = signal.clone();
        assert!(!signal.is_raised());
        other.raise();
        assert!(signal.is_raised());
        assert!(signal.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn wait_timeout_expires_when_not_raised() {
        let signal = StopSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn every_key_press_stops_without_enter() {
        assert!(is_stop_key(&press(KeyCode::Char('q'), KeyModifiers::NONE)));
        assert!(is_stop_key(&press(KeyCode::Char(' '), KeyModifiers::NONE)));
        assert!(is_stop_key(&press(KeyCode::Esc, KeyModifiers::NONE)));
        assert!(is_stop_key(&press(KeyCode::Char('c'), KeyModifiers::CONTROL)));

        let release = Event::Key(KeyEvent::new_with_kind(
            KeyCode::Char('q'),
            KeyModifiers::NONE,
            KeyEventKind::Release,
        ));
        assert!(!is_stop_key(&release));
        assert!(!is_stop_key(&Event::Resize(80, 24)));
        assert!(!is_stop_key(&Event::FocusGained));
    }

    #[test]
    fn watcher_raises_on_first_key_after_other_events() {
        let stop = StopSignal::new();
        let shutdown = AtomicBool::new(false);
        let mut events: VecDeque<Option<Event>> = VecDeque::from(vec![
            None,
            Some(Event::Resize(120, 40)),
            Some(press(KeyCode::Char('x'), KeyModifiers::NONE)),
        ]);

        watch_keys(&stop, &shutdown, |_| Ok(events.pop_front().flatten())).unwrap();

        assert!(stop.is_raised());
        assert!(events.is_empty());
    }

    #[test]
    fn watcher_exits_on_shutdown_without_raising() {
        let stop = StopSignal::new();
        let shutdown = AtomicBool::new(false);
        let mut polls = 0;

        watch_keys(&stop, &shutdown, |_| {
            polls += 1;
            if polls == 3 {
                shutdown.store(true, Ordering::SeqCst);
            }
            Ok(None)
        })
        .unwrap();

        assert!(!stop.is_raised());
        assert_eq!(polls, 3);
    }

    #[test]
    fn inactive_watch_leaves_the_terminal_alone() {
        let watch = KeyWatch::inactive();
        assert!(!watch.is_raw_terminal());
        drop(watch);
    }
}
