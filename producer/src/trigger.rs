//! Capture requests.
//!
//! Any number of signal sources may ask for a still; the frame-delivery
//! thread consumes the request on the next frame it sees. Requests made
//! before that frame coalesce into one.

use std::io::{self, BufRead};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One-shot "capture the next frame" flag.
#[derive(Debug, Default)]
pub struct CaptureTrigger {
    requested: Mutex<bool>,
}

impl CaptureTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for the next frame to be captured. Idempotent until drained.
    pub fn request_capture(&self) {
        *self.lock() = true;
    }

    /// Read and clear the flag in one step.
    pub fn drain_if_requested(&self) -> bool {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A bool cannot be left half-written, so a poisoned lock is still usable.
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fire `request_capture` after `initial_delay`, then every `period`.
pub fn spawn_interval_trigger(
    trigger: Arc<CaptureTrigger>,
    initial_delay: Duration,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + initial_delay;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            initial_delay_ms = initial_delay.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "interval capture trigger armed"
        );
        loop {
            ticker.tick().await;
            debug!("interval trigger fired");
            trigger.request_capture();
        }
    })
}

/// Turns a stream of volume readings into capture requests.
///
/// The first reading only sets the baseline. After that, every reading that
/// differs from the one before it is a button press.
#[derive(Debug, Default)]
pub struct VolumeObserver {
    last: Option<f32>,
}

impl VolumeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading; returns true when it should trigger a capture.
    pub fn observe(&mut self, level: f32) -> bool {
        let changed = matches!(self.last, Some(prev) if prev != level);
        self.last = Some(level);
        changed
    }
}

/// Read volume levels, one float per line, from stdin.
///
/// Runs on a plain thread so a blocked read never holds up runtime
/// shutdown; the handle is not meant to be joined.
pub fn spawn_stdin_volume_input(trigger: Arc<CaptureTrigger>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("volume-input".into())
        .spawn(move || {
            info!("reading volume levels from stdin");
            read_volume_lines(io::stdin().lock(), &trigger);
        })
}

fn read_volume_lines<R: BufRead>(reader: R, trigger: &CaptureTrigger) {
    let mut observer = VolumeObserver::new();
    for line in reader.lines() {
        match line {
            Ok(line) => feed_volume_line(&mut observer, trigger, &line),
            Err(e) => {
                warn!(error = %e, "failed to read volume input");
                return;
            }
        }
    }
    info!("volume input closed");
}

fn feed_volume_line(observer: &mut VolumeObserver, trigger: &CaptureTrigger, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match line.parse::<f32>() {
        Ok(level) if level.is_finite() => {
            if observer.observe(level) {
                debug!(level, "volume changed, requesting capture");
                trigger.request_capture();
            }
        }
        _ => warn!(line, "ignoring unparseable volume reading"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn many_requests_coalesce_into_one_capture() {
        let trigger = CaptureTrigger::new();
        assert!(!trigger.drain_if_requested());
        for _ in 0..5 {
            trigger.request_capture();
        }
        assert!(trigger.drain_if_requested());
        assert!(!trigger.drain_if_requested());

        trigger.request_capture();
        assert!(trigger.drain_if_requested());
    }

    #[test]
    fn concurrent_requests_drain_once() {
        let trigger = Arc::new(CaptureTrigger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let trigger = trigger.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        trigger.request_capture();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(trigger.drain_if_requested());
        assert!(!trigger.drain_if_requested());
    }

    #[test]
    fn poisoned_flag_still_works() {
        let trigger = Arc::new(CaptureTrigger::new());
        let t = trigger.clone();
        let _ = thread::spawn(move || {
            let _guard = t.requested.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        trigger.request_capture();
        assert!(trigger.drain_if_requested());
    }

    #[test]
    fn first_volume_reading_is_baseline() {
        let mut observer = VolumeObserver::new();
        assert!(!observer.observe(0.5));
        assert!(observer.observe(0.5625));
        assert!(!observer.observe(0.5625));
        assert!(observer.observe(0.5));
    }

    #[test]
    fn volume_lines_request_captures() {
        let trigger = CaptureTrigger::new();
        let mut observer = VolumeObserver::new();
        feed_volume_line(&mut observer, &trigger, "0.5");
        assert!(!trigger.drain_if_requested());
        feed_volume_line(&mut observer, &trigger, "not a number");
        feed_volume_line(&mut observer, &trigger, "");
        assert!(!trigger.drain_if_requested());
        feed_volume_line(&mut observer, &trigger, " 0.75 ");
        assert!(trigger.drain_if_requested());
    }

    #[test]
    fn volume_reader_stops_at_end_of_input() {
        let trigger = CaptureTrigger::new();
        read_volume_lines(io::Cursor::new("0.1\n0.1\nbogus\n0.3\n"), &trigger);
        assert!(trigger.drain_if_requested());
        assert!(!trigger.drain_if_requested());

        read_volume_lines(io::Cursor::new(""), &trigger);
        assert!(!trigger.drain_if_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_trigger_waits_for_initial_delay() {
        let trigger = Arc::new(CaptureTrigger::new());
        let handle = spawn_interval_trigger(
            trigger.clone(),
            Duration::from_secs(5),
            Duration::from_secs(10),
        );

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(!trigger.drain_if_requested());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(trigger.drain_if_requested());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!trigger.drain_if_requested());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(trigger.drain_if_requested());

        handle.abort();
    }
}
