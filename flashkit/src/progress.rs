// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::VecDeque,
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Minimum delay between two progress emissions.
pub const PROGRESS_EMISSION_INTERVAL: Duration = Duration::from_millis(500);

/// Default sliding window for instantaneous speed.
pub const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Sliding-window rate meter. Each call to [`Self::speed`] records the
/// number of units transferred since the previous call and returns the rate
/// over the window.
///
/// The newest sample at or before the window start is retained and its
/// amount is weighted by how much of its interval overlaps the window, so
/// the reported rate does not jump when a sample falls out of the window.
/// While less than a full window of history exists, the first interval is
/// scaled up to cover the missing span.
#[derive(Debug)]
pub struct Speedometer {
    window_size: f64,
    epoch: Instant,
    // (seconds since epoch, amount)
    values: VecDeque<(f64, u64)>,
}

impl Speedometer {
    pub fn new(window_size: Duration) -> Self {
        Self {
            window_size: window_size.as_secs_f64(),
            epoch: Instant::now(),
            values: VecDeque::from([(0.0, 0)]),
        }
    }

    pub fn speed(&mut self, amount: u64) -> f64 {
        self.speed_at(amount, Instant::now())
    }

    /// Like [`Self::speed`], but with an explicit notion of "now".
    pub fn speed_at(&mut self, amount: u64, now: Instant) -> f64 {
        let now = now.saturating_duration_since(self.epoch).as_secs_f64();
        self.values.push_back((now, amount));

        let start = now - self.window_size;

        // Evict samples past the window, but keep the newest one at or
        // before the window start. The sample just pushed is always newer
        // than the start, so at least two samples survive unless the clock
        // went backwards.
        while self.values.len() >= 2 && self.values[1].0 <= start {
            self.values.pop_front();
        }

        if self.values.len() < 2 {
            return 0.0;
        }

        let (ratio, duration) = if start <= self.values[0].0 {
            let interval = self.values[1].0 - self.values[0].0;
            let ratio = if interval > 0.0 {
                (self.values[1].0 - start) / interval
            } else {
                1.0
            };

            (ratio, self.window_size)
        } else {
            (1.0, now - self.values[0].0)
        };

        let sum = ratio * self.values[1].1 as f64
            + self
                .values
                .iter()
                .skip(2)
                .map(|(_, amount)| *amount as f64)
                .sum::<f64>();

        sum / duration
    }
}

/// A single progress emission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Absolute position within the image, including skipped gaps.
    pub position: u64,
    /// Total bytes actually transferred so far.
    pub bytes: u64,
    /// Windowed rate in bytes per second.
    pub speed: f64,
    /// Rate since the start of the operation in bytes per second.
    pub average_speed: f64,
}

pub type ProgressCallback<'a> = Box<dyn Fn(ProgressEvent) + Send + Sync + 'a>;

#[derive(Debug)]
struct ReporterState {
    speedometer: Speedometer,
    start: Instant,
    last_emit: Option<Instant>,
    position: u64,
    bytes: u64,
    // Bytes accumulated since the last emission. Every delta must reach the
    // speedometer exactly once, even when updates are throttled.
    pending: u64,
}

/// Throttled progress emitter shared by the transfer stages. [`Self::update`]
/// invokes the callback at most once per `interval`; [`Self::flush`] forces
/// a final emission so the consumer always sees the end state.
pub struct ProgressReporter<'a> {
    state: Mutex<ReporterState>,
    interval: Duration,
    callback: ProgressCallback<'a>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(callback: ProgressCallback<'a>, interval: Duration) -> Self {
        Self {
            state: Mutex::new(ReporterState {
                speedometer: Speedometer::new(SPEED_WINDOW),
                start: Instant::now(),
                last_emit: None,
                position: 0,
                bytes: 0,
                pending: 0,
            }),
            interval,
            callback,
        }
    }

    fn event(state: &mut ReporterState, delta: u64, now: Instant) -> ProgressEvent {
        let speed = state.speedometer.speed_at(delta, now);
        let elapsed = now.saturating_duration_since(state.start).as_secs_f64();
        let average_speed = if elapsed > 0.0 {
            state.bytes as f64 / elapsed
        } else {
            0.0
        };

        ProgressEvent {
            position: state.position,
            bytes: state.bytes,
            speed,
            average_speed,
        }
    }

    /// Record `delta` newly transferred bytes at absolute `position` and
    /// maybe emit.
    pub fn update(&self, position: u64, delta: u64) {
        self.update_at(position, delta, Instant::now());
    }

    /// Like [`Self::update`], but with an explicit notion of "now".
    pub fn update_at(&self, position: u64, delta: u64, now: Instant) {
        let mut state = self.state.lock().unwrap();

        state.position = position;
        state.bytes += delta;
        state.pending += delta;

        let due = match state.last_emit {
            Some(at) => now.saturating_duration_since(at) >= self.interval,
            None => true,
        };
        if !due {
            return;
        }

        state.last_emit = Some(now);
        let pending = std::mem::take(&mut state.pending);
        let event = Self::event(&mut state, pending, now);
        drop(state);

        (self.callback)(event);
    }

    /// Emit the current state unconditionally.
    pub fn flush(&self) {
        self.flush_at(Instant::now());
    }

    /// Like [`Self::flush`], but with an explicit notion of "now".
    pub fn flush_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();

        state.last_emit = Some(now);
        let pending = std::mem::take(&mut state.pending);
        let event = Self::event(&mut state, pending, now);
        drop(state);

        (self.callback)(event);
    }
}

impl fmt::Debug for ProgressReporter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn speedometer_converges_on_steady_rate() {
        let mut meter = Speedometer::new(Duration::from_secs(5));
        let epoch = meter.epoch;

        let mut speed = 0.0;
        for i in 1..=10 {
            speed = meter.speed_at(100, epoch + Duration::from_secs(i));
        }

        // 100 bytes per second once the window is full.
        assert!((speed - 100.0).abs() < 1e-9, "speed was {speed}");
    }

    #[test]
    fn speedometer_extrapolates_partial_window() {
        let mut meter = Speedometer::new(Duration::from_secs(5));
        let epoch = meter.epoch;

        // One sample of 100 bytes after 1 s. The first interval is scaled to
        // cover the whole window, so the rate is already 100 B/s.
        let speed = meter.speed_at(100, epoch + Duration::from_secs(1));
        assert!((speed - 100.0).abs() < 1e-9, "speed was {speed}");
    }

    #[test]
    fn speedometer_forgets_old_samples() {
        let mut meter = Speedometer::new(Duration::from_secs(5));
        let epoch = meter.epoch;

        for i in 1..=5 {
            meter.speed_at(1000, epoch + Duration::from_secs(i));
        }

        // A long stall drops the rate.
        let speed = meter.speed_at(0, epoch + Duration::from_secs(60));
        assert!(speed < 1.0, "speed was {speed}");
    }

    #[test]
    fn reporter_accumulates_and_flushes() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let reporter = ProgressReporter::new(
            Box::new({
                let events = events.clone();
                move |e| events.lock().unwrap().push(e)
            }),
            Duration::ZERO,
        );

        reporter.update(1024, 1024);
        reporter.update(4096, 1024);
        reporter.flush();

        let events = events.lock().unwrap();
        assert_eq!(
            events
                .iter()
                .map(|e| (e.position, e.bytes))
                .collect::<Vec<_>>(),
            [(1024, 1024), (4096, 2048), (4096, 2048)],
        );
    }

    #[test]
    fn reporter_feeds_throttled_deltas_to_the_speedometer() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let reporter = ProgressReporter::new(
            Box::new({
                let events = events.clone();
                move |e| events.lock().unwrap().push(e)
            }),
            Duration::from_millis(500),
        );
        let base = reporter.state.lock().unwrap().start;

        // 100 bytes every 10 ms is a steady 10 kB/s. Most updates are
        // throttled, but their bytes must still count towards the rate.
        for i in 1..=200u64 {
            reporter.update_at(i * 100, 100, base + Duration::from_millis(i * 10));
        }
        reporter.flush_at(base + Duration::from_secs(2));

        let events = events.lock().unwrap();
        assert!(events.len() < 10, "{} emissions", events.len());
        assert_eq!(events.last().unwrap().bytes, 20_000);

        for event in events.iter() {
            assert!(
                (event.speed - 10_000.0).abs() < 100.0,
                "speed was {}",
                event.speed,
            );
        }
    }

    #[test]
    fn reporter_throttles_emissions() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let reporter = ProgressReporter::new(
            Box::new({
                let events = events.clone();
                move |e| events.lock().unwrap().push(e)
            }),
            Duration::from_secs(3600),
        );

        for i in 0..100 {
            reporter.update(i * 512, 512);
        }

        // Only the first update got through, plus the forced flush.
        assert_eq!(events.lock().unwrap().len(), 1);

        reporter.flush();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].position, 99 * 512);
        assert_eq!(events[1].bytes, 100 * 512);
    }
}
