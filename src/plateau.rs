use std::collections::VecDeque;

use serde::Serialize;

use crate::config::PlateauSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlateauPhase {
    WarmingUp,
    Sampling,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauSignal {
    Continue,
    Stop,
}

/// Sliding-window yield tracker for one region.
///
/// Samples observed before the warm-up point count never influence the stop
/// decision: the window and the low-yield streak are cleared when the
/// warm-up boundary is crossed. Once the window is full, every further
/// observation evaluates the window mean against the threshold.
#[derive(Debug, Clone)]
pub struct PlateauDetector {
    settings: PlateauSettings,
    window: VecDeque<usize>,
    window_sum: usize,
    low_streak: u32,
    points: usize,
    phase: PlateauPhase,
}

impl PlateauDetector {
    pub fn new(settings: PlateauSettings) -> Self {
        let phase = if settings.warmup_points == 0 {
            PlateauPhase::Sampling
        } else {
            PlateauPhase::WarmingUp
        };
        Self {
            window: VecDeque::with_capacity(settings.window),
            settings,
            window_sum: 0,
            low_streak: 0,
            points: 0,
            phase,
        }
    }

    pub fn observe(&mut self, new_count: usize) -> PlateauSignal {
        if self.phase == PlateauPhase::Stopped {
            return PlateauSignal::Stop;
        }

        self.points += 1;
        if self.phase == PlateauPhase::WarmingUp && self.points >= self.settings.warmup_points {
            self.phase = PlateauPhase::Sampling;
            self.window.clear();
            self.window_sum = 0;
            self.low_streak = 0;
        }

        self.push(new_count);

        if self.phase != PlateauPhase::Sampling || self.window.len() < self.settings.window {
            return PlateauSignal::Continue;
        }

        if self.average() < self.settings.threshold {
            self.low_streak += 1;
        } else {
            self.low_streak = 0;
        }

        if self.low_streak >= self.settings.stable_windows {
            self.phase = PlateauPhase::Stopped;
            return PlateauSignal::Stop;
        }
        PlateauSignal::Continue
    }

    fn push(&mut self, value: usize) {
        if self.window.len() == self.settings.window {
            if let Some(evicted) = self.window.pop_front() {
                self.window_sum -= evicted;
            }
        }
        self.window.push_back(value);
        self.window_sum += value;
    }

    /// Mean of the current window; zero while the window is empty.
    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window_sum as f64 / self.window.len() as f64
        }
    }

    pub fn phase(&self) -> PlateauPhase {
        self.phase
    }

    pub fn low_streak(&self) -> u32 {
        self.low_streak
    }

    pub fn points(&self) -> usize {
        self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> PlateauDetector {
        PlateauDetector::new(PlateauSettings::default())
    }

    fn feed(detector: &mut PlateauDetector, values: impl IntoIterator<Item = usize>) -> usize {
        let mut stops = 0;
        for value in values {
            if detector.observe(value) == PlateauSignal::Stop {
                stops += 1;
            }
        }
        stops
    }

    #[test]
    fn warmup_then_zero_yield_accumulates_toward_stop() {
        let mut detector = detector();

        assert_eq!(feed(&mut detector, std::iter::repeat(0).take(79)), 0);
        assert_eq!(detector.phase(), PlateauPhase::WarmingUp);

        assert_eq!(feed(&mut detector, [0]), 0);
        assert_eq!(detector.phase(), PlateauPhase::Sampling);
        assert_eq!(detector.low_streak(), 0);

        // the window refills from the 80th point: full at point 129
        assert_eq!(feed(&mut detector, std::iter::repeat(0).take(50)), 0);
        assert_eq!(detector.phase(), PlateauPhase::Sampling);
        assert_eq!(detector.low_streak(), 2);

        assert_eq!(feed(&mut detector, [0, 0]), 0);
        assert_eq!(detector.observe(0), PlateauSignal::Stop);
        assert_eq!(detector.phase(), PlateauPhase::Stopped);
        assert_eq!(detector.points(), 133);
    }

    #[test]
    fn stays_stopped_once_stopped() {
        let mut detector = detector();
        feed(&mut detector, std::iter::repeat(0).take(133));
        assert_eq!(detector.phase(), PlateauPhase::Stopped);
        assert_eq!(detector.observe(40), PlateauSignal::Stop);
    }

    #[test]
    fn alternating_yield_at_threshold_never_stops() {
        let mut detector = detector();
        let values = (0..5_000).map(|i| i % 2);
        assert_eq!(feed(&mut detector, values), 0);
        assert_eq!(detector.phase(), PlateauPhase::Sampling);
        assert_eq!(detector.low_streak(), 0);
    }

    #[test]
    fn warmup_samples_are_discarded() {
        let mut detector = detector();
        // a dense start would otherwise hold the average up for a full window
        feed(&mut detector, std::iter::repeat(60).take(79));
        feed(&mut detector, std::iter::repeat(0).take(50));
        assert_eq!(detector.average(), 0.0);
        assert!(detector.low_streak() >= 1);
    }

    #[test]
    fn high_yield_resets_streak() {
        let settings = PlateauSettings {
            window: 4,
            threshold: 0.5,
            stable_windows: 3,
            warmup_points: 0,
        };
        let mut detector = PlateauDetector::new(settings);
        assert_eq!(detector.phase(), PlateauPhase::Sampling);

        feed(&mut detector, [0, 0, 0, 0, 0]);
        assert_eq!(detector.low_streak(), 2);
        feed(&mut detector, [9]);
        assert_eq!(detector.low_streak(), 0);
        feed(&mut detector, [0, 0, 0]);
        assert_eq!(detector.low_streak(), 0);
        assert_eq!(detector.observe(0), PlateauSignal::Continue);
        assert_eq!(detector.low_streak(), 1);
    }
}
