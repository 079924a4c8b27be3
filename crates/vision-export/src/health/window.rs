//! Windowed timers and distance checks
//!
//! All three primitives are driven by the simulation's monotonic game time in
//! milliseconds. None of them reads a baseline before it has been recorded:
//! the first call after construction or [`reset`](WindowTimer::reset) only
//! establishes state and always reports `false`.

use glam::{Vec2, Vec3};
use std::time::Duration;

/// Reports whether a fixed interval has passed since a lazily-recorded
/// baseline.
#[derive(Debug, Clone)]
pub struct WindowTimer {
    interval_ms: u64,
    baseline_ms: Option<u64>,
}

impl WindowTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            baseline_ms: None,
        }
    }

    /// Forget the baseline; the next `elapsed` call records a new one.
    pub fn reset(&mut self) {
        self.baseline_ms = None;
    }

    /// Move the baseline to `now_ms` without reporting anything.
    pub fn restart(&mut self, now_ms: u64) {
        self.baseline_ms = Some(now_ms);
    }

    /// `true` once `now_ms - baseline >= interval`. Never resets itself.
    pub fn elapsed(&mut self, now_ms: u64) -> bool {
        match self.baseline_ms {
            None => {
                self.baseline_ms = Some(now_ms);
                false
            }
            Some(start) => now_ms.saturating_sub(start) >= self.interval_ms,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.baseline_ms.is_some()
    }

    pub fn baseline_ms(&self) -> Option<u64> {
        self.baseline_ms
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Which side of the threshold counts as a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistancePredicate {
    /// Still within `threshold` of the reference point.
    Near,
    /// Moved beyond `threshold` from the reference point.
    Far,
}

impl DistancePredicate {
    fn holds(self, distance: f32, threshold: f32) -> bool {
        match self {
            DistancePredicate::Near => distance < threshold,
            DistancePredicate::Far => distance > threshold,
        }
    }
}

/// After a window elapses, compares the current position against the
/// position observed when the window started.
#[derive(Debug, Clone)]
pub struct DistanceWindowChecker {
    timer: WindowTimer,
    center: Vec3,
    threshold: f32,
    predicate: DistancePredicate,
}

impl DistanceWindowChecker {
    pub fn new(window: Duration, threshold: f32, predicate: DistancePredicate) -> Self {
        Self {
            timer: WindowTimer::new(window),
            center: Vec3::ZERO,
            threshold,
            predicate,
        }
    }

    pub fn reset(&mut self) {
        self.timer.reset();
    }

    pub fn check(&mut self, now_ms: u64, position: Vec3) -> bool {
        if !self.timer.is_initialized() {
            self.timer.restart(now_ms);
            self.center = position;
            return false;
        }
        self.timer.elapsed(now_ms)
            && self
                .predicate
                .holds(position.distance(self.center), self.threshold)
    }

    /// Reference point of the current window, if one has been recorded.
    pub fn center(&self) -> Option<Vec3> {
        self.timer.is_initialized().then_some(self.center)
    }
}

/// Fires when the ground-plane distance to a target has not improved for a
/// whole window.
///
/// Every strict improvement records a new minimum and slides the window
/// baseline to the current time. Once fired, the checker stays quiet until the
/// next improvement or reset, so a single stagnation period reports once.
#[derive(Debug, Clone)]
pub struct ProgressChecker {
    timer: WindowTimer,
    target: Vec2,
    min_distance: f32,
    fired: bool,
}

impl ProgressChecker {
    pub fn new(window: Duration, target: Vec2) -> Self {
        Self {
            timer: WindowTimer::new(window),
            target,
            min_distance: f32::INFINITY,
            fired: false,
        }
    }

    pub fn reset(&mut self) {
        self.timer.reset();
        self.min_distance = f32::INFINITY;
        self.fired = false;
    }

    pub fn check(&mut self, now_ms: u64, position: Vec3) -> bool {
        if !self.timer.is_initialized() {
            self.timer.restart(now_ms);
            self.min_distance = f32::INFINITY;
            self.fired = false;
            return false;
        }

        let distance = self.target.distance(position.truncate());
        if distance < self.min_distance {
            self.min_distance = distance;
            self.timer.restart(now_ms);
            self.fired = false;
        }

        if self.fired {
            return false;
        }
        if self.timer.elapsed(now_ms) && distance >= self.min_distance {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn min_distance(&self) -> f32 {
        self.min_distance
    }

    pub fn baseline_ms(&self) -> Option<u64> {
        self.timer.baseline_ms()
    }

    pub fn target(&self) -> Vec2 {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== WindowTimer ==========

    #[test]
    fn first_call_only_records_baseline() {
        let mut timer = WindowTimer::new(Duration::from_secs(1));
        assert!(!timer.is_initialized());
        assert!(!timer.elapsed(5_000));
        assert_eq!(timer.baseline_ms(), Some(5_000));
    }

    #[test]
    fn fires_once_interval_passes() {
        let mut timer = WindowTimer::new(Duration::from_millis(500));
        timer.elapsed(1_000);
        assert!(!timer.elapsed(1_499));
        assert!(timer.elapsed(1_500));
        // No auto-reset: still true afterwards.
        assert!(timer.elapsed(1_600));
        assert!(timer.elapsed(90_000));
    }

    #[test]
    fn reset_forgets_baseline() {
        let mut timer = WindowTimer::new(Duration::from_millis(100));
        timer.elapsed(0);
        assert!(timer.elapsed(200));
        timer.reset();
        assert!(!timer.elapsed(10_000));
        assert!(!timer.elapsed(10_050));
        assert!(timer.elapsed(10_100));
    }

    #[test]
    fn zero_interval_fires_on_second_call() {
        let mut timer = WindowTimer::new(Duration::ZERO);
        assert!(!timer.elapsed(7));
        assert!(timer.elapsed(7));
    }

    // ========== DistanceWindowChecker ==========

    #[test]
    fn near_checker_silent_inside_window() {
        let mut checker =
            DistanceWindowChecker::new(Duration::from_secs(60), 10.0, DistancePredicate::Near);
        assert!(!checker.check(0, Vec3::ZERO));
        for t in (100..60_000).step_by(100) {
            assert!(!checker.check(t, Vec3::ZERO), "fired early at {t}");
        }
        assert!(checker.check(60_000, Vec3::new(1.0, 1.0, 0.0)));
    }

    #[test]
    fn near_checker_ignores_vehicle_that_left() {
        let mut checker =
            DistanceWindowChecker::new(Duration::from_secs(60), 10.0, DistancePredicate::Near);
        checker.check(0, Vec3::ZERO);
        assert!(!checker.check(61_000, Vec3::new(50.0, 0.0, 0.0)));
    }

    #[test]
    fn far_checker_uses_original_center() {
        let mut checker =
            DistanceWindowChecker::new(Duration::from_secs(1), 5.0, DistancePredicate::Far);
        checker.check(0, Vec3::new(100.0, 100.0, 0.0));
        assert_eq!(checker.center(), Some(Vec3::new(100.0, 100.0, 0.0)));
        assert!(!checker.check(1_000, Vec3::new(103.0, 100.0, 0.0)));
        assert!(checker.check(1_100, Vec3::new(106.0, 100.0, 0.0)));
    }

    #[test]
    fn distance_reset_takes_new_center() {
        let mut checker =
            DistanceWindowChecker::new(Duration::from_secs(1), 10.0, DistancePredicate::Near);
        checker.check(0, Vec3::ZERO);
        checker.reset();
        assert_eq!(checker.center(), None);
        assert!(!checker.check(5_000, Vec3::new(500.0, 0.0, 0.0)));
        assert!(checker.check(6_000, Vec3::new(505.0, 0.0, 0.0)));
    }

    // ========== ProgressChecker ==========

    #[test]
    fn steady_improvement_never_fires() {
        let mut checker = ProgressChecker::new(Duration::from_secs(1), Vec2::ZERO);
        checker.check(0, Vec3::new(1_000.0, 0.0, 0.0));
        for step in 1..200u64 {
            let now = step * 100;
            let position = Vec3::new(1_000.0 - step as f32, 0.0, 0.0);
            assert!(!checker.check(now, position), "fired at step {step}");
            assert_eq!(checker.baseline_ms(), Some(now));
        }
    }

    #[test]
    fn stagnation_fires_once() {
        let mut checker = ProgressChecker::new(Duration::from_secs(1), Vec2::ZERO);
        let stuck = Vec3::new(0.0, 40.0, 0.0);
        checker.check(0, stuck);
        assert!(!checker.check(100, stuck));
        assert_eq!(checker.min_distance(), 40.0);
        assert!(!checker.check(1_099, stuck));
        assert!(checker.check(1_100, stuck));
        assert!(!checker.check(1_200, stuck));
        assert!(!checker.check(5_000, Vec3::new(0.0, 45.0, 0.0)));

        // Improvement re-arms the checker.
        assert!(!checker.check(5_100, Vec3::new(0.0, 30.0, 0.0)));
        assert!(checker.check(6_100, Vec3::new(0.0, 31.0, 0.0)));
    }

    #[test]
    fn progress_ignores_height() {
        let mut checker = ProgressChecker::new(Duration::from_secs(1), Vec2::new(3.0, 4.0));
        checker.check(0, Vec3::new(0.0, 0.0, 900.0));
        checker.check(10, Vec3::new(0.0, 0.0, 900.0));
        assert!((checker.min_distance() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn progress_reset_clears_minimum() {
        let mut checker = ProgressChecker::new(Duration::from_secs(1), Vec2::ZERO);
        checker.check(0, Vec3::X);
        checker.check(10, Vec3::X);
        checker.reset();
        assert_eq!(checker.min_distance(), f32::INFINITY);
        assert_eq!(checker.baseline_ms(), None);
    }
}
