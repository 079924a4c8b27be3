//! Stuck detection for the driven vehicle
//!
//! Checks run in a fixed priority order and stop at the first one that asks
//! for a reload:
//! 1. Vehicle destroyed or driver dead
//! 2. Driver not in a vehicle
//! 3. Speed below `low_speed` for the whole low-speed window
//! 4. Speed below `stopped_speed` for the not-moving window (a shorter idle
//!    window only asks the driver to resume)
//! 5. Still near the position the near-point window started at
//! 6. No progress toward a target (opt-in)
//!
//! The speed timers reset individually whenever their healthy condition is
//! observed. Everything else is reset only by [`StuckDetector::clear_all`]
//! after a recovery.

use glam::Vec2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use super::window::{DistancePredicate, DistanceWindowChecker, ProgressChecker, WindowTimer};
use crate::world::VehicleState;

/// Thresholds and windows for the stuck detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckConfig {
    /// Speeds below this count as crawling
    pub low_speed: f32,
    /// How long the vehicle may crawl before a reload
    pub low_speed_window: Duration,
    /// Speeds below this count as standing still
    pub stopped_speed: f32,
    /// How long the vehicle may stand still before a reload
    pub not_moving_window: Duration,
    /// Standing still this long asks the driver to resume
    pub idle_window: Duration,
    /// Radius around the window-start position that counts as "no headway"
    pub near_point_radius: f32,
    /// Window for the near-point check
    pub near_point_window: Duration,
    /// Target-progress check, disabled when `None`
    pub progress: Option<ProgressConfig>,
}

/// Opt-in check that the vehicle keeps closing in on a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    pub target: Vec2,
    pub window: Duration,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            low_speed: 1.0,
            low_speed_window: Duration::from_secs(20 * 60),
            stopped_speed: 0.01,
            not_moving_window: Duration::from_secs(300),
            idle_window: Duration::from_secs(60),
            near_point_radius: 10.0,
            near_point_window: Duration::from_secs(60),
            progress: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(target: Vec2) -> Self {
        Self {
            target,
            window: Duration::from_secs(150),
        }
    }
}

/// Why the detector asked for a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    Destroyed,
    NotInVehicle,
    LowSpeed,
    NotMoving,
    NearStartPoint,
    NoProgress,
}

impl fmt::Display for ReloadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReloadReason::Destroyed => "vehicle destroyed or driver dead",
            ReloadReason::NotInVehicle => "driver not in vehicle",
            ReloadReason::LowSpeed => "low speed for too long",
            ReloadReason::NotMoving => "not moving for too long",
            ReloadReason::NearStartPoint => "no headway from window start",
            ReloadReason::NoProgress => "no progress toward target",
        };
        f.write_str(s)
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    NoActionNeeded,
    NeedReload(ReloadReason),
}

impl HealthVerdict {
    pub fn needs_reload(self) -> bool {
        matches!(self, HealthVerdict::NeedReload(_))
    }
}

/// Verdict plus the non-fatal "resume driving" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub verdict: HealthVerdict,
    /// The vehicle has idled past the idle window
    pub resume_driving: bool,
}

impl HealthReport {
    fn reload(reason: ReloadReason) -> Self {
        Self {
            verdict: HealthVerdict::NeedReload(reason),
            resume_driving: false,
        }
    }
}

pub struct StuckDetector {
    config: StuckConfig,
    low_speed: WindowTimer,
    not_moving: WindowTimer,
    idle: WindowTimer,
    near_point: DistanceWindowChecker,
    progress: Option<ProgressChecker>,
}

impl StuckDetector {
    pub fn new(config: StuckConfig) -> Self {
        let progress = config
            .progress
            .as_ref()
            .map(|p| ProgressChecker::new(p.window, p.target));
        Self {
            low_speed: WindowTimer::new(config.low_speed_window),
            not_moving: WindowTimer::new(config.not_moving_window),
            idle: WindowTimer::new(config.idle_window),
            near_point: DistanceWindowChecker::new(
                config.near_point_window,
                config.near_point_radius,
                DistancePredicate::Near,
            ),
            progress,
            config,
        }
    }

    pub fn config(&self) -> &StuckConfig {
        &self.config
    }

    /// Run the checks in priority order against one vehicle sample.
    pub fn evaluate(&mut self, now_ms: u64, vehicle: &VehicleState) -> HealthReport {
        if !vehicle.alive {
            return HealthReport::reload(ReloadReason::Destroyed);
        }
        if !vehicle.in_vehicle {
            return HealthReport::reload(ReloadReason::NotInVehicle);
        }

        if vehicle.speed < self.config.low_speed {
            if self.low_speed.elapsed(now_ms) {
                return HealthReport::reload(ReloadReason::LowSpeed);
            }
        } else {
            self.low_speed.reset();
        }

        let mut resume_driving = false;
        if vehicle.speed < self.config.stopped_speed {
            if self.not_moving.elapsed(now_ms) {
                return HealthReport::reload(ReloadReason::NotMoving);
            }
            if self.idle.elapsed(now_ms) {
                debug!(speed = vehicle.speed, "vehicle idle, asking driver to resume");
                resume_driving = true;
            }
        } else {
            self.not_moving.reset();
            self.idle.reset();
        }

        if self.near_point.check(now_ms, vehicle.position) {
            return HealthReport::reload(ReloadReason::NearStartPoint);
        }

        if let Some(progress) = self.progress.as_mut() {
            if progress.check(now_ms, vehicle.position) {
                return HealthReport::reload(ReloadReason::NoProgress);
            }
        }

        HealthReport {
            verdict: HealthVerdict::NoActionNeeded,
            resume_driving,
        }
    }

    /// Reset every timer and checker. Called after a recovery.
    pub fn clear_all(&mut self) {
        info!("clearing stuck checkers");
        self.low_speed.reset();
        self.not_moving.reset();
        self.idle.reset();
        self.near_point.reset();
        if let Some(progress) = self.progress.as_mut() {
            progress.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    const TICK_MS: u64 = 100;

    fn driving(speed: f32, position: Vec3) -> VehicleState {
        VehicleState {
            alive: true,
            in_vehicle: true,
            speed,
            position,
            ..VehicleState::default()
        }
    }

    /// Near-point check pushed out of the way so speed checks can be observed.
    fn speed_only_config() -> StuckConfig {
        StuckConfig {
            near_point_window: Duration::from_secs(24 * 3600),
            ..StuckConfig::default()
        }
    }

    // ========== Priority ==========

    #[test]
    fn dead_driver_needs_reload_first() {
        let mut detector = StuckDetector::new(StuckConfig::default());
        let vehicle = VehicleState {
            alive: false,
            in_vehicle: false,
            ..driving(0.0, Vec3::ZERO)
        };
        assert_eq!(
            detector.evaluate(0, &vehicle).verdict,
            HealthVerdict::NeedReload(ReloadReason::Destroyed)
        );
    }

    #[test]
    fn on_foot_needs_reload() {
        let mut detector = StuckDetector::new(StuckConfig::default());
        let vehicle = VehicleState {
            in_vehicle: false,
            ..driving(30.0, Vec3::ZERO)
        };
        assert_eq!(
            detector.evaluate(0, &vehicle).verdict,
            HealthVerdict::NeedReload(ReloadReason::NotInVehicle)
        );
    }

    // ========== Speed windows ==========

    #[test]
    fn stopped_vehicle_reloads_after_not_moving_window() {
        let mut detector = StuckDetector::new(speed_only_config());
        let window_ms = 300_000;
        let mut now = 0;
        while now < window_ms {
            let report = detector.evaluate(now, &driving(0.0, Vec3::ZERO));
            assert_eq!(report.verdict, HealthVerdict::NoActionNeeded, "at {now}");
            now += TICK_MS;
        }
        assert_eq!(
            detector.evaluate(now, &driving(0.0, Vec3::ZERO)).verdict,
            HealthVerdict::NeedReload(ReloadReason::NotMoving)
        );
    }

    #[test]
    fn idle_window_requests_resume_without_reload() {
        let mut detector = StuckDetector::new(speed_only_config());
        detector.evaluate(0, &driving(0.0, Vec3::ZERO));
        let before = detector.evaluate(59_900, &driving(0.0, Vec3::ZERO));
        assert!(!before.resume_driving);
        let after = detector.evaluate(60_000, &driving(0.0, Vec3::ZERO));
        assert!(after.resume_driving);
        assert_eq!(after.verdict, HealthVerdict::NoActionNeeded);
    }

    #[test]
    fn movement_resets_stopped_timers() {
        let mut detector = StuckDetector::new(speed_only_config());
        detector.evaluate(0, &driving(0.0, Vec3::ZERO));
        detector.evaluate(299_000, &driving(0.0, Vec3::ZERO));
        detector.evaluate(299_100, &driving(0.5, Vec3::ZERO));
        let report = detector.evaluate(300_000, &driving(0.0, Vec3::ZERO));
        assert_eq!(report.verdict, HealthVerdict::NoActionNeeded);
        assert!(!report.resume_driving);
    }

    #[test]
    fn crawling_reloads_after_low_speed_window() {
        let mut detector = StuckDetector::new(speed_only_config());
        let crawl = driving(0.5, Vec3::ZERO);
        detector.evaluate(0, &crawl);
        assert_eq!(
            detector.evaluate(20 * 60 * 1000 - 1, &crawl).verdict,
            HealthVerdict::NoActionNeeded
        );
        assert_eq!(
            detector.evaluate(20 * 60 * 1000, &crawl).verdict,
            HealthVerdict::NeedReload(ReloadReason::LowSpeed)
        );
    }

    #[test]
    fn cruising_never_trips_low_speed() {
        let mut detector = StuckDetector::new(StuckConfig::default());
        let mut position = Vec3::ZERO;
        // Two hours at 30 units/s, three units per tick along X.
        for tick in 0..72_000u64 {
            position.x += 3.0;
            let report = detector.evaluate(tick * TICK_MS, &driving(30.0, position));
            assert_eq!(report.verdict, HealthVerdict::NoActionNeeded, "tick {tick}");
        }
    }

    // ========== Near point ==========

    #[test]
    fn circling_near_start_reloads() {
        let mut detector = StuckDetector::new(StuckConfig::default());
        detector.evaluate(0, &driving(5.0, Vec3::new(0.0, 0.0, 0.0)));
        assert_eq!(
            detector.evaluate(30_000, &driving(5.0, Vec3::new(4.0, 0.0, 0.0))).verdict,
            HealthVerdict::NoActionNeeded
        );
        assert_eq!(
            detector.evaluate(60_000, &driving(5.0, Vec3::new(3.0, 3.0, 0.0))).verdict,
            HealthVerdict::NeedReload(ReloadReason::NearStartPoint)
        );
    }

    #[test]
    fn clear_all_restarts_every_window() {
        let mut detector = StuckDetector::new(StuckConfig::default());
        detector.evaluate(0, &driving(0.0, Vec3::ZERO));
        assert!(detector
            .evaluate(60_000, &driving(0.0, Vec3::ZERO))
            .verdict
            .needs_reload());

        detector.clear_all();
        assert_eq!(
            detector.evaluate(61_000, &driving(0.0, Vec3::ZERO)).verdict,
            HealthVerdict::NoActionNeeded
        );
        assert_eq!(
            detector.evaluate(120_000, &driving(0.0, Vec3::ZERO)).verdict,
            HealthVerdict::NoActionNeeded
        );
    }

    // ========== Progress ==========

    #[test]
    fn progress_check_is_opt_in() {
        let mut config = speed_only_config();
        config.progress = Some(ProgressConfig {
            target: Vec2::new(1_000.0, 0.0),
            window: Duration::from_secs(10),
        });
        let mut detector = StuckDetector::new(config);

        // Driving in a circle far from the target: fast, but no headway.
        detector.evaluate(0, &driving(20.0, Vec3::new(0.0, 0.0, 0.0)));
        detector.evaluate(100, &driving(20.0, Vec3::new(0.0, 0.0, 0.0)));
        let report = detector.evaluate(10_100, &driving(20.0, Vec3::new(0.0, 50.0, 0.0)));
        assert_eq!(
            report.verdict,
            HealthVerdict::NeedReload(ReloadReason::NoProgress)
        );

        let mut disabled = StuckDetector::new(speed_only_config());
        disabled.evaluate(0, &driving(20.0, Vec3::ZERO));
        disabled.evaluate(100, &driving(20.0, Vec3::ZERO));
        assert_eq!(
            disabled
                .evaluate(10_100, &driving(20.0, Vec3::new(0.0, 50.0, 0.0)))
                .verdict,
            HealthVerdict::NoActionNeeded
        );
    }

    #[test]
    fn reasons_display() {
        assert_eq!(ReloadReason::NotMoving.to_string(), "not moving for too long");
        assert_eq!(ReloadReason::Destroyed.to_string(), "vehicle destroyed or driver dead");
    }
}
