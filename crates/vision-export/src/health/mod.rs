//! Vehicle health monitoring
//!
//! - **window**: `WindowTimer`, `DistanceWindowChecker`, `ProgressChecker`
//! - **detector**: `StuckDetector`, the prioritized check that turns vehicle
//!   samples into a reload verdict

mod detector;
mod window;

pub use detector::{
    HealthReport, HealthVerdict, ProgressConfig, ReloadReason, StuckConfig, StuckDetector,
};
pub use window::{DistancePredicate, DistanceWindowChecker, ProgressChecker, WindowTimer};
