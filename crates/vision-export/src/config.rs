//! Agent configuration
//!
//! Everything has a default; the environment overrides individual values.
//! A value that is present but does not parse is a startup error naming the
//! offending key.

use anyhow::{bail, Context, Result};
use glam::{Vec2, Vec3};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::encoder::ArtifactLayout;
use crate::health::{ProgressConfig, StuckConfig};
use crate::pipeline::PipelineConfig;
use crate::rig::CameraMount;
use crate::store::LocalStoreConfig;

/// Where the driver is put back after a reload.
pub const DEFAULT_RESPAWN_POINT: Vec3 = Vec3::new(1209.5412, -1936.0394, 38.3709);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Image artifacts land here
    pub output_dir: PathBuf,
    pub store: LocalStoreConfig,
    /// Run a capture cycle every N-th tick
    pub every_nth: u64,
    pub tick_interval: Duration,
    /// Simulation time a camera gets to settle after a switch
    pub settle_time: Duration,
    pub capture_delay: Duration,
    pub use_multiple_cameras: bool,
    pub layout: ArtifactLayout,
    pub command_addr: SocketAddr,
    /// Session opened at startup when `auto_start` is set
    pub session_name: Option<String>,
    pub auto_start: bool,
    /// Cameras never move; the vehicle is not recovered
    pub static_camera: bool,
    /// Time scale while capture is enabled
    pub time_scale: f32,
    /// Time scale during a capture cycle
    pub capture_time_scale: f32,
    pub detection_radius: f32,
    pub stuck: StuckConfig,
    pub main_camera: CameraMount,
    pub mounts: Vec<CameraMount>,
    pub respawn_point: Vec3,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("captures/images"),
            store: LocalStoreConfig::default(),
            every_nth: 5,
            tick_interval: Duration::from_millis(100),
            settle_time: Duration::from_millis(500),
            capture_delay: Duration::ZERO,
            use_multiple_cameras: true,
            layout: ArtifactLayout::SingleFile,
            command_addr: SocketAddr::from(([127, 0, 0, 1], 5555)),
            session_name: None,
            auto_start: false,
            static_camera: false,
            time_scale: 0.5,
            capture_time_scale: 0.005,
            detection_radius: 500.0,
            stuck: StuckConfig::default(),
            main_camera: CameraMount::new(Vec3::ZERO, Vec3::ZERO),
            mounts: roof_mounts(),
            respawn_point: DEFAULT_RESPAWN_POINT,
        }
    }
}

/// Four roof cameras looking front, left, back and right.
pub fn roof_mounts() -> Vec<CameraMount> {
    [0.0, 90.0, 180.0, 270.0]
        .into_iter()
        .map(|yaw| {
            CameraMount::new(Vec3::new(0.0, 0.0, 2.5626), Vec3::new(0.0, 0.0, yaw))
                .with_optics(65.0, 0.15)
        })
        .collect()
}

impl AgentConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("VISION_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("VISION_STORE_PATH") {
            config.store.root_path = PathBuf::from(path);
        }
        if let Some(n) = parse::<u64>(&lookup, "VISION_EVERY_NTH")? {
            if n == 0 {
                bail!("VISION_EVERY_NTH must be at least 1");
            }
            config.every_nth = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "VISION_SETTLE_MS")? {
            config.settle_time = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "VISION_CAPTURE_DELAY_MS")? {
            config.capture_delay = Duration::from_millis(ms);
        }
        if let Some(flag) = lookup("VISION_MULTI_CAMERA") {
            config.use_multiple_cameras = flag != "0";
        }
        if let Some(flag) = lookup("VISION_SPLIT_ARTIFACTS") {
            config.layout = if flag == "1" {
                ArtifactLayout::SplitFiles
            } else {
                ArtifactLayout::SingleFile
            };
        }
        if let Some(addr) = parse::<SocketAddr>(&lookup, "VISION_COMMAND_ADDR")? {
            config.command_addr = addr;
        }
        config.session_name = lookup("VISION_SESSION_NAME").filter(|s| !s.is_empty());
        if let Some(flag) = lookup("VISION_AUTO_START") {
            config.auto_start = flag == "1";
        }
        if let Some(flag) = lookup("VISION_STATIC_CAMERA") {
            config.static_camera = flag == "1";
        }
        if let Some(raw) = lookup("VISION_PROGRESS_TARGET") {
            let target = parse_point(&raw)
                .with_context(|| format!("invalid VISION_PROGRESS_TARGET: {raw:?}"))?;
            config.stuck.progress = Some(ProgressConfig::new(target));
        }
        if let Some(scale) = parse::<f32>(&lookup, "VISION_TIME_SCALE")? {
            if !scale.is_finite() || scale <= 0.0 {
                bail!("VISION_TIME_SCALE must be positive, got {scale}");
            }
            config.time_scale = scale;
        }

        Ok(config)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            output_dir: self.output_dir.clone(),
            use_multiple_cameras: self.use_multiple_cameras,
            layout: self.layout,
            detection_radius: self.detection_radius,
            capture_delay: self.capture_delay,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {raw:?}"))
        })
        .transpose()
}

fn parse_point(raw: &str) -> Result<Vec2> {
    let Some((x, y)) = raw.split_once(',') else {
        bail!("expected \"x,y\"");
    };
    Ok(Vec2::new(x.trim().parse()?, y.trim().parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::DEFAULT_COMMAND_ADDR;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = AgentConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.every_nth, 5);
        assert_eq!(config.mounts.len(), 4);
        assert_eq!(config.command_addr.to_string(), DEFAULT_COMMAND_ADDR);
        assert!(config.stuck.progress.is_none());
        assert_eq!(config.layout, ArtifactLayout::SingleFile);
        assert_eq!(config.respawn_point, DEFAULT_RESPAWN_POINT);
    }

    #[test]
    fn overrides_apply() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("VISION_OUTPUT_DIR", "/tmp/out"),
            ("VISION_EVERY_NTH", "10"),
            ("VISION_SETTLE_MS", "250"),
            ("VISION_MULTI_CAMERA", "0"),
            ("VISION_SPLIT_ARTIFACTS", "1"),
            ("VISION_COMMAND_ADDR", "0.0.0.0:6000"),
            ("VISION_SESSION_NAME", "night-run"),
            ("VISION_AUTO_START", "1"),
            ("VISION_PROGRESS_TARGET", "100.5, -20"),
        ]))
        .unwrap();

        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.every_nth, 10);
        assert_eq!(config.settle_time, Duration::from_millis(250));
        assert!(!config.use_multiple_cameras);
        assert_eq!(config.layout, ArtifactLayout::SplitFiles);
        assert_eq!(config.command_addr.port(), 6000);
        assert_eq!(config.session_name.as_deref(), Some("night-run"));
        assert!(config.auto_start);
        let progress = config.stuck.progress.unwrap();
        assert_eq!(progress.target, Vec2::new(100.5, -20.0));
    }

    #[test]
    fn malformed_values_name_the_key() {
        let err = AgentConfig::from_lookup(lookup(&[("VISION_EVERY_NTH", "often")])).unwrap_err();
        assert!(err.to_string().contains("VISION_EVERY_NTH"));

        let err =
            AgentConfig::from_lookup(lookup(&[("VISION_PROGRESS_TARGET", "12")])).unwrap_err();
        assert!(err.to_string().contains("VISION_PROGRESS_TARGET"));

        assert!(AgentConfig::from_lookup(lookup(&[("VISION_EVERY_NTH", "0")])).is_err());
        assert!(AgentConfig::from_lookup(lookup(&[("VISION_TIME_SCALE", "-1")])).is_err());
    }
}
