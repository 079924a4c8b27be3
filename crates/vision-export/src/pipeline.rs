//! Capture cycle
//!
//! One cycle walks every camera of the rig (or just the main camera), reads
//! the planes back, assembles a [`Snapshot`] and hands the planes to the
//! encoder. The snapshot is then chained behind its artifact in the session
//! controller, so nothing is persisted unless the files exist.
//!
//! A camera whose planes or render state are missing is skipped; the rest of
//! the cycle continues.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encoder::{ArtifactLayout, EncodeError, EncodeRequest, ImageEncoder};
use crate::geometry::split_view_projection;
use crate::rig::{ActiveCamera, ActiveCameraState, CameraRig};
use crate::session::SessionRunController;
use crate::snapshot::{CameraParams, Detection, Snapshot, SNAPSHOT_VERSION};
use crate::world::{CaptureBuffers, RenderState, Simulation};

/// Timestamp layout of image names.
pub const IMAGE_TIME_FORMAT: &str = "%Y-%m-%d--%H-%M-%S--%3f";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory receiving image artifacts
    pub output_dir: PathBuf,
    /// Walk every mount instead of the main camera
    pub use_multiple_cameras: bool,
    pub layout: ArtifactLayout,
    /// Entities further than this from the vehicle are not detected
    pub detection_radius: f32,
    /// Extra simulation time between activating a mount and reading it
    pub capture_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("captures/images"),
            use_multiple_cameras: true,
            layout: ArtifactLayout::SingleFile,
            detection_radius: 500.0,
            capture_delay: Duration::ZERO,
        }
    }
}

/// Result of capturing through one camera.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// Encode started and snapshot queued for persistence
    Submitted { image_name: String },
    /// Planes or render state were not available
    Unavailable,
    /// Planes failed validation; nothing was written
    Rejected(EncodeError),
    /// No run is open
    NoRun,
}

impl CaptureOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, CaptureOutcome::Submitted { .. })
    }
}

#[derive(Debug)]
pub struct CycleReport {
    /// Shared by every snapshot of the cycle
    pub scene_id: Uuid,
    pub outcomes: Vec<(ActiveCamera, CaptureOutcome)>,
}

impl CycleReport {
    pub fn submitted(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_submitted()).count()
    }
}

pub struct SnapshotPipeline {
    config: PipelineConfig,
    encoder: ImageEncoder,
}

impl SnapshotPipeline {
    /// Create the pipeline and its output directory.
    pub fn new(config: PipelineConfig, runtime: Handle) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir).with_context(|| {
            format!("failed to create output directory {}", config.output_dir.display())
        })?;
        Ok(Self {
            config,
            encoder: ImageEncoder::new(runtime),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Capture through the configured cameras.
    ///
    /// Rig errors are configuration errors and abort the cycle.
    pub fn capture_cycle<S: Simulation + ?Sized>(
        &mut self,
        sim: &mut S,
        rig: &mut CameraRig,
        session: &mut SessionRunController,
    ) -> Result<CycleReport> {
        let scene_id = Uuid::new_v4();
        let mut outcomes = Vec::new();

        if self.config.use_multiple_cameras {
            for index in 0..rig.mount_count() {
                let state = rig
                    .activate(sim, index)
                    .with_context(|| format!("failed to activate camera {index}"))?;
                if !self.config.capture_delay.is_zero() {
                    sim.wait(self.config.capture_delay);
                }
                let outcome = self.capture_one(sim, &state, scene_id, session);
                outcomes.push((state.camera, outcome));
            }
            rig.deactivate(sim).context("failed to deactivate cameras")?;
        } else {
            let state = match rig.active().copied() {
                Some(state) if rig.is_main_active() => state,
                _ => rig.activate_main(sim).context("failed to activate main camera")?,
            };
            let outcome = self.capture_one(sim, &state, scene_id, session);
            outcomes.push((state.camera, outcome));
        }

        let report = CycleReport { scene_id, outcomes };
        info!(
            scene = %scene_id,
            cameras = report.outcomes.len(),
            submitted = report.submitted(),
            "capture cycle finished"
        );
        Ok(report)
    }

    /// Capture through whatever camera is rendering right now.
    pub fn capture_one<S: Simulation + ?Sized>(
        &mut self,
        sim: &mut S,
        state: &ActiveCameraState,
        scene_id: Uuid,
        session: &mut SessionRunController,
    ) -> CaptureOutcome {
        let camera = state.camera;
        if session.run().is_none() {
            debug!(?camera, "no open run, capture skipped");
            return CaptureOutcome::NoRun;
        }
        let Some(buffers) = sim.capture_buffers() else {
            warn!(?camera, "capture buffers unavailable, camera skipped");
            return CaptureOutcome::Unavailable;
        };
        let Some(render) = sim.render_state() else {
            warn!(?camera, "render state unavailable, camera skipped");
            return CaptureOutcome::Unavailable;
        };
        let captured_at = Utc::now();
        let image_name = image_name(captured_at, camera);
        let Some(snapshot) =
            self.assemble(sim, state, &render, &buffers, scene_id, captured_at, &image_name)
        else {
            warn!(?camera, "camera matrices not invertible, camera skipped");
            return CaptureOutcome::Unavailable;
        };

        let request = EncodeRequest::new(
            self.config.output_dir.join(&image_name),
            self.config.layout,
            buffers,
        );
        let artifact = match self.encoder.submit(request) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(?camera, image = %image_name, error = %e, "capture rejected");
                return CaptureOutcome::Rejected(e);
            }
        };
        if !session.submit_snapshot(snapshot, artifact) {
            return CaptureOutcome::NoRun;
        }
        debug!(?camera, image = %image_name, scene = %scene_id, "snapshot submitted");
        CaptureOutcome::Submitted { image_name }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble<S: Simulation + ?Sized>(
        &self,
        sim: &S,
        state: &ActiveCameraState,
        render: &RenderState,
        buffers: &CaptureBuffers,
        scene_id: Uuid,
        captured_at: DateTime<Utc>,
        image_name: &str,
    ) -> Option<Snapshot> {
        let (view, projection) =
            split_view_projection(&render.world, &render.world_view, &render.world_view_projection)?;
        let vehicle = sim.vehicle();
        let detections = sim
            .nearby_entities(self.config.detection_radius)
            .iter()
            .map(|entity| Detection::observe(entity, vehicle.position, |p| sim.world_to_screen(p)))
            .collect();

        Some(Snapshot {
            version: SNAPSHOT_VERSION,
            image_name: image_name.to_string(),
            scene_id,
            camera_index: state.camera.mount_index(),
            captured_at,
            time_of_day: sim.time_of_day(),
            weather: sim.weather(),
            camera: CameraParams {
                position: render.camera_position,
                rotation: render.camera_rotation,
                direction: render.camera_direction,
                fov: render.fov,
                near_clip: render.near_clip,
                far_clip: render.far_clip,
            },
            camera_relative: state.camera.mount_index().map(|_| state.relative),
            width: buffers.width,
            height: buffers.height,
            ui_width: render.ui_width,
            ui_height: render.ui_height,
            world_matrix: render.world.to_cols_array(),
            view_matrix: view.to_cols_array(),
            projection_matrix: projection.to_cols_array(),
            vehicle_position: vehicle.position,
            vehicle_velocity: vehicle.velocity,
            vehicle_box: vehicle.model_box,
            current_target: sim.current_target(),
            detections,
        })
    }

    /// Block until the outstanding encode, if any, has finished.
    pub fn flush(&mut self) {
        self.encoder.wait_idle();
    }
}

/// Timestamped base name; the camera suffix keeps names unique within a cycle.
fn image_name(at: DateTime<Utc>, camera: ActiveCamera) -> String {
    let stamp = at.format(IMAGE_TIME_FORMAT);
    match camera {
        ActiveCamera::Main => format!("{stamp}--main"),
        ActiveCamera::Mount(i) => format!("{stamp}--cam{i}"),
    }
}
