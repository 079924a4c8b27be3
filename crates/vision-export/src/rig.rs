//! Vehicle-mounted camera rig
//!
//! The rig owns one main camera and any number of mounts rigidly attached to
//! the driven vehicle. At most one of them renders at a time. Activating a
//! mount composes the vehicle's rotation with the mount's relative rotation,
//! applies it, then lets the simulation run for the settle time so temporal
//! effects catch up before anything reads the frame.

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::geometry::{compose_rotation, Transform};
use crate::world::{CameraHost, CameraId, World};

/// Misuse of the rig. These are configuration errors, not transient ones.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RigError {
    #[error("camera rig used before initialize()")]
    NotInitialized,
    #[error("camera mount {index} does not exist ({count} configured)")]
    InvalidIndex { index: usize, count: usize },
    #[error("main camera has not been set")]
    NoMainCamera,
    #[error("driver has no vehicle to attach camera {index} to")]
    NoVehicle { index: usize },
}

/// Camera placement relative to the vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraMount {
    /// Vehicle-local offset
    pub offset: Vec3,
    /// Euler degrees relative to the vehicle
    pub rotation: Vec3,
    /// Field of view; engine default when unset
    pub fov: Option<f32>,
    /// Near clip plane; engine default when unset
    pub near_clip: Option<f32>,
}

impl CameraMount {
    pub fn new(offset: Vec3, rotation: Vec3) -> Self {
        Self {
            offset,
            rotation,
            fov: None,
            near_clip: None,
        }
    }

    pub fn with_optics(mut self, fov: f32, near_clip: f32) -> Self {
        self.fov = Some(fov);
        self.near_clip = Some(near_clip);
        self
    }
}

/// Which camera is rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveCamera {
    Main,
    Mount(usize),
}

impl ActiveCamera {
    pub fn mount_index(self) -> Option<usize> {
        match self {
            ActiveCamera::Main => None,
            ActiveCamera::Mount(i) => Some(i),
        }
    }
}

/// Transforms of the camera currently rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveCameraState {
    pub camera: ActiveCamera,
    pub relative: Transform,
    /// World transform after settling; `None` for the main camera
    pub absolute: Option<Transform>,
}

#[derive(Debug, Clone)]
struct RigCamera {
    id: CameraId,
    mount: CameraMount,
}

#[derive(Debug, Default)]
pub struct CameraRig {
    initialized: bool,
    settle: Duration,
    main: Option<RigCamera>,
    mounts: Vec<RigCamera>,
    active: Option<ActiveCameraState>,
}

impl CameraRig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destroy leftover engine cameras and record the settle time.
    /// Later calls are no-ops.
    pub fn initialize<H: CameraHost + ?Sized>(&mut self, host: &mut H, settle: Duration) {
        if self.initialized {
            return;
        }
        host.destroy_all_cameras();
        self.settle = settle;
        self.initialized = true;
        info!(settle_ms = settle.as_millis() as u64, "camera rig initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn settle_time(&self) -> Duration {
        self.settle
    }

    /// Create the main camera. Missing optics fall back to engine defaults.
    pub fn set_main_camera<H: CameraHost + ?Sized>(
        &mut self,
        host: &mut H,
        mount: CameraMount,
    ) -> Result<CameraId, RigError> {
        self.ensure_initialized()?;
        let id = Self::create(host, &mount);
        debug!(camera = %id, "main camera created");
        self.main = Some(RigCamera { id, mount });
        Ok(id)
    }

    /// Create a mounted camera and return its index.
    pub fn add_mount<H: CameraHost + ?Sized>(
        &mut self,
        host: &mut H,
        mount: CameraMount,
    ) -> Result<usize, RigError> {
        self.ensure_initialized()?;
        let id = Self::create(host, &mount);
        self.mounts.push(RigCamera { id, mount });
        let index = self.mounts.len() - 1;
        debug!(camera = %id, index, "camera mount added");
        Ok(index)
    }

    fn create<H: CameraHost + ?Sized>(host: &mut H, mount: &CameraMount) -> CameraId {
        let fov = mount.fov.unwrap_or_else(|| host.default_fov());
        let near_clip = mount.near_clip.unwrap_or_else(|| host.default_near_clip());
        host.create_camera(mount.offset, mount.rotation, fov, near_clip)
    }

    /// Render through mount `index` and wait for it to settle.
    pub fn activate<S: World + CameraHost + ?Sized>(
        &mut self,
        sim: &mut S,
        index: usize,
    ) -> Result<ActiveCameraState, RigError> {
        self.ensure_initialized()?;
        let camera = self
            .mounts
            .get(index)
            .cloned()
            .ok_or(RigError::InvalidIndex {
                index,
                count: self.mounts.len(),
            })?;
        let vehicle = sim.vehicle();
        if !vehicle.in_vehicle {
            return Err(RigError::NoVehicle { index });
        }

        self.deactivate_cameras(sim);
        sim.set_paused(false);
        sim.set_camera_active(camera.id, true);
        sim.set_rendering_camera(Some(camera.id));
        sim.attach_camera(camera.id, camera.mount.offset);
        let rotation = compose_rotation(vehicle.rotation, camera.mount.rotation);
        sim.set_camera_rotation(camera.id, rotation);

        sim.wait(self.settle);
        sim.set_paused(true);

        // The vehicle may have moved while settling; record where it is now.
        let settled = sim.vehicle();
        let absolute = Transform::new(
            Transform::new(settled.position, settled.rotation).apply_to_point(camera.mount.offset),
            compose_rotation(settled.rotation, camera.mount.rotation),
        );
        debug!(
            index,
            camera = %camera.id,
            x = absolute.position.x,
            y = absolute.position.y,
            z = absolute.position.z,
            yaw = absolute.rotation.z,
            "camera mount active"
        );

        let state = ActiveCameraState {
            camera: ActiveCamera::Mount(index),
            relative: Transform::new(camera.mount.offset, camera.mount.rotation),
            absolute: Some(absolute),
        };
        self.active = Some(state);
        Ok(state)
    }

    /// Render through the main camera. Its transform is recorded as given.
    pub fn activate_main<H: CameraHost + ?Sized>(
        &mut self,
        host: &mut H,
    ) -> Result<ActiveCameraState, RigError> {
        self.ensure_initialized()?;
        let main = self.main.clone().ok_or(RigError::NoMainCamera)?;
        self.deactivate_cameras(host);
        host.set_camera_active(main.id, true);
        host.set_rendering_camera(Some(main.id));

        let state = ActiveCameraState {
            camera: ActiveCamera::Main,
            relative: Transform::new(main.mount.offset, main.mount.rotation),
            absolute: None,
        };
        self.active = Some(state);
        Ok(state)
    }

    /// Hand rendering back to the gameplay camera.
    pub fn deactivate<H: CameraHost + ?Sized>(&mut self, host: &mut H) -> Result<(), RigError> {
        self.ensure_initialized()?;
        self.deactivate_cameras(host);
        host.set_rendering_camera(None);
        Ok(())
    }

    fn deactivate_cameras<H: CameraHost + ?Sized>(&mut self, host: &mut H) {
        for camera in self.main.iter().chain(self.mounts.iter()) {
            host.set_camera_active(camera.id, false);
        }
        self.active = None;
    }

    fn ensure_initialized(&self) -> Result<(), RigError> {
        if self.initialized {
            Ok(())
        } else {
            Err(RigError::NotInitialized)
        }
    }

    pub fn active(&self) -> Option<&ActiveCameraState> {
        self.active.as_ref()
    }

    pub fn is_main_active(&self) -> bool {
        matches!(
            self.active,
            Some(ActiveCameraState {
                camera: ActiveCamera::Main,
                ..
            })
        )
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }

    pub fn has_main_camera(&self) -> bool {
        self.main.is_some()
    }

    /// Engine handle of mount `index`.
    pub fn mount_camera(&self, index: usize) -> Option<CameraId> {
        self.mounts.get(index).map(|c| c.id)
    }
}
