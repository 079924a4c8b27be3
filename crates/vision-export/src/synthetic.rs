//! Synthetic simulation without an engine
//!
//! A deterministic, in-process implementation of every collaborator trait: a
//! single vehicle that cruises in a wide circle under autopilot, a handful of
//! entities, engine cameras kept in a table, and generated capture planes.
//! Game time only moves through [`SyntheticSimulation::advance`] and
//! [`World::wait`].
//!
//! Knobs let callers break things on purpose: cameras whose frames never
//! arrive, missing render state, malformed depth planes, a dead driver.

use bytes::Bytes;
use chrono::{NaiveTime, Timelike};
use glam::{DMat4, DVec3, Vec2, Vec3};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::geometry::{forward_direction, Transform};
use crate::snapshot::{BoundingBox3, DetectionClass, DetectionType};
use crate::world::{
    CameraHost, CameraId, CaptureBuffers, EntityObservation, FrameSource, NavigationController,
    RenderState, VehicleState, Weather, World,
};

const DEFAULT_FOV: f32 = 50.0;
const DEFAULT_NEAR_CLIP: f32 = 0.15;
const FAR_CLIP: f32 = 1000.0;
/// Gameplay camera position behind and above the vehicle.
const CHASE_OFFSET: Vec3 = Vec3::new(0.0, -6.0, 2.0);

/// Engine-side effects recorded in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimAction {
    DeleteVehicle,
    Teleport(Vec3),
    ClearArea { center: Vec3, radius: f32 },
    EnterVehicle,
    ToggleAutopilot(bool),
}

#[derive(Debug, Clone)]
struct SyntheticCamera {
    position: Vec3,
    rotation: Vec3,
    fov: f32,
    near_clip: f32,
    attached: Option<Vec3>,
    active: bool,
}

pub struct SyntheticSimulation {
    time_ms: u64,
    paused: bool,
    time_scale: f32,
    notifications: Vec<String>,
    actions: Vec<SimAction>,

    vehicle: VehicleState,
    autopilot: bool,
    cruise_speed: f32,
    /// Degrees per second of yaw while moving
    turn_rate: f32,
    entities: Vec<EntityObservation>,
    next_handle: i32,

    time_of_day: NaiveTime,
    weather: Weather,

    cameras: BTreeMap<CameraId, SyntheticCamera>,
    next_camera: u32,
    rendering: Option<CameraId>,
    destroy_all_calls: usize,

    resolution: (u32, u32),
    unavailable: HashSet<CameraId>,
    render_unavailable: bool,
    malformed_depth: bool,
}

impl Default for SyntheticSimulation {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSimulation {
    pub fn new() -> Self {
        Self {
            time_ms: 0,
            paused: false,
            time_scale: 1.0,
            notifications: Vec::new(),
            actions: Vec::new(),
            vehicle: VehicleState {
                alive: true,
                in_vehicle: true,
                speed: 0.0,
                position: Vec3::ZERO,
                rotation: Vec3::ZERO,
                velocity: Vec3::ZERO,
                model_box: BoundingBox3 {
                    min: Vec3::new(-1.0, -2.5, 0.0),
                    max: Vec3::new(1.0, 2.5, 1.5),
                },
            },
            autopilot: false,
            cruise_speed: 15.0,
            turn_rate: 0.0,
            entities: Vec::new(),
            next_handle: 1,
            time_of_day: NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default(),
            weather: Weather::Clear,
            cameras: BTreeMap::new(),
            next_camera: 1,
            rendering: None,
            destroy_all_calls: 0,
            resolution: (16, 9),
            unavailable: HashSet::new(),
            render_unavailable: false,
            malformed_depth: false,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    /// Cruise speed under autopilot and yaw rate while moving.
    pub fn with_driving(mut self, cruise_speed: f32, turn_rate: f32) -> Self {
        self.cruise_speed = cruise_speed;
        self.turn_rate = turn_rate;
        self
    }

    /// Scatter parked cars and pedestrians around `center`.
    pub fn populate_traffic(&mut self, center: Vec3) {
        let classes = [
            DetectionClass::Sedans,
            DetectionClass::SUVs,
            DetectionClass::Vans,
            DetectionClass::Compacts,
        ];
        for (i, class) in classes.into_iter().enumerate() {
            let angle = i as f32 * std::f32::consts::FRAC_PI_2;
            self.add_entity(
                DetectionType::Car,
                class,
                center + Vec3::new(angle.cos() * 12.0, angle.sin() * 12.0, 0.0),
                BoundingBox3 {
                    min: Vec3::new(-1.0, -2.4, 0.0),
                    max: Vec3::new(1.0, 2.4, 1.6),
                },
            );
        }
        for i in 0..3 {
            self.add_entity(
                DetectionType::Person,
                DetectionClass::Unknown,
                center + Vec3::new(-8.0 + i as f32 * 4.0, 20.0, 0.0),
                BoundingBox3 {
                    min: Vec3::new(-0.3, -0.3, 0.0),
                    max: Vec3::new(0.3, 0.3, 1.8),
                },
            );
        }
    }

    pub fn add_entity(
        &mut self,
        kind: DetectionType,
        class: DetectionClass,
        position: Vec3,
        model_box: BoundingBox3,
    ) -> i32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entities.push(EntityObservation {
            handle,
            kind,
            class,
            position,
            rotation: Vec3::ZERO,
            velocity: Vec3::ZERO,
            model_box,
        });
        handle
    }

    /// Move game time forward, driving the vehicle unless paused.
    pub fn advance(&mut self, dt: Duration) {
        self.time_ms += dt.as_millis() as u64;
        if self.paused || !self.vehicle.alive || !self.vehicle.in_vehicle {
            return;
        }
        let seconds = dt.as_secs_f32();
        if self.vehicle.speed > 0.0 {
            self.vehicle.rotation.z = (self.vehicle.rotation.z + self.turn_rate * seconds) % 360.0;
        }
        let heading = forward_direction(self.vehicle.rotation);
        self.vehicle.velocity = heading * self.vehicle.speed;
        self.vehicle.position += self.vehicle.velocity * seconds;
    }

    // ── Knobs ──

    pub fn set_speed(&mut self, speed: f32) {
        self.vehicle.speed = speed;
    }

    pub fn set_vehicle_rotation(&mut self, rotation: Vec3) {
        self.vehicle.rotation = rotation;
    }

    pub fn set_vehicle_position(&mut self, position: Vec3) {
        self.vehicle.position = position;
    }

    pub fn set_in_vehicle(&mut self, in_vehicle: bool) {
        self.vehicle.in_vehicle = in_vehicle;
    }

    pub fn kill_driver(&mut self) {
        self.vehicle.alive = false;
        self.vehicle.speed = 0.0;
    }

    /// Frames rendered through `camera` never arrive.
    pub fn set_camera_unavailable(&mut self, camera: CameraId) {
        self.unavailable.insert(camera);
    }

    pub fn set_render_unavailable(&mut self, unavailable: bool) {
        self.render_unavailable = unavailable;
    }

    /// Produce depth planes one byte short.
    pub fn set_malformed_depth(&mut self, malformed: bool) {
        self.malformed_depth = malformed;
    }

    // ── Inspection ──

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn time_scale(&self) -> f32 {
        self.time_scale
    }

    pub fn notifications(&self) -> &[String] {
        &self.notifications
    }

    pub fn actions(&self) -> &[SimAction] {
        &self.actions
    }

    pub fn autopilot_enabled(&self) -> bool {
        self.autopilot
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn destroy_all_calls(&self) -> usize {
        self.destroy_all_calls
    }

    pub fn camera_rotation(&self, camera: CameraId) -> Option<Vec3> {
        self.cameras.get(&camera).map(|c| c.rotation)
    }

    pub fn camera_optics(&self, camera: CameraId) -> Option<(f32, f32)> {
        self.cameras.get(&camera).map(|c| (c.fov, c.near_clip))
    }

    pub fn rendering_camera(&self) -> Option<CameraId> {
        self.rendering
    }

    pub fn active_cameras(&self) -> Vec<CameraId> {
        self.cameras
            .iter()
            .filter(|(_, c)| c.active)
            .map(|(id, _)| *id)
            .collect()
    }

    /// World pose and field of view of whatever is rendering.
    fn view_pose(&self) -> (Vec3, Vec3, f32, f32) {
        let body = Transform::new(self.vehicle.position, self.vehicle.rotation);
        match self.rendering.and_then(|id| self.cameras.get(&id)) {
            Some(camera) => {
                let position = match camera.attached {
                    Some(offset) => body.apply_to_point(offset),
                    None => camera.position,
                };
                (position, camera.rotation, camera.fov, camera.near_clip)
            }
            None => (
                body.apply_to_point(CHASE_OFFSET),
                self.vehicle.rotation,
                DEFAULT_FOV,
                DEFAULT_NEAR_CLIP,
            ),
        }
    }

    fn view_projection(&self) -> (DMat4, DMat4) {
        let (position, rotation, fov, near_clip) = self.view_pose();
        let view = DMat4::look_to_rh(
            position.as_dvec3(),
            forward_direction(rotation).as_dvec3(),
            DVec3::Z,
        );
        let (w, h) = self.resolution;
        let projection = DMat4::perspective_rh(
            f64::from(fov).to_radians(),
            f64::from(w) / f64::from(h.max(1)),
            f64::from(near_clip),
            f64::from(FAR_CLIP),
        );
        (view, projection)
    }
}

impl World for SyntheticSimulation {
    fn game_time_ms(&self) -> u64 {
        self.time_ms
    }

    fn wait(&mut self, duration: Duration) {
        self.advance(duration);
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    fn set_time_scale(&mut self, scale: f32) {
        self.time_scale = scale;
    }

    fn notify(&mut self, message: &str) {
        self.notifications.push(message.to_string());
    }

    fn vehicle(&self) -> VehicleState {
        self.vehicle
    }

    fn nearby_entities(&self, radius: f32) -> Vec<EntityObservation> {
        self.entities
            .iter()
            .filter(|e| e.position.distance(self.vehicle.position) <= radius)
            .cloned()
            .collect()
    }

    fn current_target(&self) -> Option<Vec2> {
        None
    }

    fn time_of_day(&self) -> NaiveTime {
        self.time_of_day
    }

    fn set_time_of_day(&mut self, time: NaiveTime) {
        self.time_of_day = time.with_second(0).unwrap_or(time);
    }

    fn weather(&self) -> Weather {
        self.weather
    }

    fn set_weather(&mut self, weather: Weather) {
        self.weather = weather;
    }

    fn delete_last_vehicle(&mut self) {
        self.actions.push(SimAction::DeleteVehicle);
        self.vehicle.in_vehicle = false;
        self.vehicle.speed = 0.0;
    }

    fn teleport_driver(&mut self, position: Vec3) {
        self.actions.push(SimAction::Teleport(position));
        self.vehicle.position = position;
    }

    fn clear_vehicles_near(&mut self, center: Vec3, radius: f32) {
        self.actions.push(SimAction::ClearArea { center, radius });
        self.entities
            .retain(|e| e.kind != DetectionType::Car || e.position.distance(center) > radius);
    }

    fn enter_new_vehicle(&mut self) {
        self.actions.push(SimAction::EnterVehicle);
        self.vehicle.alive = true;
        self.vehicle.in_vehicle = true;
        self.vehicle.speed = 0.0;
        self.vehicle.velocity = Vec3::ZERO;
        self.autopilot = false;
    }
}

impl CameraHost for SyntheticSimulation {
    fn destroy_all_cameras(&mut self) {
        self.destroy_all_calls += 1;
        self.cameras.clear();
        self.rendering = None;
    }

    fn create_camera(&mut self, position: Vec3, rotation: Vec3, fov: f32, near_clip: f32) -> CameraId {
        let id = CameraId(self.next_camera);
        self.next_camera += 1;
        self.cameras.insert(
            id,
            SyntheticCamera {
                position,
                rotation,
                fov,
                near_clip,
                attached: None,
                active: false,
            },
        );
        id
    }

    fn attach_camera(&mut self, camera: CameraId, offset: Vec3) {
        if let Some(c) = self.cameras.get_mut(&camera) {
            c.attached = Some(offset);
        }
    }

    fn set_camera_rotation(&mut self, camera: CameraId, rotation: Vec3) {
        if let Some(c) = self.cameras.get_mut(&camera) {
            c.rotation = rotation;
        }
    }

    fn set_camera_active(&mut self, camera: CameraId, active: bool) {
        if let Some(c) = self.cameras.get_mut(&camera) {
            c.active = active;
        }
    }

    fn set_rendering_camera(&mut self, camera: Option<CameraId>) {
        self.rendering = camera;
    }

    fn default_fov(&self) -> f32 {
        DEFAULT_FOV
    }

    fn default_near_clip(&self) -> f32 {
        DEFAULT_NEAR_CLIP
    }
}

impl FrameSource for SyntheticSimulation {
    fn capture_buffers(&mut self) -> Option<CaptureBuffers> {
        if self.rendering.is_some_and(|id| self.unavailable.contains(&id)) {
            return None;
        }
        let (width, height) = self.resolution;
        let pixels = width as usize * height as usize;
        let shade = self.rendering.map_or(0, |id| (id.0 * 37 % 256) as u8);

        let color: Vec<u8> = (0..pixels)
            .flat_map(|i| [shade, (i % 256) as u8, (self.time_ms % 256) as u8, 255])
            .collect();
        let mut depth: Vec<u8> = (0..pixels)
            .flat_map(|i| (1.0 - i as f32 / pixels.max(1) as f32).to_le_bytes())
            .collect();
        if self.malformed_depth {
            depth.pop();
        }
        let stencil: Vec<u8> = (0..pixels).map(|i| (i % 3) as u8).collect();

        Some(CaptureBuffers {
            width,
            height,
            colors: vec![Bytes::from(color)],
            depth: Bytes::from(depth),
            stencil: Bytes::from(stencil),
        })
    }

    fn render_state(&self) -> Option<RenderState> {
        if self.render_unavailable {
            return None;
        }
        let (position, rotation, fov, near_clip) = self.view_pose();
        let (view, projection) = self.view_projection();
        let world = DMat4::IDENTITY;
        let world_view = view * world;
        Some(RenderState {
            camera_position: position,
            camera_rotation: rotation,
            camera_direction: forward_direction(rotation),
            fov,
            near_clip,
            far_clip: FAR_CLIP,
            ui_width: self.resolution.0,
            ui_height: self.resolution.1,
            world,
            world_view,
            world_view_projection: projection * world_view,
        })
    }

    fn world_to_screen(&self, point: Vec3) -> Option<Vec2> {
        let (view, projection) = self.view_projection();
        let clip = projection * view * point.as_dvec3().extend(1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        if ndc.x.abs() > 1.0 || ndc.y.abs() > 1.0 {
            return None;
        }
        Some(Vec2::new(
            ((ndc.x + 1.0) / 2.0) as f32,
            ((1.0 - ndc.y) / 2.0) as f32,
        ))
    }
}

impl NavigationController for SyntheticSimulation {
    fn toggle_autopilot(&mut self) {
        self.autopilot = !self.autopilot;
        self.actions.push(SimAction::ToggleAutopilot(self.autopilot));
        self.vehicle.speed = if self.autopilot { self.cruise_speed } else { 0.0 };
    }
}
