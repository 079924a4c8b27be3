//! Collaborator interfaces onto the host simulation
//!
//! The agent never talks to the engine directly. Each capability it needs
//! is a trait here:
//!
//! - [`World`]: game clock, pause and time scale, the driven vehicle, nearby
//!   entities, environment, and the primitive steps of a vehicle reset
//! - [`CameraHost`]: engine camera objects
//! - [`FrameSource`]: raw capture planes and the rendering camera's state
//! - [`NavigationController`]: whatever drives the vehicle
//!
//! [`Simulation`] bundles the first three for the capture pipeline.

use bytes::Bytes;
use chrono::NaiveTime;
use glam::{DMat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::snapshot::{BoundingBox3, DetectionClass, DetectionType};

/// Opaque engine camera handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam#{}", self.0)
    }
}

/// One sample of the driven vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VehicleState {
    /// Driver alive and vehicle not destroyed
    pub alive: bool,
    pub in_vehicle: bool,
    /// World units per second
    pub speed: f32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub velocity: Vec3,
    pub model_box: BoundingBox3,
}

/// An entity near the vehicle, as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityObservation {
    pub handle: i32,
    pub kind: DetectionType,
    pub class: DetectionClass,
    pub position: Vec3,
    pub rotation: Vec3,
    pub velocity: Vec3,
    pub model_box: BoundingBox3,
}

/// Raw planes read back from the renderer for the current camera.
#[derive(Debug, Clone)]
pub struct CaptureBuffers {
    pub width: u32,
    pub height: u32,
    /// RGBA8 pages, one per color target
    pub colors: Vec<Bytes>,
    /// Little-endian f32 per pixel
    pub depth: Bytes,
    /// One byte per pixel
    pub stencil: Bytes,
}

/// Rendering camera and screen state at capture time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderState {
    pub camera_position: Vec3,
    pub camera_rotation: Vec3,
    pub camera_direction: Vec3,
    pub fov: f32,
    pub near_clip: f32,
    pub far_clip: f32,
    pub ui_width: u32,
    pub ui_height: u32,
    pub world: DMat4,
    pub world_view: DMat4,
    pub world_view_projection: DMat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weather {
    ExtraSunny,
    Clear,
    Clouds,
    Smog,
    Foggy,
    Overcast,
    Raining,
    ThunderStorm,
    Clearing,
    Neutral,
    Snowing,
    Blizzard,
    Snowlight,
    Christmas,
}

impl Weather {
    pub const ALL: [Weather; 14] = [
        Weather::ExtraSunny,
        Weather::Clear,
        Weather::Clouds,
        Weather::Smog,
        Weather::Foggy,
        Weather::Overcast,
        Weather::Raining,
        Weather::ThunderStorm,
        Weather::Clearing,
        Weather::Neutral,
        Weather::Snowing,
        Weather::Blizzard,
        Weather::Snowlight,
        Weather::Christmas,
    ];

    fn index(self) -> usize {
        Self::ALL.iter().position(|w| *w == self).unwrap_or(0)
    }

    /// Next weather, wrapping around.
    pub fn next(self) -> Self {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }

    /// Previous weather, wrapping around.
    pub fn prev(self) -> Self {
        Self::ALL[(self.index() + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl fmt::Display for Weather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Clock, vehicle and environment of the running simulation.
pub trait World {
    /// Monotonic game time in milliseconds.
    fn game_time_ms(&self) -> u64;
    /// Block the control thread for `duration` of simulation time.
    fn wait(&mut self, duration: Duration);
    fn set_paused(&mut self, paused: bool);
    fn set_time_scale(&mut self, scale: f32);
    /// On-screen notification for the operator.
    fn notify(&mut self, message: &str);

    fn vehicle(&self) -> VehicleState;
    fn nearby_entities(&self, radius: f32) -> Vec<EntityObservation>;
    /// Destination of the current route, if the driver has one.
    fn current_target(&self) -> Option<Vec2> {
        None
    }

    fn time_of_day(&self) -> NaiveTime;
    fn set_time_of_day(&mut self, time: NaiveTime);
    fn weather(&self) -> Weather;
    fn set_weather(&mut self, weather: Weather);

    /// Remove the vehicle the driver last used.
    fn delete_last_vehicle(&mut self);
    fn teleport_driver(&mut self, position: Vec3);
    fn clear_vehicles_near(&mut self, center: Vec3, radius: f32);
    /// Spawn a fresh vehicle at the driver and seat the driver in it.
    fn enter_new_vehicle(&mut self);
}

/// Engine camera objects.
pub trait CameraHost {
    fn destroy_all_cameras(&mut self);
    fn create_camera(&mut self, position: Vec3, rotation: Vec3, fov: f32, near_clip: f32)
        -> CameraId;
    /// Attach to the driven vehicle at `offset` (vehicle-local).
    fn attach_camera(&mut self, camera: CameraId, offset: Vec3);
    fn set_camera_rotation(&mut self, camera: CameraId, rotation: Vec3);
    fn set_camera_active(&mut self, camera: CameraId, active: bool);
    /// Route rendering through `camera`, or back to the gameplay camera.
    fn set_rendering_camera(&mut self, camera: Option<CameraId>);
    fn default_fov(&self) -> f32;
    fn default_near_clip(&self) -> f32;
}

/// Read-back of the rendered frame.
pub trait FrameSource {
    /// `None` when the renderer has no frame for the current camera.
    fn capture_buffers(&mut self) -> Option<CaptureBuffers>;
    /// `None` while the renderer's constants are unavailable.
    fn render_state(&self) -> Option<RenderState>;
    /// Normalized screen coordinates of a world point, `None` off screen.
    fn world_to_screen(&self, point: Vec3) -> Option<Vec2>;
}

/// Driving automation. Toggling switches the autopilot on or off.
pub trait NavigationController {
    fn toggle_autopilot(&mut self);
}

/// Everything the capture pipeline needs from the engine.
pub trait Simulation: World + CameraHost + FrameSource {}

impl<T: World + CameraHost + FrameSource> Simulation for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weather_cycles_both_ways() {
        assert_eq!(Weather::ExtraSunny.next(), Weather::Clear);
        assert_eq!(Weather::Christmas.next(), Weather::ExtraSunny);
        assert_eq!(Weather::ExtraSunny.prev(), Weather::Christmas);
        for w in Weather::ALL {
            assert_eq!(w.next().prev(), w);
        }
    }

    #[test]
    fn weather_names_round_trip_through_json() {
        let w: Weather = serde_json::from_str("\"ThunderStorm\"").expect("known weather");
        assert_eq!(w, Weather::ThunderStorm);
        assert_eq!(w.to_string(), "ThunderStorm");
    }
}
