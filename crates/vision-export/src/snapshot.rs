//! Snapshot and detection records
//!
//! A [`Snapshot`] is the immutable metadata of one camera capture. It is built
//! once per camera inside a capture cycle, moved into the persistence task and
//! never mutated afterwards. Detections travel inside their snapshot so a
//! store can write both in one atomic step.

use chrono::{DateTime, NaiveTime, Utc};
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::Transform;
use crate::world::{EntityObservation, Weather};

/// Record layout version written into every snapshot.
pub const SNAPSHOT_VERSION: u32 = 3;

/// Coarse category of a detected entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionType {
    Background,
    Person,
    Car,
    Bicycle,
}

/// Fine-grained vehicle class; `Unknown` for anything that is not a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionClass {
    Unknown,
    Compacts,
    Sedans,
    SUVs,
    Coupes,
    Muscle,
    SportsClassics,
    Sports,
    Super,
    Motorcycles,
    OffRoad,
    Industrial,
    Utility,
    Vans,
    Cycles,
    Boats,
    Helicopters,
    Planes,
    Service,
    Emergency,
    Military,
    Commercial,
    Trains,
}

impl DetectionClass {
    const VEHICLE_CLASSES: [DetectionClass; 22] = [
        DetectionClass::Compacts,
        DetectionClass::Sedans,
        DetectionClass::SUVs,
        DetectionClass::Coupes,
        DetectionClass::Muscle,
        DetectionClass::SportsClassics,
        DetectionClass::Sports,
        DetectionClass::Super,
        DetectionClass::Motorcycles,
        DetectionClass::OffRoad,
        DetectionClass::Industrial,
        DetectionClass::Utility,
        DetectionClass::Vans,
        DetectionClass::Cycles,
        DetectionClass::Boats,
        DetectionClass::Helicopters,
        DetectionClass::Planes,
        DetectionClass::Service,
        DetectionClass::Emergency,
        DetectionClass::Military,
        DetectionClass::Commercial,
        DetectionClass::Trains,
    ];

    /// Engine class code (`-1` for `Unknown`).
    pub fn code(self) -> i32 {
        if self == DetectionClass::Unknown {
            return -1;
        }
        Self::VEHICLE_CLASSES
            .iter()
            .position(|c| *c == self)
            .map_or(-1, |i| i as i32)
    }

    pub fn from_code(code: i32) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::VEHICLE_CLASSES.get(i).copied())
            .unwrap_or(DetectionClass::Unknown)
    }
}

/// Axis-aligned box in normalized screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox2 {
    pub min: Vec2,
    pub max: Vec2,
}

impl BoundingBox2 {
    /// Smallest box containing every point; `None` for an empty input.
    pub fn enclosing<I: IntoIterator<Item = Vec2>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Some(Self { min, max })
    }

    pub fn area(&self) -> f32 {
        let size = (self.max - self.min).max(Vec2::ZERO);
        size.x * size.y
    }
}

/// Model-space box of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox3 {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox3 {
    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub kind: DetectionType,
    pub class: DetectionClass,
    pub handle: i32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub velocity: Vec3,
    /// Distance from the capturing vehicle
    pub distance: f32,
    /// Projected model box; `None` when any corner is off screen
    pub screen_box: Option<BoundingBox2>,
    pub model_box: BoundingBox3,
}

impl Detection {
    /// Build a detection, projecting the entity's model box with `project`.
    pub fn observe<F>(entity: &EntityObservation, origin: Vec3, project: F) -> Self
    where
        F: Fn(Vec3) -> Option<Vec2>,
    {
        let pose = Transform::new(entity.position, entity.rotation);
        let projected: Option<Vec<Vec2>> = entity
            .model_box
            .corners()
            .iter()
            .map(|corner| project(pose.apply_to_point(*corner)))
            .collect();

        Self {
            kind: entity.kind,
            class: entity.class,
            handle: entity.handle,
            position: entity.position,
            rotation: entity.rotation,
            velocity: entity.velocity,
            distance: entity.position.distance(origin),
            screen_box: projected.and_then(BoundingBox2::enclosing),
            model_box: entity.model_box,
        }
    }
}

/// Pose and optics of the camera that produced a capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    pub position: Vec3,
    pub rotation: Vec3,
    pub direction: Vec3,
    pub fov: f32,
    pub near_clip: f32,
    pub far_clip: f32,
}

/// Metadata of one capture from one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Base name of the image artifact(s), without extension
    pub image_name: String,
    /// Shared by every camera of one capture cycle
    pub scene_id: Uuid,
    /// Mount index, `None` for the main camera
    pub camera_index: Option<usize>,
    pub captured_at: DateTime<Utc>,
    pub time_of_day: NaiveTime,
    pub weather: Weather,
    pub camera: CameraParams,
    /// Mount transform relative to the vehicle
    pub camera_relative: Option<Transform>,
    pub width: u32,
    pub height: u32,
    pub ui_width: u32,
    pub ui_height: u32,
    /// Column-major 4x4 matrices
    pub world_matrix: [f64; 16],
    pub view_matrix: [f64; 16],
    pub projection_matrix: [f64; 16],
    pub vehicle_position: Vec3,
    pub vehicle_velocity: Vec3,
    pub vehicle_box: BoundingBox3,
    pub current_target: Option<Vec2>,
    pub detections: Vec<Detection>,
}

impl Snapshot {
    pub fn detections_of(&self, kind: DetectionType) -> impl Iterator<Item = &Detection> {
        self.detections.iter().filter(move |d| d.kind == kind)
    }
}
