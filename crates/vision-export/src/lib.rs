//! Sensor capture agent for a tick-driven vehicle simulation
//!
//! This crate watches a driven vehicle, resets it when it gets stuck, and
//! while it is healthy captures color, depth and stencil planes plus scene
//! metadata from a rig of vehicle-mounted cameras:
//! - Health checks over time and distance windows (`health`)
//! - Camera rig with rotation composition and settle waits (`rig`)
//! - Capture cycle, multi-page TIFF encoding and snapshot records
//!   (`pipeline`, `encoder`, `snapshot`)
//! - Session and run lifecycle against a snapshot store (`session`, `store`)
//! - Typed operator commands over TCP (`command`)
//! - The per-tick control loop (`scheduler`)
//!
//! The simulation itself is reached only through the traits in `world`.
//! `synthetic` implements them without an engine.

pub mod command;
pub mod config;
pub mod encoder;
pub mod geometry;
pub mod health;
pub mod inflight;
pub mod pipeline;
pub mod rig;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod synthetic;
pub mod world;

// Re-export commonly used types
pub use command::{CommandListener, CommandPoll, ControlCommand};
pub use config::AgentConfig;
pub use encoder::{ArtifactLayout, EncodeError, ImageEncoder};
pub use geometry::Transform;
pub use health::{HealthReport, HealthVerdict, ReloadReason, StuckConfig, StuckDetector};
pub use pipeline::{CaptureOutcome, CycleReport, PipelineConfig, SnapshotPipeline};
pub use rig::{ActiveCamera, CameraMount, CameraRig, RigError};
pub use scheduler::TickScheduler;
pub use session::{CaptureState, SessionRunController};
pub use snapshot::{Detection, DetectionClass, DetectionType, Snapshot};
pub use store::{LocalStore, LocalStoreConfig, MemoryStore, SnapshotStore};
pub use synthetic::SyntheticSimulation;
pub use world::{
    CameraHost, FrameSource, NavigationController, Simulation, VehicleState, Weather, World,
};
