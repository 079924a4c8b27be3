//! End-to-end scenarios for the capture agent
//!
//! Drives a `TickScheduler` over the synthetic simulation the way the agent
//! binary does: a plain control thread ticking every 100 ms of game time, with
//! store and encoder work on a multi-thread tokio runtime.
//!
//! Run: `cargo test -p vision-export --test agent`
//!
//! Tests:
//!   1. Vehicle standing still past the not-moving window is reloaded
//!   2. Vehicle cruising above the low-speed threshold is never reloaded
//!   3. Four-camera cycle with one camera unavailable persists three snapshots
//!   4. Local store receives snapshots whose artifacts exist on disk
//!   5. Commands sent over the socket reach the scheduler

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};
use tokio::runtime::Runtime;
use vision_export::store::StoreEvent;
use vision_export::synthetic::SimAction;
use vision_export::{
    AgentConfig, CommandListener, ControlCommand, LocalStore, LocalStoreConfig, MemoryStore,
    SnapshotStore, SyntheticSimulation, TickScheduler, Weather, World,
};

const TICK: Duration = Duration::from_millis(100);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn config(dir: &TempDir) -> AgentConfig {
    AgentConfig {
        output_dir: dir.path().join("images"),
        settle_time: Duration::from_millis(20),
        every_nth: 1,
        ..AgentConfig::default()
    }
}

fn start(
    rt: &Runtime,
    config: AgentConfig,
    store: Arc<dyn SnapshotStore>,
) -> TickScheduler<SyntheticSimulation> {
    let mut scheduler =
        TickScheduler::new(config, SyntheticSimulation::new(), store, rt.handle().clone()).unwrap();
    scheduler.start_capture(Some("e2e".into())).unwrap();
    scheduler.session_mut().wait_for_transitions();
    scheduler
}

fn tick(scheduler: &mut TickScheduler<SyntheticSimulation>) {
    scheduler.sim_mut().advance(TICK);
    scheduler.on_tick();
}

fn reloads(scheduler: &TickScheduler<SyntheticSimulation>) -> usize {
    scheduler
        .sim()
        .actions()
        .iter()
        .filter(|a| matches!(a, SimAction::DeleteVehicle))
        .count()
}

/// Test 1: a healthy but motionless vehicle is reloaded once the
/// not-moving window (300 s) has passed.
#[test]
fn standing_vehicle_is_reloaded() {
    let rt = runtime();
    let dir = tempdir().unwrap();
    let mut config = config(&dir);
    // Keep the near-point check out of the way.
    config.stuck.near_point_window = Duration::from_secs(3600);
    let store = Arc::new(MemoryStore::new());
    let mut scheduler = start(&rt, config, store.clone());
    scheduler
        .handle_command(ControlCommand::ToggleGathering)
        .unwrap();

    // Just short of five minutes: nothing happens yet.
    for _ in 0..2_990 {
        tick(&mut scheduler);
    }
    assert_eq!(reloads(&scheduler), 0);
    assert!(scheduler
        .sim()
        .notifications()
        .iter()
        .any(|n| n == "starting driving after inactivity"));

    for _ in 0..100 {
        tick(&mut scheduler);
    }
    scheduler.session_mut().wait_for_transitions();

    assert_eq!(reloads(&scheduler), 1);
    assert!(scheduler
        .sim()
        .notifications()
        .iter()
        .any(|n| n == "reloading: not moving for too long"));
    // The new vehicle drives off under autopilot.
    assert!(scheduler.sim().autopilot_enabled());
    assert!(scheduler.sim().vehicle().speed > 0.0);
    assert_eq!(store.max_open_runs(), 1);
    assert!(scheduler.session().is_enabled());
}

/// Test 2: speed 30 throughout never trips the low-speed window, however
/// long it runs.
#[test]
fn cruising_vehicle_is_never_reloaded() {
    let rt = runtime();
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut scheduler = start(&rt, config(&dir), store);
    scheduler
        .handle_command(ControlCommand::ToggleGathering)
        .unwrap();
    scheduler.sim_mut().set_speed(30.0);

    // 25 minutes of game time, past the 20 minute low-speed window.
    for _ in 0..15_000 {
        tick(&mut scheduler);
    }

    assert_eq!(reloads(&scheduler), 0);
    assert!(scheduler.session().is_enabled());
}

/// Test 3: with four mounts and mount 2 returning no frame, exactly three
/// snapshots are persisted and none of them claims camera 2.
#[test]
fn unavailable_camera_is_left_out_of_cycle() {
    let rt = runtime();
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut scheduler = start(&rt, config(&dir), store.clone());
    assert!(scheduler.config().use_multiple_cameras);
    assert_eq!(scheduler.rig().mount_count(), 4);
    scheduler.sim_mut().set_speed(20.0);
    let broken = scheduler.rig().mount_camera(2).unwrap();
    scheduler.sim_mut().set_camera_unavailable(broken);

    tick(&mut scheduler);
    scheduler.session().drain();

    let saved = store.snapshots();
    assert_eq!(saved.len(), 3);
    assert!(saved.iter().all(|(_, s)| s.camera_index != Some(2)));
    let scene = saved[0].1.scene_id;
    assert!(saved.iter().all(|(_, s)| s.scene_id == scene));

    let persisted = store
        .events()
        .iter()
        .filter(|e| matches!(e, StoreEvent::SnapshotSaved { .. }))
        .count();
    assert_eq!(persisted, 3);
}

/// Test 4: snapshots land in the local store and each names artifacts that
/// exist.
#[test]
fn local_store_matches_artifacts() {
    let rt = runtime();
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let images = config.output_dir.clone();
    let store = Arc::new(
        LocalStore::new(LocalStoreConfig {
            root_path: dir.path().join("db"),
        })
        .unwrap(),
    );
    let mut scheduler = start(&rt, config, store.clone());
    scheduler.sim_mut().set_speed(20.0);
    scheduler.sim_mut().populate_traffic(glam::Vec3::new(0.0, 30.0, 0.0));

    tick(&mut scheduler);
    scheduler.session().drain();
    let run_id = scheduler.session().run().unwrap().id;
    scheduler.shutdown();

    let stored = rt.block_on(store.snapshots(run_id)).unwrap();
    assert_eq!(stored.len(), 4);
    for entry in &stored {
        let artifact = images.join(format!("{}.tiff", entry.snapshot.image_name));
        assert!(artifact.exists(), "missing {}", artifact.display());
        assert_eq!(entry.snapshot.detections.len(), 7);
    }
    let sessions = rt.block_on(store.sessions());
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].end.is_some());
}

/// Test 5: commands written to the socket are applied between ticks.
#[test]
fn socket_commands_reach_scheduler() {
    let rt = runtime();
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut scheduler =
        TickScheduler::new(config(&dir), SyntheticSimulation::new(), store, rt.handle().clone())
            .unwrap();
    let mut listener =
        CommandListener::bind(rt.handle(), "127.0.0.1:0".parse().unwrap()).unwrap();

    let mut stream = std::net::TcpStream::connect(listener.local_addr()).unwrap();
    stream
        .write_all(br#"{"name":"SET_WEATHER","weather":"Foggy"}{"name":"TOGGLE_GATHERING"}"#)
        .unwrap();
    stream.flush().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.is_gathering() && Instant::now() < deadline {
        assert!(scheduler.drain_commands(&mut listener));
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(scheduler.sim().weather(), Weather::Foggy);
    assert!(!scheduler.is_gathering());
}
