//! Vision Agent Binary
//!
//! Runs the capture agent headless against the synthetic simulation: a
//! 100 ms control loop on the main thread, store and encoder work on a tokio
//! runtime, operator commands on a TCP socket.
//!
//! ## Usage
//!
//! ```bash
//! # Start capturing immediately into ./captures
//! VISION_AUTO_START=1 vision-agent
//!
//! # Send a command
//! echo '{"name":"SET_WEATHER","weather":"Foggy"}' | nc 127.0.0.1 5555
//! ```

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vision_export::{
    AgentConfig, CommandListener, LocalStore, SyntheticSimulation, TickScheduler,
};

/// How often the loop logs its state
const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    init_logging()?;

    let config = AgentConfig::from_env()?;
    info!("Vision Agent starting");
    info!("  Images: {}", config.output_dir.display());
    info!("  Store: {}", config.store.root_path.display());
    info!(
        "  Cameras: {} ({})",
        config.mounts.len(),
        if config.use_multiple_cameras { "multi" } else { "main only" }
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vision-worker")
        .build()
        .context("Failed to build tokio runtime")?;
    let handle = runtime.handle().clone();

    let store = Arc::new(LocalStore::new(config.store.clone())?);
    let mut listener = CommandListener::bind(&handle, config.command_addr)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    handle.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        flag.store(true, Ordering::SeqCst);
    });

    let tick_interval = config.tick_interval;
    let mut sim = SyntheticSimulation::new().with_driving(15.0, 2.0);
    sim.populate_traffic(glam::Vec3::new(0.0, 40.0, 0.0));
    let mut scheduler = TickScheduler::new(config, sim, store, handle)?;

    info!("Control loop running, Ctrl-C to stop");
    let mut commands_open = true;
    let mut ticks: u64 = 0;
    let mut last_stats = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();

        if commands_open && !scheduler.drain_commands(&mut listener) {
            warn!("Command listener closed");
            commands_open = false;
        }
        scheduler.sim_mut().advance(tick_interval);
        scheduler.on_tick();
        ticks += 1;

        if last_stats.elapsed() >= STATS_INTERVAL {
            let session = scheduler.session();
            info!(
                ticks,
                state = ?session.state(),
                enabled = session.is_enabled(),
                pending = session.pending_snapshots(),
                "agent stats"
            );
            last_stats = Instant::now();
        }

        if let Some(rest) = tick_interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    scheduler.shutdown();
    drop(listener);
    runtime.shutdown_timeout(Duration::from_secs(5));
    info!("Vision Agent stopped");
    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vision_export=info".parse()?)
                .add_directive("vision_agent=info".parse()?),
        )
        .init();
    Ok(())
}
