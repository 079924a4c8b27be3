//! Control loop
//!
//! [`TickScheduler`] is driven once per simulation tick from a single thread.
//! Each tick it checks the vehicle's health, runs the recovery sequence when
//! the vehicle is stuck, and every N-th tick runs a capture cycle. Operator
//! commands are applied between ticks.
//!
//! Nothing that happens inside a tick is allowed to end the loop: failures
//! are logged and the simulation is unpaused before the tick returns.

use anyhow::{Context, Result};
use chrono::{Duration as TimeDelta, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::command::{CommandListener, CommandPoll, ControlCommand};
use crate::config::AgentConfig;
use crate::health::{HealthVerdict, ReloadReason, StuckDetector};
use crate::pipeline::SnapshotPipeline;
use crate::rig::CameraRig;
use crate::session::SessionRunController;
use crate::store::SnapshotStore;
use crate::world::{NavigationController, Simulation};

/// Simulation time between stopping the run and moving the vehicle.
const RELOAD_WAIT: Duration = Duration::from_millis(100);
/// Simulation time given to each step of an autostart.
const AUTOSTART_WAIT: Duration = Duration::from_millis(200);
/// Gap between manual capture cycles.
const MANUAL_CAPTURE_GAP: Duration = Duration::from_millis(200);

pub struct TickScheduler<S> {
    config: AgentConfig,
    sim: S,
    rig: CameraRig,
    detector: StuckDetector,
    session: SessionRunController,
    pipeline: SnapshotPipeline,
    ticked: u64,
    gathering: bool,
    /// Paused by the operator; the agent never unpauses in that case
    operator_paused: bool,
    time_interval: Option<(NaiveTime, NaiveTime)>,
    resume_notified: bool,
}

impl<S: Simulation + NavigationController> TickScheduler<S> {
    /// Set up the camera rig and, with `auto_start`, open a capturing run.
    pub fn new(
        config: AgentConfig,
        mut sim: S,
        store: Arc<dyn SnapshotStore>,
        runtime: Handle,
    ) -> Result<Self> {
        let mut rig = CameraRig::new();
        rig.initialize(&mut sim, config.settle_time);
        rig.set_main_camera(&mut sim, config.main_camera.clone())
            .context("failed to create main camera")?;
        for mount in &config.mounts {
            rig.add_mount(&mut sim, mount.clone())
                .context("failed to add camera mount")?;
        }

        let pipeline = SnapshotPipeline::new(config.pipeline(), runtime.clone())?;
        let session = SessionRunController::new(runtime, store);
        let detector = StuckDetector::new(config.stuck.clone());

        let mut scheduler = Self {
            config,
            sim,
            rig,
            detector,
            session,
            pipeline,
            ticked: 0,
            gathering: true,
            operator_paused: false,
            time_interval: None,
            resume_notified: false,
        };
        info!(
            mounts = scheduler.rig.mount_count(),
            every_nth = scheduler.config.every_nth,
            multi_camera = scheduler.config.use_multiple_cameras,
            "tick scheduler ready"
        );

        if scheduler.config.auto_start {
            let name = scheduler.config.session_name.clone();
            scheduler.start_capture(name)?;
        }
        Ok(scheduler)
    }

    /// One pass of the control loop.
    pub fn on_tick(&mut self) {
        self.ticked = (self.ticked + 1) % self.config.every_nth.max(1);
        self.session.poll();

        if !self.session.is_enabled() {
            self.sim.set_time_scale(1.0);
            return;
        }
        self.sim.set_time_scale(self.config.time_scale);

        if !self.config.static_camera {
            self.check_health();
        }

        if !self.session.is_ready() {
            return;
        }

        if self.gathering && self.ticked == 0 {
            self.capture();
        }

        if let Some((from, to)) = self.time_interval {
            if self.sim.time_of_day() > to {
                debug!(%from, %to, "time of day past interval, wrapping");
                self.sim.set_time_of_day(from);
            }
        }
    }

    fn check_health(&mut self) {
        let now = self.sim.game_time_ms();
        let vehicle = self.sim.vehicle();
        let report = self.detector.evaluate(now, &vehicle);

        if report.resume_driving {
            if !self.resume_notified {
                self.sim.notify("starting driving after inactivity");
                self.resume_notified = true;
            }
        } else {
            self.resume_notified = false;
        }

        if let HealthVerdict::NeedReload(reason) = report.verdict {
            self.recover(reason);
        }
    }

    /// Stop the run, put the vehicle back on the road and start a new run.
    fn recover(&mut self, reason: ReloadReason) {
        warn!(%reason, "vehicle needs reload");
        self.sim.notify(&format!("reloading: {reason}"));
        self.session.stop_run();
        self.sim.wait(RELOAD_WAIT);
        self.reload_vehicle();
        if let Err(e) = self.session.start_run(true) {
            warn!(error = %e, "failed to start run after reload");
        }
    }

    /// Respawn the driver in a fresh vehicle with autopilot engaged.
    pub fn reload_vehicle(&mut self) {
        if self.config.static_camera {
            return;
        }
        self.detector.clear_all();
        let point = self.config.respawn_point;
        self.sim.delete_last_vehicle();
        self.sim.teleport_driver(point);
        self.sim.clear_vehicles_near(point, 100.0);
        self.sim.clear_vehicles_near(point, 3.0);
        self.sim.enter_new_vehicle();
        self.sim.toggle_autopilot();
        info!(x = point.x, y = point.y, z = point.z, "vehicle reloaded");
    }

    fn capture(&mut self) {
        self.set_paused(true);
        self.sim.set_time_scale(self.config.capture_time_scale);
        if let Err(e) = self
            .pipeline
            .capture_cycle(&mut self.sim, &mut self.rig, &mut self.session)
        {
            error!(error = ?e, "capture cycle failed");
        }
        self.sim.set_time_scale(self.config.time_scale);
        self.set_paused(false);
    }

    /// Pause or unpause unless the operator has paused the simulation.
    fn set_paused(&mut self, paused: bool) {
        if !self.operator_paused {
            self.sim.set_paused(paused);
        }
    }

    // ========== Commands ==========

    /// Apply every command waiting on `listener`. Returns `false` once the
    /// listener has closed.
    pub fn drain_commands(&mut self, listener: &mut CommandListener) -> bool {
        loop {
            match listener.poll() {
                CommandPoll::Ready(command) => {
                    if let Err(e) = self.handle_command(command) {
                        warn!(error = ?e, "command failed");
                    }
                }
                CommandPoll::Idle => return true,
                CommandPoll::Closed => return false,
            }
        }
    }

    pub fn handle_command(&mut self, command: ControlCommand) -> Result<()> {
        debug!(?command, "handling command");
        match command {
            ControlCommand::StartSession { session_name } => self.start_capture(session_name)?,
            ControlCommand::StopSession => self.stop_capture(),
            ControlCommand::ToggleAutodrive => self.sim.toggle_autopilot(),
            ControlCommand::EnterVehicle => {
                self.sim.notify("trying to enter vehicle");
                self.sim.enter_new_vehicle();
            }
            ControlCommand::Autostart => self.autostart(),
            ControlCommand::ReloadGame => self.reload_vehicle(),
            ControlCommand::SetTime { time } => {
                self.sim.set_time_of_day(time);
                self.sim.notify(&format!("time set to {}", time.format("%H:%M")));
            }
            ControlCommand::SetWeather { weather } => {
                self.sim.set_weather(weather);
                self.sim.notify(&format!("weather set to {weather}"));
            }
            ControlCommand::NextWeather => {
                let weather = self.sim.weather().next();
                self.sim.set_weather(weather);
            }
            ControlCommand::PrevWeather => {
                let weather = self.sim.weather().prev();
                self.sim.set_weather(weather);
            }
            ControlCommand::SetTimeInterval { time_from, time_to } => {
                self.time_interval = Some((time_from, time_to));
                info!(from = %time_from, to = %time_to, "time interval set");
            }
            ControlCommand::ShiftTime { hours } => {
                let (time, _) = self
                    .sim
                    .time_of_day()
                    .overflowing_add_signed(TimeDelta::hours(i64::from(hours)));
                self.sim.set_time_of_day(time);
            }
            ControlCommand::Pause => {
                self.operator_paused = true;
                self.sim.set_paused(true);
                self.sim.notify("game paused");
            }
            ControlCommand::Unpause => {
                self.operator_paused = false;
                self.sim.set_paused(false);
                self.sim.notify("game unpaused");
            }
            ControlCommand::ToggleGathering => {
                self.gathering = !self.gathering;
                info!(gathering = self.gathering, "gathering toggled");
            }
            ControlCommand::ManualCapture { cycles } => {
                self.manual_capture(cycles)?;
            }
        }
        Ok(())
    }

    /// Open a session and a capturing run.
    pub fn start_capture(&mut self, name: Option<String>) -> Result<()> {
        self.session.start_session(name);
        self.session.start_run(true)?;
        self.sim.notify("capture enabled");
        Ok(())
    }

    /// Stop the run and close the session.
    pub fn stop_capture(&mut self) {
        if self.config.static_camera {
            if let Err(e) = self.rig.deactivate(&mut self.sim) {
                warn!(error = %e, "failed to deactivate cameras");
            }
        }
        self.pipeline.flush();
        self.session.stop_run();
        self.session.stop_session();
        self.sim.notify("capture disabled");
    }

    /// Get a vehicle moving and open a session.
    pub fn autostart(&mut self) {
        if !self.config.static_camera {
            self.sim.enter_new_vehicle();
            self.sim.wait(AUTOSTART_WAIT);
            self.sim.toggle_autopilot();
            self.sim.wait(AUTOSTART_WAIT);
        }
        self.session.start_session(self.config.session_name.clone());
    }

    /// Capture `cycles` cycles into a fresh session without enabling
    /// periodic capture. Returns the number of snapshots submitted.
    pub fn manual_capture(&mut self, cycles: u32) -> Result<usize> {
        self.session.start_session(None);
        self.session.start_run(false)?;
        self.session.wait_for_transitions();

        let mut submitted = 0;
        for cycle in 0..cycles {
            self.set_paused(true);
            let result = self
                .pipeline
                .capture_cycle(&mut self.sim, &mut self.rig, &mut self.session);
            self.set_paused(false);
            match result {
                Ok(report) => submitted += report.submitted(),
                Err(e) => error!(cycle, error = ?e, "manual capture cycle failed"),
            }
            self.sim.wait(MANUAL_CAPTURE_GAP);
        }

        self.pipeline.flush();
        self.session.stop_run();
        self.session.stop_session();
        self.session.wait_for_transitions();
        info!(cycles, submitted, "manual capture finished");
        Ok(submitted)
    }

    /// Stop capturing and wait for outstanding work.
    pub fn shutdown(&mut self) {
        self.pipeline.flush();
        self.session.shutdown();
        if let Err(e) = self.rig.deactivate(&mut self.sim) {
            warn!(error = %e, "failed to deactivate cameras");
        }
        info!("tick scheduler shut down");
    }

    // ========== Accessors ==========

    pub fn sim(&self) -> &S {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn session(&self) -> &SessionRunController {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionRunController {
        &mut self.session
    }

    pub fn rig(&self) -> &CameraRig {
        &self.rig
    }

    pub fn is_gathering(&self) -> bool {
        self.gathering
    }

    pub fn time_interval(&self) -> Option<(NaiveTime, NaiveTime)> {
        self.time_interval
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}
