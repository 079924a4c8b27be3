//! Operator control commands
//!
//! Commands arrive as JSON objects tagged by `name`, for example
//! `{"name": "SET_TIME", "time": "14:30"}`. They are decoded once at the
//! socket boundary into [`ControlCommand`], forwarded over a channel, and
//! drained by the control loop through [`CommandListener::poll`], which
//! reports "nothing yet" as a value rather than an error.
//!
//! Senders may write several commands back to back on one connection without
//! any delimiter; the listener splits the stream on JSON value boundaries.

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::world::Weather;

/// Default listen address for the command socket
pub const DEFAULT_COMMAND_ADDR: &str = "127.0.0.1:5555";

/// Largest amount of undecoded input kept per connection (64 KB)
pub const MAX_COMMAND_SIZE: usize = 64 * 1024;

const CHANNEL_DEPTH: usize = 64;

/// All supported control commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    /// Open a session and a capturing run
    StartSession {
        #[serde(default, rename = "session")]
        session_name: Option<String>,
    },
    /// Stop the run and close the session
    StopSession,
    ToggleAutodrive,
    EnterVehicle,
    /// Get a vehicle moving and open a session
    Autostart,
    /// Reset the vehicle to the respawn point
    #[serde(rename = "RELOADGAME")]
    ReloadGame,
    SetTime {
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },
    SetWeather {
        weather: Weather,
    },
    NextWeather,
    PrevWeather,
    /// Keep the clock inside `[time_from, time_to]`
    SetTimeInterval {
        #[serde(rename = "timeFrom", with = "hhmm")]
        time_from: NaiveTime,
        #[serde(rename = "timeTo", with = "hhmm")]
        time_to: NaiveTime,
    },
    ShiftTime {
        hours: i32,
    },
    Pause,
    Unpause,
    /// Switch periodic capture on or off without touching the run
    ToggleGathering,
    /// Capture `cycles` cycles into a throwaway session
    ManualCapture {
        #[serde(default = "one_cycle")]
        cycles: u32,
    },
}

fn one_cycle() -> u32 {
    1
}

/// `HH:MM` times on the wire.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Decode a single command.
pub fn decode_command(bytes: &[u8]) -> Result<ControlCommand> {
    serde_json::from_slice(bytes).context("Invalid control command")
}

/// Encode a command the way the listener expects it.
pub fn encode_command(command: &ControlCommand) -> Result<Vec<u8>> {
    serde_json::to_vec(command).context("Failed to encode control command")
}

/// Result of polling for a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPoll {
    Ready(ControlCommand),
    /// Nothing has arrived yet
    Idle,
    /// The listener is gone and nothing will arrive
    Closed,
}

/// Accepts command connections on a TCP socket.
pub struct CommandListener {
    local_addr: SocketAddr,
    rx: mpsc::Receiver<ControlCommand>,
    task: JoinHandle<()>,
}

impl CommandListener {
    /// Bind `addr` and start accepting on `runtime`.
    pub fn bind(runtime: &Handle, addr: SocketAddr) -> Result<Self> {
        let listener = runtime
            .block_on(TcpListener::bind(addr))
            .with_context(|| format!("Failed to bind command socket {}", addr))?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let task = runtime.spawn(accept_loop(listener, tx));
        info!(addr = %local_addr, "command listener started");
        Ok(Self {
            local_addr,
            rx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the next command without blocking.
    pub fn poll(&mut self) -> CommandPoll {
        match self.rx.try_recv() {
            Ok(command) => CommandPoll::Ready(command),
            Err(mpsc::error::TryRecvError::Empty) => CommandPoll::Idle,
            Err(mpsc::error::TryRecvError::Disconnected) => CommandPoll::Closed,
        }
    }
}

impl Drop for CommandListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<ControlCommand>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "command connection accepted");
                tokio::spawn(read_commands(stream, peer, tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "command accept failed");
            }
        }
    }
}

async fn read_commands(mut stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<ControlCommand>) {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                if !buf.is_empty() {
                    warn!(peer = %peer, bytes = buf.len(), "connection closed mid-command");
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(peer = %peer, error = %e, "command read failed");
                return;
            }
        }

        for command in split_commands(&mut buf, peer) {
            info!(peer = %peer, ?command, "command received");
            if tx.send(command).await.is_err() {
                return;
            }
        }

        if buf.len() > MAX_COMMAND_SIZE {
            warn!(peer = %peer, bytes = buf.len(), "command too large, discarding input");
            buf.clear();
        }
    }
}

/// Decode every complete JSON value at the front of `buf`, leaving a
/// trailing partial value in place. Malformed input is logged and dropped.
fn split_commands(buf: &mut BytesMut, peer: SocketAddr) -> Vec<ControlCommand> {
    let mut commands = Vec::new();
    let mut consumed = 0;
    let mut malformed = false;
    {
        let mut stream =
            serde_json::Deserializer::from_slice(&buf[..]).into_iter::<serde_json::Value>();
        loop {
            match stream.next() {
                Some(Ok(value)) => {
                    consumed = stream.byte_offset();
                    match serde_json::from_value::<ControlCommand>(value) {
                        Ok(command) => commands.push(command),
                        Err(e) => warn!(peer = %peer, error = %e, "unknown control command"),
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    warn!(peer = %peer, error = %e, "malformed command input discarded");
                    malformed = true;
                    break;
                }
                None => {
                    consumed = stream.byte_offset();
                    break;
                }
            }
        }
    }

    if malformed {
        buf.clear();
    } else {
        buf.advance(consumed);
    }
    commands
}
