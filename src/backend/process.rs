//! Process backend: the server runs in an isolated worker process.
//!
//! The parent launches a worker executable with its configuration in the
//! environment and talks to it only through the stdio control channel (see
//! [`super::control`]). A crashing worker takes nothing down with it.
//!
//! The worker builds its own handler tree, so the parent cannot hand it one.
//! Instead the worker reports the mount path and functions it serves, and spawn
//! fails unless they match the dispatcher the caller asked for.

use std::{net::SocketAddr, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    net::TcpListener,
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use super::control::{self, ControlCommand, WorkerEvent};
use super::{ConcurrencyBackend, ConcurrencyMode, Mid, ServerInstance, WorkerHandle};
use crate::{
    config::{self, Config},
    errors::BackendError,
    rpc::{Dispatcher, ServerControl, ServerMeta},
    AppState,
};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    workers: usize,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ProcessBackend {
    /// `program` must run [`run_worker`] when started with `RPC_CONTROL=stdio`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            workers: super::thread::DEFAULT_WORKERS,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: super::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Re-executes the running binary as the worker.
    pub fn current_exe() -> Result<Self, BackendError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn command(&self, bind: SocketAddr, name: &str, mid: &Mid, path: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .env(config::BIND_ADDR_ENV, bind.ip().to_string())
            .env(config::BIND_PORT_ENV, bind.port().to_string())
            .env(config::SERVER_NAME_ENV, name)
            .env(config::SERVER_MID_ENV, mid.as_str())
            .env(config::MOUNT_PATH_ENV, path)
            .env(config::CONCURRENCY_ENV, ConcurrencyMode::Process.as_str())
            .env(config::WORKERS_ENV, self.workers.to_string())
            .env(config::CONTROL_ENV, config::ControlChannel::Stdio.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

struct ProcessWorker {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    async fn is_alive(&mut self) -> bool {
        if !matches!(self.child.try_wait(), Ok(None)) {
            return false;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };

        // Answers to earlier pings that timed out.
        while self.events.try_recv().is_ok() {}

        if control::send_command(stdin, ControlCommand::Ping).await.is_err() {
            return false;
        }
        let events = &mut self.events;
        tokio::time::timeout(PING_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if event == WorkerEvent::Pong {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    async fn shutdown(&mut self, timeout: Duration) -> Result<(), BackendError> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(err) = control::send_command(&mut stdin, ControlCommand::Stop).await {
                debug!(pid = self.pid, error = %err, "worker control channel already closed");
            }
        }

        let events = &mut self.events;
        let child = &mut self.child;
        let graceful = tokio::time::timeout(timeout, async {
            while let Some(event) = events.recv().await {
                if event == WorkerEvent::Stopped {
                    break;
                }
            }
            child.wait().await
        })
        .await;

        match graceful {
            Ok(Ok(status)) => {
                info!(pid = self.pid, status = %status, "worker process exited");
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                warn!(
                    pid = self.pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker process did not stop in time, killing"
                );
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}

/// Reads the worker's stdout for its whole life. Kill requests go to the
/// supervisor, everything else to the worker handle.
async fn pump_events(
    mut lines: Lines<BufReader<ChildStdout>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    control: ServerControl,
) {
    loop {
        match control::next_event(&mut lines).await {
            Ok(Some(WorkerEvent::Kill { mid })) => {
                if !control.kill(Mid::from(mid.clone())) {
                    warn!(mid = %mid, "dropping kill request, no supervisor");
                }
            }
            Ok(Some(event)) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "worker stdout failed");
                break;
            }
        }
    }
}

#[async_trait]
impl ConcurrencyBackend for ProcessBackend {
    fn mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Process
    }

    async fn spawn(
        &self,
        bind: SocketAddr,
        name: &str,
        mid: Mid,
        dispatcher: Arc<Dispatcher>,
        control: ServerControl,
    ) -> Result<ServerInstance, BackendError> {
        let mut child = self
            .command(bind, name, &mid, dispatcher.path())
            .spawn()
            .map_err(|err| {
                BackendError::Startup(format!("could not launch {}: {err}", self.program.display()))
            })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(BackendError::Control("worker stdio is not piped".to_string()));
        };
        let mut lines = BufReader::new(stdout).lines();

        let announced =
            tokio::time::timeout(self.startup_timeout, control::next_event(&mut lines)).await;
        let (address, path, functions) = match announced {
            Ok(Ok(Some(WorkerEvent::Bound {
                address,
                path,
                functions,
                ..
            }))) => (address, path, functions),
            Ok(Ok(Some(event))) => {
                let _ = child.kill().await;
                return Err(BackendError::Control(format!(
                    "expected bound event, got {event:?}"
                )));
            }
            Ok(Ok(None)) => {
                let status = child.wait().await?;
                return Err(BackendError::Startup(format!(
                    "worker exited with {status} before binding"
                )));
            }
            Ok(Err(err)) => {
                let _ = child.kill().await;
                return Err(err);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(BackendError::Startup(format!(
                    "worker did not report its address within {}s",
                    self.startup_timeout.as_secs()
                )));
            }
        };

        let expected = dispatcher.handler().function_paths();
        if path != dispatcher.path() || functions != expected {
            let _ = child.kill().await;
            return Err(BackendError::Startup(format!(
                "worker serves [{}] at `{path}`, expected [{}] at `{}`",
                functions.join(", "),
                expected.join(", "),
                dispatcher.path()
            )));
        }

        info!(mid = %mid, name, pid, address = %address, "process worker listening");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(lines, events_tx, control));

        let worker = ProcessWorker {
            child,
            pid,
            stdin: Some(stdin),
            events: events_rx,
        };
        Ok(ServerInstance::new(
            mid,
            name,
            address,
            ConcurrencyMode::Process,
            dispatcher,
            Box::new(worker),
        )
        .with_shutdown_timeout(self.shutdown_timeout))
    }
}

/// Worker-side entry point: serve `dispatcher`, announce the bound address on
/// stdout and stop when the parent says so, closes stdin, or a callable asks.
pub async fn run_worker(config: &Config, dispatcher: Arc<Dispatcher>) -> Result<(), BackendError> {
    let bind = config
        .bind_socket()
        .map_err(|err| BackendError::Startup(err.to_string()))?;
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|source| BackendError::Bind {
            address: bind.to_string(),
            source,
        })?;
    let address = listener.local_addr()?;

    let mid = config
        .server_mid
        .clone()
        .map(Mid::from)
        .unwrap_or_else(Mid::generate);
    let (kills_tx, mut kills_rx) = mpsc::unbounded_channel();
    let server_control = ServerControl::supervised(kills_tx);
    let meta = ServerMeta::new(&config.server_name, mid, ConcurrencyMode::Process)
        .with_control(server_control.clone());

    // Single writer: stdout lines must never interleave.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_events(events_rx));

    let _ = events_tx.send(WorkerEvent::Bound {
        address,
        pid: std::process::id(),
        path: dispatcher.path().to_string(),
        functions: dispatcher.handler().function_paths(),
    });
    info!(
        mid = %meta.mid,
        name = %meta.name,
        address = %address,
        "worker process announced address"
    );

    let relay = {
        let events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(mid) = kills_rx.recv().await {
                let event = WorkerEvent::Kill {
                    mid: mid.to_string(),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        })
    };

    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(watch_control_channel(stop_tx, events_tx.clone()));

    let signal = async move {
        tokio::select! {
            _ = stop_rx => {}
            _ = server_control.shutdown_requested() => info!("shutdown requested by a callable"),
        }
    };
    let served = crate::serve(listener, AppState::new(dispatcher, meta), signal).await;

    relay.abort();
    let _ = events_tx.send(WorkerEvent::Stopped);
    writer
        .await
        .map_err(|err| BackendError::Control(format!("event writer failed: {err}")))??;
    served?;
    Ok(())
}

async fn write_events(mut events: mpsc::UnboundedReceiver<WorkerEvent>) -> Result<(), BackendError> {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        control::write_event(&mut stdout, &event).await?;
        if event == WorkerEvent::Stopped {
            break;
        }
    }
    Ok(())
}

async fn watch_control_channel(
    stop: oneshot::Sender<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match control::parse_command(&line) {
                Some(ControlCommand::Ping) => {
                    if events.send(WorkerEvent::Pong).is_err() {
                        warn!("failed to answer ping, event writer is gone");
                    }
                }
                Some(ControlCommand::Stop) => {
                    info!("stop requested by parent");
                    break;
                }
                None => warn!(line = %line, "ignoring unknown control command"),
            },
            Ok(None) => {
                info!("control channel closed, shutting down");
                break;
            }
            Err(err) => {
                warn!(error = %err, "control channel failed, shutting down");
                break;
            }
        }
    }
    let _ = stop.send(());
}
