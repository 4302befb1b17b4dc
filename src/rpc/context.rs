//! Per-request invocation context threaded into every callable

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::backend::{ConcurrencyMode, Mid};
use crate::rpc::registry::HandlerNode;

/// Identity of the server instance a dispatcher is running in.
#[derive(Debug, Clone)]
pub struct ServerMeta {
    pub name: String,
    pub mid: Mid,
    pub mode: ConcurrencyMode,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub control: ServerControl,
}

impl ServerMeta {
    pub fn new(name: impl Into<String>, mid: Mid, mode: ConcurrencyMode) -> Self {
        Self {
            name: name.into(),
            mid,
            mode,
            pid: std::process::id(),
            started_at: Utc::now(),
            control: ServerControl::default(),
        }
    }

    pub fn with_control(mut self, control: ServerControl) -> Self {
        self.control = control;
        self
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// Lets callables stop their own server or ask the arbiter that spawned it to
/// kill an instance.
#[derive(Debug, Clone, Default)]
pub struct ServerControl {
    shutdown: Arc<Notify>,
    kills: Option<mpsc::UnboundedSender<Mid>>,
}

impl ServerControl {
    /// A handle whose kill requests are delivered to `kills`.
    pub fn supervised(kills: mpsc::UnboundedSender<Mid>) -> Self {
        Self {
            shutdown: Arc::new(Notify::new()),
            kills: Some(kills),
        }
    }

    /// Asks the serving loop to stop after in-flight requests finish.
    pub fn shut_down(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once [`ServerControl::shut_down`] has been called, even if the
    /// call happened before this future was polled.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    /// Queues a kill of instance `mid`. Returns false when nobody supervises
    /// this server or the supervisor is gone.
    pub fn kill(&self, mid: Mid) -> bool {
        self.kills
            .as_ref()
            .is_some_and(|kills| kills.send(mid).is_ok())
    }

    pub fn is_supervised(&self) -> bool {
        self.kills.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub method: &'a str,
    pub id: &'a Value,
    pub server: &'a ServerMeta,
    pub root: &'a HandlerNode,
}
