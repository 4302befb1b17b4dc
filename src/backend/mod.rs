//! Concurrency backends
//!
//! A backend brings a [`Dispatcher`] up behind an HTTP listener and hands back a
//! [`ServerInstance`]. The thread backend shares the caller's address space; the
//! process backend runs the server in a separate worker process driven over a
//! stdio control channel. Both expose the same spawn / address / kill contract.

pub mod arbiter;
pub mod control;
pub mod process;
pub mod thread;

use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::BackendError;
use crate::rpc::{Dispatcher, ServerControl};

pub use arbiter::Arbiter;
pub use process::ProcessBackend;
pub use thread::ThreadBackend;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    Thread,
    Process,
}

impl ConcurrencyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConcurrencyMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown concurrency mode `{other}`")),
        }
    }
}

/// Opaque server instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mid(String);

impl Mid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Mid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-private handle on the thread or process serving an instance.
#[async_trait]
pub trait WorkerHandle: Send {
    async fn is_alive(&mut self) -> bool;
    async fn shutdown(&mut self, timeout: Duration) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ConcurrencyBackend: Send + Sync {
    fn mode(&self) -> ConcurrencyMode;

    /// Returns once the instance is listening and its bound address is known.
    /// Kill requests raised by the instance's callables go through `control`.
    async fn spawn(
        &self,
        bind: SocketAddr,
        name: &str,
        mid: Mid,
        dispatcher: Arc<Dispatcher>,
        control: ServerControl,
    ) -> Result<ServerInstance, BackendError>;
}

pub struct ServerInstance {
    mid: Mid,
    name: String,
    address: SocketAddr,
    mode: ConcurrencyMode,
    callable: Arc<Dispatcher>,
    shutdown_timeout: Duration,
    worker: Mutex<Option<Box<dyn WorkerHandle>>>,
}

impl ServerInstance {
    pub(crate) fn new(
        mid: Mid,
        name: &str,
        address: SocketAddr,
        mode: ConcurrencyMode,
        callable: Arc<Dispatcher>,
        worker: Box<dyn WorkerHandle>,
    ) -> Self {
        Self {
            mid,
            name: name.to_string(),
            address,
            mode,
            callable,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(crate) fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn mid(&self) -> &Mid {
        &self.mid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    pub fn callable(&self) -> &Arc<Dispatcher> {
        &self.callable
    }

    /// URL of the RPC endpoint, suitable for [`crate::client::JsonProxy::http`].
    pub fn uri(&self) -> String {
        format!("http://{}{}", self.address, self.callable.path())
    }

    pub async fn is_alive(&self) -> bool {
        match self.worker.lock().await.as_mut() {
            Some(worker) => worker.is_alive().await,
            None => false,
        }
    }

    /// Stops the instance. Killing an instance that is already dead is a no-op.
    pub async fn kill(&self) -> Result<(), BackendError> {
        let Some(mut worker) = self.worker.lock().await.take() else {
            debug!(mid = %self.mid, "instance already terminated");
            return Ok(());
        };

        info!(
            mid = %self.mid,
            name = %self.name,
            concurrency = %self.mode,
            address = %self.address,
            "stopping server instance"
        );
        worker.shutdown(self.shutdown_timeout).await
    }
}

impl fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInstance")
            .field("mid", &self.mid)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_mode_parses_case_insensitively() {
        assert_eq!("Thread".parse::<ConcurrencyMode>(), Ok(ConcurrencyMode::Thread));
        assert_eq!(" process ".parse::<ConcurrencyMode>(), Ok(ConcurrencyMode::Process));
        assert!("greenlet".parse::<ConcurrencyMode>().is_err());
    }

    #[test]
    fn generated_mids_are_unique() {
        let first = Mid::generate();
        let second = Mid::generate();
        assert_ne!(first, second);
        assert_eq!(first.as_str().len(), 32);
    }
}
