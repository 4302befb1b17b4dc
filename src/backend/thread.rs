//! Thread backend: the server runs on a dedicated OS thread with its own tokio
//! runtime, sharing the spawning process's memory.

use std::{
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{error, info, warn};

use super::{ConcurrencyBackend, ConcurrencyMode, Mid, ServerInstance, WorkerHandle};
use crate::{
    errors::BackendError,
    rpc::{Dispatcher, ServerControl, ServerMeta},
    AppState,
};

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct ThreadBackend {
    workers: usize,
    shutdown_timeout: Duration,
}

impl Default for ThreadBackend {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl ThreadBackend {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            shutdown_timeout: super::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

struct ThreadWorker {
    shutdown: Option<oneshot::Sender<()>>,
    finished: Option<oneshot::Receiver<()>>,
    thread: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerHandle for ThreadWorker {
    async fn is_alive(&mut self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    async fn shutdown(&mut self, timeout: Duration) -> Result<(), BackendError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(finished) = self.finished.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, finished).await {
            Ok(_) => {
                if let Some(thread) = self.thread.take() {
                    let _ = tokio::task::spawn_blocking(move || thread.join()).await;
                }
                info!("worker thread stopped");
            }
            Err(_) => {
                // Threads cannot be killed; the runtime exits once its connections drain.
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "worker thread did not stop in time, detaching"
                );
                self.thread.take();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConcurrencyBackend for ThreadBackend {
    fn mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Thread
    }

    async fn spawn(
        &self,
        bind: SocketAddr,
        name: &str,
        mid: Mid,
        dispatcher: Arc<Dispatcher>,
        control: ServerControl,
    ) -> Result<ServerInstance, BackendError> {
        let state = AppState::new(
            dispatcher.clone(),
            ServerMeta::new(name, mid.clone(), ConcurrencyMode::Thread).with_control(control),
        );
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        let workers = self.workers;

        let thread = thread::Builder::new()
            .name(format!("rpc-{name}"))
            .spawn(move || {
                serve_on_thread(bind, workers, state, ready_tx, shutdown_rx);
                let _ = finished_tx.send(());
            })?;

        let address = match ready_rx.await {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(BackendError::Startup(
                    "worker thread exited before binding".to_string(),
                ))
            }
        };

        info!(mid = %mid, name, address = %address, workers, "thread worker listening");

        let worker = ThreadWorker {
            shutdown: Some(shutdown_tx),
            finished: Some(finished_rx),
            thread: Some(thread),
        };
        Ok(ServerInstance::new(
            mid,
            name,
            address,
            ConcurrencyMode::Thread,
            dispatcher,
            Box::new(worker),
        )
        .with_shutdown_timeout(self.shutdown_timeout))
    }
}

fn serve_on_thread(
    bind: SocketAddr,
    workers: usize,
    state: AppState,
    ready: oneshot::Sender<Result<SocketAddr, BackendError>>,
    shutdown: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("rpc-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready.send(Err(BackendError::Io(err)));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = ready.send(Err(BackendError::Bind {
                    address: bind.to_string(),
                    source,
                }));
                return;
            }
        };
        let address = match listener.local_addr() {
            Ok(address) => address,
            Err(err) => {
                let _ = ready.send(Err(BackendError::Io(err)));
                return;
            }
        };
        if ready.send(Ok(address)).is_err() {
            return;
        }

        let control = state.server.control.clone();
        let signal = async move {
            tokio::select! {
                _ = shutdown => {}
                _ = control.shutdown_requested() => info!("shutdown requested by a callable"),
            }
        };
        if let Err(err) = crate::serve(listener, state, signal).await {
            error!(error = %err, "thread worker server failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::calculator_app;

    #[tokio::test]
    async fn spawn_reports_concrete_address_and_kill_is_idempotent() {
        let backend = ThreadBackend::new(1);
        let instance = backend
            .spawn(
                "127.0.0.1:0".parse().expect("bind"),
                "thread-test",
                Mid::generate(),
                Arc::new(calculator_app().expect("calculator app")),
                ServerControl::default(),
            )
            .await
            .expect("spawn");

        assert_ne!(instance.address().port(), 0);
        assert_eq!(instance.mode(), ConcurrencyMode::Thread);
        assert!(instance.is_alive().await);

        instance.kill().await.expect("first kill");
        instance.kill().await.expect("second kill");
        assert!(!instance.is_alive().await);
    }

    #[tokio::test]
    async fn server_stops_when_a_callable_asks() {
        let control = ServerControl::default();
        let instance = ThreadBackend::new(1)
            .spawn(
                "127.0.0.1:0".parse().expect("bind"),
                "self-stop",
                Mid::generate(),
                Arc::new(calculator_app().expect("calculator app")),
                control.clone(),
            )
            .await
            .expect("spawn");

        control.shut_down();
        tokio::time::timeout(Duration::from_secs(5), async {
            while instance.is_alive().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("thread stops");
        instance.kill().await.expect("kill after self-stop");
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
        let address = taken.local_addr().expect("addr");

        let err = ThreadBackend::new(1)
            .spawn(
                address,
                "clash",
                Mid::generate(),
                Arc::new(calculator_app().expect("calculator app")),
                ServerControl::default(),
            )
            .await
            .expect_err("port is taken");
        assert!(matches!(err, BackendError::Bind { .. }));
    }
}
