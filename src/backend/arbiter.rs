//! The arbiter: the single authority tracking live server instances.
//!
//! Its state is created by the first spawn and torn down when the last instance
//! is killed. Callers hold the arbiter explicitly and pass it to whoever needs to
//! spawn or kill. Served callables reach it through the [`ServerControl`] each
//! instance is spawned with; their kill requests are carried out by a reaper
//! task that lives as long as the state.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{ConcurrencyBackend, ConcurrencyMode, Mid, ServerInstance, ThreadBackend};
use crate::{
    errors::BackendError,
    rpc::{Dispatcher, ServerControl},
};

type SharedState = Arc<Mutex<Option<ArbiterState>>>;

struct ArbiterState {
    started_at: DateTime<Utc>,
    instances: BTreeMap<Mid, Arc<ServerInstance>>,
    kills: mpsc::UnboundedSender<Mid>,
    reaper: JoinHandle<()>,
}

impl ArbiterState {
    fn start(shared: Weak<Mutex<Option<ArbiterState>>>) -> Self {
        let (kills, requests) = mpsc::unbounded_channel();
        info!("arbiter started");
        Self {
            started_at: Utc::now(),
            instances: BTreeMap::new(),
            kills,
            reaper: tokio::spawn(reap(shared, requests)),
        }
    }
}

pub struct Arbiter {
    backends: HashMap<ConcurrencyMode, Arc<dyn ConcurrencyBackend>>,
    state: SharedState,
}

impl Default for Arbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Arbiter {
    /// An arbiter with the thread backend registered.
    pub fn new() -> Self {
        Self::empty().with_backend(Arc::new(ThreadBackend::default()))
    }

    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers `backend` for its mode, replacing any previous one.
    pub fn with_backend(mut self, backend: Arc<dyn ConcurrencyBackend>) -> Self {
        self.backends.insert(backend.mode(), backend);
        self
    }

    pub fn supports(&self, mode: ConcurrencyMode) -> bool {
        self.backends.contains_key(&mode)
    }

    pub async fn spawn(
        &self,
        bind: SocketAddr,
        name: &str,
        mode: ConcurrencyMode,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<ServerInstance>, BackendError> {
        let backend = self
            .backends
            .get(&mode)
            .cloned()
            .ok_or(BackendError::Unsupported(mode.as_str()))?;

        let control = {
            let mut state = self.state.lock().await;
            let live = self.live(&mut *state);
            ServerControl::supervised(live.kills.clone())
        };

        let result = backend
            .spawn(bind, name, Mid::generate(), dispatcher, control)
            .await;

        let mut state = self.state.lock().await;
        match result {
            Ok(instance) => {
                let instance = Arc::new(instance);
                let live = self.live(&mut *state);
                live.instances
                    .insert(instance.mid().clone(), Arc::clone(&instance));
                info!(
                    mid = %instance.mid(),
                    name,
                    concurrency = %mode,
                    address = %instance.address(),
                    live = live.instances.len(),
                    "server instance spawned"
                );
                Ok(instance)
            }
            Err(err) => {
                teardown_if_drained(&mut state);
                Err(err)
            }
        }
    }

    /// Stops the instance with `mid`. Unknown or already killed ids are a no-op.
    pub async fn kill(&self, mid: &Mid) -> Result<(), BackendError> {
        kill_instance(&self.state, mid).await
    }

    /// Kills every live instance, returning the first failure.
    pub async fn shutdown(&self) -> Result<(), BackendError> {
        let mut first_error = None;
        for instance in self.instances().await {
            if let Err(err) = self.kill(instance.mid()).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn get(&self, mid: &Mid) -> Option<Arc<ServerInstance>> {
        self.state
            .lock()
            .await
            .as_ref()
            .and_then(|state| state.instances.get(mid).cloned())
    }

    pub async fn instances(&self) -> Vec<Arc<ServerInstance>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|state| state.instances.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    fn live<'a>(&self, state: &'a mut Option<ArbiterState>) -> &'a mut ArbiterState {
        state.get_or_insert_with(|| ArbiterState::start(Arc::downgrade(&self.state)))
    }
}

async fn kill_instance(state: &Mutex<Option<ArbiterState>>, mid: &Mid) -> Result<(), BackendError> {
    let instance = state
        .lock()
        .await
        .as_mut()
        .and_then(|state| state.instances.remove(mid));

    let Some(instance) = instance else {
        debug!(mid = %mid, "kill requested for unknown instance");
        return Ok(());
    };

    let result = instance.kill().await;
    teardown_if_drained(&mut *state.lock().await);
    result
}

/// Carries out kill requests raised by served callables.
async fn reap(shared: Weak<Mutex<Option<ArbiterState>>>, mut requests: mpsc::UnboundedReceiver<Mid>) {
    while let Some(mid) = requests.recv().await {
        let Some(state) = shared.upgrade() else {
            break;
        };
        info!(mid = %mid, "kill requested by a served callable");
        if let Err(err) = kill_instance(&state, &mid).await {
            warn!(mid = %mid, error = %err, "requested kill failed");
        }
    }
}

fn teardown_if_drained(state: &mut Option<ArbiterState>) {
    if state.as_ref().is_some_and(|live| live.instances.is_empty()) {
        if let Some(stopped) = state.take() {
            stopped.reaper.abort();
            let uptime = Utc::now() - stopped.started_at;
            info!(uptime_secs = uptime.num_seconds(), "arbiter stopped");
        }
    }
}
