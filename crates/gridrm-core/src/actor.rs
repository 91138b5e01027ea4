//! The core task and the handles used to talk to it.
//!
//! [`RmCore`] is owned by a single task that executes one command at a time.
//! Callers hold an [`RmHandle`]; each method sends a closure over a bounded
//! channel and waits for the reply on a oneshot. After every command the
//! task drains the calls the core queued and spawns them, so a slow node
//! source never holds up the registry. Acquisition outcomes are sent back
//! to the task as new commands.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AllowAll, Authorizer, Client};
use crate::capacity::CapacityLimit;
use crate::config::CoreConfig;
use crate::error::{RmError, RmResult};
use crate::event::{EventBus, EventDispatcher, RmMonitor};
use crate::node::{NodeRegistration, NodeSet, NodeView};
use crate::registry::RmState;
use crate::restoration::{LockStore, MemoryLockStore, NodesLockRestorationManager};
use crate::rm_core::{OutboundCall, RmCore};
use crate::selection::{Criteria, FirstFitSelector, NodeSelector};
use crate::source::NodeSource;

type CoreCall = Box<dyn FnOnce(&mut RmCore) + Send>;

enum Command {
    Call(CoreCall),
    NodeAcquired {
        node_source: String,
        provider: Client,
        registration: NodeRegistration,
    },
    AcquisitionFailed {
        node_source: String,
        node_url: String,
        reason: String,
    },
}

// ── Core task ──────────────────────────────────────────────────────

struct RmActor {
    core: RmCore,
    rx: mpsc::Receiver<Command>,
    /// Lets spawned calls report back without keeping the task alive.
    tx: mpsc::WeakSender<Command>,
    acquisition_timeout: Duration,
}

impl RmActor {
    /// Execute commands until shutdown or until every handle is gone.
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RmCore {
        debug!("resource manager core task started");
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.execute(command),
                    None => {
                        debug!("all resource manager handles dropped");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    debug!("resource manager core task shutting down");
                    break;
                }
            }
            self.dispatch_outbound();
        }
        self.core
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Call(call) => call(&mut self.core),
            Command::NodeAcquired {
                node_source,
                provider,
                registration,
            } => {
                let node_url = registration.url.clone();
                if let Err(e) = self
                    .core
                    .internal_add_node(&provider, &node_source, registration)
                {
                    warn!(%node_url, %node_source, error = %e, "acquired node refused");
                }
            }
            Command::AcquisitionFailed {
                node_source,
                node_url,
                reason,
            } => self.core.acquisition_failed(&node_url, &node_source, &reason),
        }
    }

    fn dispatch_outbound(&mut self) {
        for call in self.core.take_outbound() {
            match call {
                OutboundCall::Acquire {
                    node_source,
                    node_url,
                    provider,
                } => {
                    let tx = self.tx.clone();
                    let timeout = self.acquisition_timeout;
                    tokio::spawn(async move {
                        let command = acquire(node_source, node_url, provider, timeout).await;
                        report(tx, command).await;
                    });
                }
                OutboundCall::RemoveFromSource {
                    node_source,
                    node_url,
                    preemptive,
                } => {
                    tokio::spawn(async move {
                        if let Err(e) = node_source.remove_node(&node_url, preemptive).await {
                            error!(%node_url, error = %e, "node source failed to remove node");
                        }
                    });
                }
                OutboundCall::Lock {
                    node_url,
                    endpoint,
                    by,
                } => {
                    tokio::spawn(async move {
                        if let Err(e) = endpoint.lock(&by).await {
                            error!(%node_url, error = %e, "failed to notify node of its lock");
                        }
                    });
                }
                OutboundCall::Unlock {
                    node_url,
                    endpoint,
                    by,
                } => {
                    tokio::spawn(async move {
                        if let Err(e) = endpoint.unlock(&by).await {
                            error!(%node_url, error = %e, "failed to notify node of its unlock");
                        }
                    });
                }
            }
        }
    }
}

async fn acquire(
    node_source: Arc<dyn NodeSource>,
    node_url: String,
    provider: Client,
    timeout: Duration,
) -> Command {
    let source_name = node_source.name().to_string();
    let acquisition = node_source.acquire_node(&node_url, &provider);
    match tokio::time::timeout(timeout, acquisition).await {
        Ok(Ok(registration)) => Command::NodeAcquired {
            node_source: source_name,
            provider,
            registration,
        },
        Ok(Err(e)) => Command::AcquisitionFailed {
            node_source: source_name,
            node_url,
            reason: format!("{e:#}"),
        },
        Err(_) => Command::AcquisitionFailed {
            node_source: source_name,
            node_url,
            reason: format!("timed out after {timeout:?}"),
        },
    }
}

async fn report(tx: mpsc::WeakSender<Command>, command: Command) {
    let Some(tx) = tx.upgrade() else {
        debug!("resource manager stopped, dropping acquisition result");
        return;
    };
    if tx.send(command).await.is_err() {
        debug!("resource manager stopped, dropping acquisition result");
    }
}

// ── Handle ─────────────────────────────────────────────────────────

/// Cloneable access to a running resource manager on behalf of a caller.
#[derive(Clone)]
pub struct RmHandle {
    tx: mpsc::Sender<Command>,
    caller: Client,
}

impl RmHandle {
    /// The same manager, acting as `caller`.
    pub fn as_client(&self, caller: Client) -> Self {
        Self {
            tx: self.tx.clone(),
            caller,
        }
    }

    pub fn caller(&self) -> &Client {
        &self.caller
    }

    async fn call<R, F>(&self, f: F) -> RmResult<R>
    where
        F: FnOnce(&mut RmCore, &Client) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let caller = self.caller.clone();
        let call: CoreCall = Box::new(move |core| {
            let _ = reply_tx.send(f(core, &caller));
        });
        self.tx
            .send(Command::Call(call))
            .await
            .map_err(|_| RmError::Unavailable)?;
        reply_rx.await.map_err(|_| RmError::Unavailable)
    }

    // Node sources

    pub async fn add_node_source(&self, source: Arc<dyn NodeSource>) -> RmResult<()> {
        self.call(move |core, caller| core.add_node_source(caller, source))
            .await?
    }

    pub async fn remove_node_source(&self, name: &str, preemptive: bool) -> RmResult<bool> {
        let name = name.to_string();
        self.call(move |core, caller| core.remove_node_source(caller, &name, preemptive))
            .await?
    }

    pub async fn node_source_names(&self) -> RmResult<Vec<String>> {
        self.call(|core, _| core.node_source_names()).await
    }

    // Nodes

    pub async fn add_node(&self, node_url: &str, node_source: &str) -> RmResult<bool> {
        let (node_url, node_source) = (node_url.to_string(), node_source.to_string());
        self.call(move |core, caller| core.add_node(caller, &node_url, &node_source))
            .await?
    }

    pub async fn add_deploying_node(&self, node_url: &str, node_source: &str) -> RmResult<bool> {
        let (node_url, node_source) = (node_url.to_string(), node_source.to_string());
        self.call(move |core, caller| core.add_deploying_node(caller, &node_url, &node_source))
            .await?
    }

    pub async fn remove_node(&self, node_url: &str, preemptive: bool) -> RmResult<bool> {
        let node_url = node_url.to_string();
        self.call(move |core, caller| core.remove_node(caller, &node_url, preemptive))
            .await?
    }

    pub async fn get_nodes(&self, criteria: Criteria) -> RmResult<NodeSet> {
        self.call(move |core, caller| core.get_nodes(caller, &criteria))
            .await?
    }

    pub async fn get_at_most_nodes(&self, criteria: Criteria) -> RmResult<NodeSet> {
        self.call(move |core, caller| core.get_at_most_nodes(caller, &criteria))
            .await?
    }

    pub async fn release_node(&self, node_url: &str) -> RmResult<bool> {
        let node_url = node_url.to_string();
        self.call(move |core, caller| core.release_node(caller, &node_url))
            .await?
    }

    pub async fn release_nodes(&self, node_urls: Vec<String>) -> RmResult<bool> {
        self.call(move |core, caller| core.release_nodes(caller, &node_urls))
            .await?
    }

    pub async fn set_free_nodes(&self, node_urls: Vec<String>) -> RmResult<bool> {
        self.call(move |core, _| core.set_free_nodes(&node_urls)).await
    }

    pub async fn set_down_node(&self, node_url: &str) -> RmResult<bool> {
        let node_url = node_url.to_string();
        self.call(move |core, _| core.set_down_node(&node_url)).await
    }

    pub async fn set_lost(&self, node_url: &str) -> RmResult<bool> {
        let node_url = node_url.to_string();
        self.call(move |core, _| core.set_lost(&node_url)).await
    }

    // Locks

    pub async fn lock_nodes(&self, node_urls: BTreeSet<String>) -> RmResult<bool> {
        self.call(move |core, caller| core.lock_nodes(caller, &node_urls))
            .await?
    }

    pub async fn lock_nodes_detailed(
        &self,
        node_urls: BTreeSet<String>,
    ) -> RmResult<BTreeMap<String, bool>> {
        self.call(move |core, caller| core.lock_nodes_detailed(caller, &node_urls))
            .await?
    }

    pub async fn unlock_nodes(&self, node_urls: BTreeSet<String>) -> RmResult<bool> {
        self.call(move |core, caller| core.unlock_nodes(caller, &node_urls))
            .await?
    }

    pub async fn unlock_nodes_detailed(
        &self,
        node_urls: BTreeSet<String>,
    ) -> RmResult<BTreeMap<String, bool>> {
        self.call(move |core, caller| core.unlock_nodes_detailed(caller, &node_urls))
            .await?
    }

    // Queries

    pub async fn get_state(&self) -> RmResult<RmState> {
        self.call(|core, _| core.get_state()).await
    }

    pub async fn get_free_nodes(&self) -> RmResult<NodeSet> {
        self.call(|core, _| core.get_free_nodes()).await
    }

    pub async fn get_all_nodes(&self) -> RmResult<NodeSet> {
        self.call(|core, _| core.get_all_nodes()).await
    }

    pub async fn get_node(&self, node_url: &str) -> RmResult<Option<NodeView>> {
        let node_url = node_url.to_string();
        self.call(move |core, _| core.get_node(&node_url)).await
    }

    pub async fn get_node_by_url_including_deploying_nodes(
        &self,
        node_url: &str,
    ) -> RmResult<Option<NodeView>> {
        let node_url = node_url.to_string();
        self.call(move |core, _| core.get_node_by_url_including_deploying_nodes(&node_url))
            .await
    }

    pub async fn set_capacity_limit(&self, limit: CapacityLimit) -> RmResult<()> {
        self.call(move |core, _| core.set_capacity_limit(limit)).await
    }
}

// ── Resource manager ───────────────────────────────────────────────

/// A running resource manager: the core task plus the event dispatcher.
pub struct ResourceManager {
    handle: RmHandle,
    shutdown_tx: watch::Sender<bool>,
    core_task: JoinHandle<RmCore>,
    dispatcher_task: JoinHandle<()>,
}

pub struct ResourceManagerBuilder {
    config: CoreConfig,
    lock_store: Arc<dyn LockStore>,
    selector: Arc<dyn NodeSelector>,
    authorizer: Arc<dyn Authorizer>,
    monitors: Vec<Arc<dyn RmMonitor>>,
}

impl ResourceManagerBuilder {
    /// Where lock intents are persisted for restoration.
    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = store;
        self
    }

    pub fn selector(mut self, selector: Arc<dyn NodeSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn RmMonitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    /// Initialise the core and spawn its tasks. Must run inside a tokio runtime.
    pub fn start(self) -> RmResult<ResourceManager> {
        let capacity = self.config.capacity_limit()?;
        let acquisition_timeout = self.config.acquisition_timeout()?;

        let (events, event_rx) = EventBus::new(self.config.event_queue_capacity);
        let restoration =
            NodesLockRestorationManager::new(self.lock_store, self.config.nodes_lock_restoration);
        let mut core = RmCore::new(capacity, restoration, events)
            .with_selector(self.selector)
            .with_authorizer(self.authorizer);
        core.init_nodes_restoration()?;

        let dispatcher = self
            .monitors
            .into_iter()
            .fold(EventDispatcher::new(event_rx), EventDispatcher::with_monitor);
        let dispatcher_task = tokio::spawn(dispatcher.run());

        let (tx, rx) = mpsc::channel(self.config.command_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let actor = RmActor {
            core,
            rx,
            tx: tx.downgrade(),
            acquisition_timeout,
        };
        let core_task = tokio::spawn(actor.run(shutdown_rx));

        info!(
            %capacity,
            nodes_lock_restoration = self.config.nodes_lock_restoration,
            ?acquisition_timeout,
            "resource manager started"
        );
        Ok(ResourceManager {
            handle: RmHandle {
                tx,
                caller: Client::internal(),
            },
            shutdown_tx,
            core_task,
            dispatcher_task,
        })
    }
}

impl ResourceManager {
    pub fn builder(config: CoreConfig) -> ResourceManagerBuilder {
        ResourceManagerBuilder {
            config,
            lock_store: Arc::new(MemoryLockStore::new()),
            selector: Arc::new(FirstFitSelector),
            authorizer: Arc::new(AllowAll),
            monitors: Vec::new(),
        }
    }

    /// A handle acting as the resource manager itself.
    pub fn handle(&self) -> RmHandle {
        self.handle.clone()
    }

    /// Stop the core task, flush pending events, and return the final fleet state.
    ///
    /// Commands still queued are dropped; their callers see [`RmError::Unavailable`].
    pub async fn shutdown(self) -> RmResult<RmState> {
        let _ = self.shutdown_tx.send(true);
        let core = self.core_task.await.map_err(|e| {
            error!(error = %e, "resource manager core task failed");
            RmError::Unavailable
        })?;
        let state = core.get_state();
        // Dropping the core closes the event queue; the dispatcher drains it and exits.
        drop(core);
        if let Err(e) = self.dispatcher_task.await {
            error!(error = %e, "event dispatcher task failed");
        }
        info!(nodes = state.total_nodes, "resource manager stopped");
        Ok(state)
    }
}
