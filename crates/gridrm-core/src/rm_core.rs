//! RmCore — the single owner of the node registry.
//!
//! Every operation of the resource manager is a `&mut self` method here and
//! runs to completion without awaiting anything. Calls that must leave the
//! process (acquiring a node from its source, destroying it, telling a node
//! it was locked) are queued as [`OutboundCall`]s; the core task drains the
//! queue after each command and runs them in the background. Their results
//! come back as new commands.
//!
//! ```text
//! RmCore
//!   ├── NodeRegistry (nodes by URL, free pool, node sources)
//!   ├── CapacityEnforcer (ceiling on schedulable nodes)
//!   ├── lock manager (lock_node / unlock_node over the registry)
//!   ├── NodesLockRestorationManager (locks from the previous run)
//!   ├── NodeSelector + Authorizer (external collaborators)
//!   └── EventBus → EventDispatcher → monitors
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::{AllowAll, Authorizer, Client, Permission};
use crate::capacity::{CapacityEnforcer, CapacityLimit};
use crate::error::{AddingNodesError, RmError, RmResult};
use crate::event::{EventBus, RmEvent};
use crate::lock::{self, LockOutcome};
use crate::node::{
    parse_deploying_url, IllegalTransition, NodeRecord, NodeRegistration, NodeSet, NodeState,
    NodeView,
};
use crate::registry::{NodeRegistry, RmState};
use crate::restoration::NodesLockRestorationManager;
use crate::selection::{Criteria, FirstFitSelector, NodeSelector};
use crate::source::{NodeEndpoint, NodeSource};

/// Work the core wants done outside its own task.
pub enum OutboundCall {
    Acquire {
        node_source: Arc<dyn NodeSource>,
        node_url: String,
        provider: Client,
    },
    RemoveFromSource {
        node_source: Arc<dyn NodeSource>,
        node_url: String,
        preemptive: bool,
    },
    Lock {
        node_url: String,
        endpoint: Arc<dyn NodeEndpoint>,
        by: Client,
    },
    Unlock {
        node_url: String,
        endpoint: Arc<dyn NodeEndpoint>,
        by: Client,
    },
}

impl OutboundCall {
    pub fn node_url(&self) -> &str {
        match self {
            OutboundCall::Acquire { node_url, .. }
            | OutboundCall::RemoveFromSource { node_url, .. }
            | OutboundCall::Lock { node_url, .. }
            | OutboundCall::Unlock { node_url, .. } => node_url,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            OutboundCall::Acquire { .. } => "acquire",
            OutboundCall::RemoveFromSource { .. } => "remove_from_source",
            OutboundCall::Lock { .. } => "lock",
            OutboundCall::Unlock { .. } => "unlock",
        }
    }
}

impl fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCall")
            .field("kind", &self.kind())
            .field("node_url", &self.node_url())
            .finish()
    }
}

pub struct RmCore {
    registry: NodeRegistry,
    capacity: CapacityEnforcer,
    restoration: NodesLockRestorationManager,
    selector: Arc<dyn NodeSelector>,
    authorizer: Arc<dyn Authorizer>,
    events: EventBus,
    outbound: Vec<OutboundCall>,
}

impl RmCore {
    pub fn new(
        capacity: CapacityLimit,
        restoration: NodesLockRestorationManager,
        events: EventBus,
    ) -> Self {
        Self {
            registry: NodeRegistry::new(),
            capacity: CapacityEnforcer::new(capacity),
            restoration,
            selector: Arc::new(FirstFitSelector),
            authorizer: Arc::new(AllowAll),
            events,
            outbound: Vec::new(),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn NodeSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Load the previous run's locks, when restoration is enabled.
    pub fn init_nodes_restoration(&mut self) -> RmResult<()> {
        if self.restoration.is_enabled() {
            self.restoration.initialize()?;
        } else {
            debug!("nodes lock restoration disabled");
        }
        Ok(())
    }

    pub fn restoration(&self) -> &NodesLockRestorationManager {
        &self.restoration
    }

    pub fn capacity_limit(&self) -> CapacityLimit {
        self.capacity.limit()
    }

    pub fn set_capacity_limit(&mut self, limit: CapacityLimit) {
        info!(%limit, "capacity ceiling changed");
        self.capacity.set_limit(limit);
    }

    /// Drain the calls queued since the last drain.
    pub fn take_outbound(&mut self) -> Vec<OutboundCall> {
        std::mem::take(&mut self.outbound)
    }

    // ── Node sources ───────────────────────────────────────────────

    pub fn add_node_source(&mut self, caller: &Client, source: Arc<dyn NodeSource>) -> RmResult<()> {
        self.authorize(caller, Permission::NodeSourceAdmin, None)?;
        let name = source.name().to_string();
        if !self.registry.add_source(source) {
            return Err(RmError::InvalidArgument(format!(
                "node source {name} already exists"
            )));
        }
        info!(node_source = %name, "node source added");
        self.events.publish(RmEvent::NodeSourceAdded { node_source: name });
        Ok(())
    }

    /// Remove a node source and its nodes.
    ///
    /// Busy nodes are evicted when freed unless `preemptive`; the source
    /// stops accepting nodes at once and disappears with its last node.
    pub fn remove_node_source(
        &mut self,
        caller: &Client,
        name: &str,
        preemptive: bool,
    ) -> RmResult<bool> {
        self.authorize(caller, Permission::NodeSourceAdmin, None)?;
        if !self.registry.mark_source_shutting_down(name) {
            return Err(RmError::InvalidArgument(format!("unknown node source {name}")));
        }

        let urls = self.registry.nodes_of_source(name);
        info!(node_source = %name, nodes = urls.len(), preemptive, "removing node source");
        for url in &urls {
            self.remove_known_node(url, preemptive);
        }
        self.finish_source_removal(name);
        Ok(true)
    }

    pub fn node_source_names(&self) -> Vec<String> {
        self.registry.source_names()
    }

    // ── Adding nodes ───────────────────────────────────────────────

    /// Ask `node_source` to acquire the node at `node_url`.
    ///
    /// The node is registered later, when the source reports back. Unknown
    /// sources and a full fleet are refused here, before anything happens.
    pub fn add_node(&mut self, caller: &Client, node_url: &str, node_source: &str) -> RmResult<bool> {
        self.authorize(caller, Permission::NodeProvider, None)?;
        let Some(source) = self.registry.accepting_source(node_source).cloned() else {
            warn!(%node_url, %node_source, "cannot add node to unknown node source");
            return Err(AddingNodesError::UnknownNodeSource {
                node_url: node_url.to_string(),
                node_source: node_source.to_string(),
            }
            .into());
        };
        self.capacity.check_capacity(node_url, &self.registry)?;

        debug!(%node_url, %node_source, "node acquisition requested");
        self.outbound.push(OutboundCall::Acquire {
            node_source: source,
            node_url: node_url.to_string(),
            provider: caller.clone(),
        });
        Ok(true)
    }

    /// Register a node its source has provisioned.
    ///
    /// New nodes enter FREE. A known DEPLOYING or DOWN node is promoted to
    /// FREE; a known live node only has its provisioning details refreshed.
    pub fn internal_add_node(
        &mut self,
        provider: &Client,
        node_source: &str,
        registration: NodeRegistration,
    ) -> RmResult<bool> {
        let url = registration.url.clone();
        if self.registry.accepting_source(node_source).is_none() {
            warn!(node_url = %url, %node_source, "node reported by unknown node source");
            return Err(AddingNodesError::UnknownNodeSource {
                node_url: url,
                node_source: node_source.to_string(),
            }
            .into());
        }
        if let Some(existing) = self.registry.get(&url) {
            if existing.node_source != node_source {
                warn!(
                    node_url = %url,
                    registered_by = %existing.node_source,
                    %node_source,
                    "node already registered by another node source"
                );
                return Ok(false);
            }
        }
        self.capacity.check_capacity(&url, &self.registry)?;

        let Some(state) = self.registry.get(&url).map(NodeRecord::state) else {
            let node = NodeRecord::new(registration, node_source, provider.name(), NodeState::Free);
            let view = node.view();
            self.registry.insert(node);
            info!(node_url = %url, %node_source, provider = %provider, "node added");
            self.events.publish(RmEvent::NodeAdded { node: view });
            self.handle_restoration(&url);
            return Ok(true);
        };

        match state {
            NodeState::Free | NodeState::Busy | NodeState::ToBeRemoved => {
                self.registry
                    .update(&url, |node| node.refresh(registration, provider.name()));
                debug!(node_url = %url, %state, "node already registered");
                Ok(true)
            }
            NodeState::Deploying | NodeState::Down => {
                self.registry
                    .update(&url, |node| node.refresh(registration, provider.name()));
                Ok(self.transition_to_free(&url))
            }
            NodeState::Lost => {
                warn!(node_url = %url, "lost node cannot be registered again until removed");
                Ok(false)
            }
        }
    }

    /// Track a node its source has started provisioning.
    pub fn add_deploying_node(
        &mut self,
        caller: &Client,
        node_url: &str,
        node_source: &str,
    ) -> RmResult<bool> {
        self.authorize(caller, Permission::NodeProvider, None)?;
        if self.registry.accepting_source(node_source).is_none() {
            return Err(AddingNodesError::UnknownNodeSource {
                node_url: node_url.to_string(),
                node_source: node_source.to_string(),
            }
            .into());
        }
        if self.registry.contains(node_url) {
            debug!(%node_url, "deploying node already known");
            return Ok(false);
        }

        let node = NodeRecord::deploying(node_url, node_source, caller.name());
        let view = node.view();
        self.registry.insert(node);
        info!(%node_url, %node_source, "deploying node added");
        self.events.publish(RmEvent::NodeAdded { node: view });
        Ok(true)
    }

    /// A node source failed (or timed out) acquiring `node_url`.
    pub fn acquisition_failed(&mut self, node_url: &str, node_source: &str, reason: &str) {
        warn!(%node_url, %node_source, %reason, "node acquisition failed");
        match self.registry.get(node_url).map(NodeRecord::state) {
            Some(NodeState::Deploying) => {
                self.set_down_node(node_url);
            }
            _ => debug!(%node_url, "no node registered for failed acquisition"),
        }
    }

    // ── Removing nodes ─────────────────────────────────────────────

    /// Remove a node.
    ///
    /// Returns true when the node was removed now. A busy node under a
    /// non-preemptive removal is only marked TO_BE_REMOVED and false is
    /// returned. Unknown URLs return false.
    pub fn remove_node(&mut self, caller: &Client, url: &str, preemptive: bool) -> RmResult<bool> {
        if let Some(node) = self.registry.get(url) {
            self.authorize(caller, Permission::NodeAdmin, Some(&node.provider))?;
            return Ok(self.remove_known_node(url, preemptive));
        }

        if let Some((source_name, _)) = parse_deploying_url(url) {
            self.authorize(caller, Permission::NodeAdmin, None)?;
            let removed = self
                .registry
                .source(source_name)
                .is_some_and(|source| source.remove_deploying_node(url));
            debug!(node_url = %url, removed, "deploying node removal delegated to its source");
            return Ok(removed);
        }

        debug!(node_url = %url, "cannot remove unknown node");
        Ok(false)
    }

    fn remove_known_node(&mut self, url: &str, preemptive: bool) -> bool {
        let Some(state) = self.registry.get(url).map(NodeRecord::state) else {
            return false;
        };
        let busy = matches!(state, NodeState::Busy | NodeState::ToBeRemoved);
        if preemptive || !busy {
            self.remove_node_from_core(url, preemptive);
            return true;
        }
        if state == NodeState::Busy {
            self.change_state(url, NodeState::ToBeRemoved);
            info!(node_url = %url, "busy node will be removed once released");
        }
        false
    }

    fn remove_node_from_core(&mut self, url: &str, preemptive: bool) {
        let Some(node) = self.registry.remove(url) else {
            return;
        };
        info!(node_url = %url, node_source = %node.node_source, state = %node.state(), "node removed");
        if let Some(source) = self.registry.source(&node.node_source).cloned() {
            self.outbound.push(OutboundCall::RemoveFromSource {
                node_source: source,
                node_url: url.to_string(),
                preemptive,
            });
        }
        self.events.publish(RmEvent::NodeRemoved { node: node.view() });
        self.finish_source_removal(&node.node_source);
    }

    /// Drop a shutting-down source once it has no nodes left.
    fn finish_source_removal(&mut self, name: &str) {
        if !self.registry.is_source_shutting_down(name)
            || !self.registry.nodes_of_source(name).is_empty()
        {
            return;
        }
        self.registry.remove_source(name);
        self.restoration.forget_source(name);
        info!(node_source = %name, "node source removed");
        self.events.publish(RmEvent::NodeSourceRemoved {
            node_source: name.to_string(),
        });
    }

    // ── Acquiring and releasing nodes ──────────────────────────────

    /// Hand free nodes to `caller`.
    ///
    /// Unless `criteria.best_effort`, either the full count is granted or
    /// nothing is. Granted nodes become BUSY and owned by the caller.
    pub fn get_nodes(&mut self, caller: &Client, criteria: &Criteria) -> RmResult<NodeSet> {
        if criteria.size < 0 {
            return Err(RmError::InvalidArgument(format!(
                "number of nodes must be non-negative, got {}",
                criteria.size
            )));
        }
        self.authorize(caller, Permission::NodeUsage, None)?;

        let wanted = criteria.size as usize;
        if wanted == 0 {
            return Ok(Vec::new());
        }

        let free = self.registry.free_views();
        let mut seen = BTreeSet::new();
        let selected: Vec<String> = self
            .selector
            .select_nodes(criteria, caller, &free)
            .into_iter()
            .filter(|url| self.registry.is_free(url) && seen.insert(url.clone()))
            .take(wanted)
            .collect();

        if !criteria.best_effort && selected.len() < wanted {
            info!(
                requester = %caller,
                requested = wanted,
                available = selected.len(),
                "not enough free nodes for request"
            );
            return Ok(Vec::new());
        }

        let nodes: NodeSet = selected
            .iter()
            .filter_map(|url| self.set_busy(url, caller))
            .collect();
        info!(requester = %caller, requested = wanted, granted = nodes.len(), "nodes handed out");
        Ok(nodes)
    }

    /// Like [`get_nodes`](Self::get_nodes), accepting fewer nodes than asked.
    pub fn get_at_most_nodes(&mut self, caller: &Client, criteria: &Criteria) -> RmResult<NodeSet> {
        let criteria = criteria.clone().best_effort(true);
        self.get_nodes(caller, &criteria)
    }

    fn set_busy(&mut self, url: &str, caller: &Client) -> Option<NodeView> {
        let previous = self.registry.update(url, |node| {
            let previous = node.transition(NodeState::Busy)?;
            node.owner = Some(caller.name().to_string());
            Ok::<_, IllegalTransition>(previous)
        })?;
        match previous {
            Ok(previous) => {
                debug!(node_url = %url, owner = %caller, "node busy");
                let view = self.registry.get(url)?.view();
                self.events.publish(RmEvent::NodeStateChanged {
                    node: view.clone(),
                    previous,
                });
                Some(view)
            }
            Err(e) => {
                warn!(error = %e, "cannot hand out node");
                None
            }
        }
    }

    /// Give nodes back. Returns false if any URL is unknown.
    ///
    /// Only the holder of a node (or someone allowed to use it on the
    /// holder's behalf) may release it.
    pub fn release_nodes(&mut self, caller: &Client, urls: &[String]) -> RmResult<bool> {
        for url in urls {
            if let Some(node) = self.registry.get(url) {
                self.authorize(caller, Permission::NodeUsage, node.owner.as_deref())?;
            }
        }

        let mut all_known = true;
        for url in urls {
            match self.registry.get(url).map(NodeRecord::state) {
                None => {
                    warn!(node_url = %url, "cannot release unknown node");
                    all_known = false;
                }
                Some(NodeState::Busy | NodeState::ToBeRemoved) => {
                    self.internal_set_free(url);
                }
                Some(state) => debug!(node_url = %url, %state, "node not busy, nothing to release"),
            }
        }
        Ok(all_known)
    }

    pub fn release_node(&mut self, caller: &Client, url: &str) -> RmResult<bool> {
        self.release_nodes(caller, &[url.to_string()])
    }

    // ── State transitions ──────────────────────────────────────────

    /// Free every node that is not FREE yet. Always true.
    pub fn set_free_nodes(&mut self, urls: &[String]) -> bool {
        for url in urls {
            match self.registry.get(url).map(NodeRecord::state) {
                None => warn!(node_url = %url, "cannot free unknown node"),
                Some(NodeState::Free) => debug!(node_url = %url, "node already free"),
                Some(_) => {
                    self.internal_set_free(url);
                }
            }
        }
        true
    }

    /// Move a node to FREE, or evict it if it was marked for removal.
    pub fn internal_set_free(&mut self, url: &str) -> bool {
        let Some(state) = self.registry.get(url).map(NodeRecord::state) else {
            warn!(node_url = %url, "cannot free unknown node");
            return false;
        };
        match state {
            NodeState::ToBeRemoved => {
                self.remove_node_from_core(url, false);
                true
            }
            NodeState::Down | NodeState::Lost => {
                debug!(node_url = %url, %state, "failed node cannot be freed");
                false
            }
            NodeState::Free => true,
            NodeState::Busy | NodeState::Deploying => self.transition_to_free(url),
        }
    }

    fn transition_to_free(&mut self, url: &str) -> bool {
        let result = self.registry.update(url, |node| {
            let previous = node.transition(NodeState::Free)?;
            node.owner = None;
            Ok::<_, IllegalTransition>(previous)
        });
        match result {
            None => false,
            Some(Err(e)) => {
                warn!(error = %e, "cannot free node");
                false
            }
            Some(Ok(previous)) => {
                if previous != NodeState::Free {
                    info!(node_url = %url, %previous, "node free");
                    self.publish_state_change(url, previous);
                }
                self.handle_restoration(url);
                true
            }
        }
    }

    /// Mark a node DOWN. Returns false for unknown nodes and illegal transitions.
    pub fn set_down_node(&mut self, url: &str) -> bool {
        self.set_failed(url, NodeState::Down)
    }

    /// Mark a node LOST. Returns false for unknown nodes and illegal transitions.
    pub fn set_lost(&mut self, url: &str) -> bool {
        self.set_failed(url, NodeState::Lost)
    }

    fn set_failed(&mut self, url: &str, to: NodeState) -> bool {
        match self.registry.get(url).map(NodeRecord::state) {
            None => {
                warn!(node_url = %url, state = %to, "cannot change state of unknown node");
                false
            }
            Some(NodeState::ToBeRemoved) => {
                // Removal was already requested; there is nothing left to wait for.
                info!(node_url = %url, state = %to, "node failed while awaiting removal");
                self.remove_node_from_core(url, true);
                true
            }
            Some(_) => {
                if !self.change_state(url, to) {
                    return false;
                }
                self.handle_restoration(url);
                true
            }
        }
    }

    /// Apply a transition and publish it. Returns false if it was refused.
    fn change_state(&mut self, url: &str, to: NodeState) -> bool {
        match self.registry.update(url, |node| node.transition(to)) {
            None => false,
            Some(Err(e)) => {
                warn!(error = %e, "node state change refused");
                false
            }
            Some(Ok(previous)) => {
                if previous != to {
                    info!(node_url = %url, %previous, state = %to, "node state changed");
                    self.publish_state_change(url, previous);
                }
                true
            }
        }
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Lock nodes; per-URL outcome.
    pub fn lock_nodes_detailed(
        &mut self,
        caller: &Client,
        urls: &BTreeSet<String>,
    ) -> RmResult<BTreeMap<String, bool>> {
        self.authorize_admin(caller, urls)?;
        Ok(urls
            .iter()
            .map(|url| (url.clone(), self.apply_lock(url, caller).is_applied()))
            .collect())
    }

    /// Lock nodes. True iff every URL named a known, unlocked node.
    pub fn lock_nodes(&mut self, caller: &Client, urls: &BTreeSet<String>) -> RmResult<bool> {
        let results = self.lock_nodes_detailed(caller, urls)?;
        Ok(results.values().all(|locked| *locked))
    }

    /// Unlock nodes; per-URL outcome.
    pub fn unlock_nodes_detailed(
        &mut self,
        caller: &Client,
        urls: &BTreeSet<String>,
    ) -> RmResult<BTreeMap<String, bool>> {
        self.authorize_admin(caller, urls)?;
        Ok(urls
            .iter()
            .map(|url| (url.clone(), self.apply_unlock(url, caller).is_applied()))
            .collect())
    }

    /// Unlock nodes. True iff every URL named a known, locked node.
    pub fn unlock_nodes(&mut self, caller: &Client, urls: &BTreeSet<String>) -> RmResult<bool> {
        let results = self.unlock_nodes_detailed(caller, urls)?;
        Ok(results.values().all(|unlocked| *unlocked))
    }

    fn authorize_admin(&self, caller: &Client, urls: &BTreeSet<String>) -> RmResult<()> {
        for url in urls {
            if let Some(node) = self.registry.get(url) {
                self.authorize(caller, Permission::NodeAdmin, Some(&node.provider))?;
            }
        }
        Ok(())
    }

    fn apply_lock(&mut self, url: &str, by: &Client) -> LockOutcome {
        let outcome = lock::lock_node(&mut self.registry, url, by);
        if outcome.is_applied() {
            if let Some(node) = self.registry.get(url) {
                self.restoration.record_lock(node);
                if let Some(endpoint) = node.endpoint.clone() {
                    self.outbound.push(OutboundCall::Lock {
                        node_url: url.to_string(),
                        endpoint,
                        by: by.clone(),
                    });
                }
                self.events.publish(RmEvent::NodeLockChanged { node: node.view() });
            }
        }
        outcome
    }

    fn apply_unlock(&mut self, url: &str, by: &Client) -> LockOutcome {
        let outcome = lock::unlock_node(&mut self.registry, url, by);
        if outcome.is_applied() {
            if let Some(node) = self.registry.get(url) {
                self.restoration.record_unlock(node);
                if let Some(endpoint) = node.endpoint.clone() {
                    self.outbound.push(OutboundCall::Unlock {
                        node_url: url.to_string(),
                        endpoint,
                        by: by.clone(),
                    });
                }
                self.events.publish(RmEvent::NodeLockChanged { node: node.view() });
            }
        }
        outcome
    }

    /// Let the restoration manager re-apply a lock from the previous run.
    fn handle_restoration(&mut self, url: &str) {
        let Some(node) = self.registry.get(url) else {
            return;
        };
        if let Some(intent) = self.restoration.handle(node) {
            let by = Client::new(intent.locked_by);
            self.apply_lock(url, &by);
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_state(&self) -> RmState {
        self.registry.snapshot()
    }

    pub fn get_free_nodes(&self) -> NodeSet {
        self.registry.free_views()
    }

    pub fn get_all_nodes(&self) -> NodeSet {
        self.registry.all_views()
    }

    pub fn get_node(&self, url: &str) -> Option<NodeView> {
        self.registry.get(url).map(NodeRecord::view)
    }

    /// Look a node up in the registry, then among the deploying nodes of
    /// the source named in a deploying URL.
    pub fn get_node_by_url_including_deploying_nodes(&self, url: &str) -> Option<NodeView> {
        if let Some(node) = self.registry.get(url) {
            return Some(node.view());
        }
        let (source_name, _) = parse_deploying_url(url)?;
        self.registry.source(source_name)?.deploying_node(url)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn authorize(
        &self,
        caller: &Client,
        permission: Permission,
        resource_owner: Option<&str>,
    ) -> RmResult<()> {
        if self
            .authorizer
            .check_permission(caller, permission, resource_owner)
        {
            return Ok(());
        }
        warn!(caller = %caller, %permission, "permission denied");
        Err(RmError::PermissionDenied {
            caller: caller.name().to_string(),
            permission,
        })
    }

    fn publish_state_change(&self, url: &str, previous: NodeState) {
        if let Some(node) = self.registry.get(url) {
            self.events.publish(RmEvent::NodeStateChanged {
                node: node.view(),
                previous,
            });
        }
    }
}
