//! Node source and node endpoint collaborators.
//!
//! A node source provisions and destroys nodes of one kind (static hosts,
//! cloud instances, local processes). The core never waits on a source
//! inline: every future returned here is spawned by the core task and its
//! outcome re-enters the core as a new command. Implementations must
//! therefore return `'static` futures, cloning whatever they need out of
//! the borrowed arguments.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info};

use crate::auth::Client;
use crate::node::{NodeRegistration, NodeView};

/// Boxed future returned by collaborator calls.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The underlying resource of a registered node.
pub trait NodeEndpoint: Send + Sync {
    /// Tell the node it has been locked by `by`.
    fn lock(&self, by: &Client) -> BoxFuture<anyhow::Result<()>>;

    /// Tell the node it has been unlocked by `by`.
    fn unlock(&self, by: &Client) -> BoxFuture<anyhow::Result<()>>;
}

/// A provider of nodes.
pub trait NodeSource: Send + Sync {
    fn name(&self) -> &str;

    /// Provision (or look up) the node at `node_url` on behalf of `provider`.
    ///
    /// A failure or a timeout leaves nothing registered.
    fn acquire_node(
        &self,
        node_url: &str,
        provider: &Client,
    ) -> BoxFuture<anyhow::Result<NodeRegistration>>;

    /// A node this source is still provisioning, if `url` names one.
    fn deploying_node(&self, _url: &str) -> Option<NodeView> {
        None
    }

    /// Abort the provisioning of a deploying node. Returns true if the
    /// source knew the node.
    fn remove_deploying_node(&self, _url: &str) -> bool {
        false
    }

    /// Destroy a node the core has just unregistered.
    fn remove_node(&self, _node_url: &str, _preemptive: bool) -> BoxFuture<anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Endpoint for nodes without a control channel; lock changes are only logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEndpoint;

impl NodeEndpoint for LoggingEndpoint {
    fn lock(&self, by: &Client) -> BoxFuture<anyhow::Result<()>> {
        let by = by.name().to_string();
        Box::pin(async move {
            debug!(%by, "node endpoint locked");
            Ok(())
        })
    }

    fn unlock(&self, by: &Client) -> BoxFuture<anyhow::Result<()>> {
        let by = by.name().to_string();
        Box::pin(async move {
            debug!(%by, "node endpoint unlocked");
            Ok(())
        })
    }
}

/// A source of pre-existing nodes identified only by their URL.
///
/// Acquisition always succeeds and removal only forgets the node; this is
/// what the daemon uses for nodes listed in its configuration.
#[derive(Debug, Clone)]
pub struct StaticNodeSource {
    name: String,
}

impl StaticNodeSource {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }
}

impl NodeSource for StaticNodeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire_node(
        &self,
        node_url: &str,
        _provider: &Client,
    ) -> BoxFuture<anyhow::Result<NodeRegistration>> {
        let registration = NodeRegistration::from_url(node_url, Arc::new(LoggingEndpoint));
        Box::pin(async move { Ok(registration) })
    }

    fn remove_node(&self, node_url: &str, preemptive: bool) -> BoxFuture<anyhow::Result<()>> {
        let source = self.name.clone();
        let node_url = node_url.to_string();
        Box::pin(async move {
            info!(%source, %node_url, preemptive, "static node released");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_registers_any_url() {
        let source = StaticNodeSource::new("static");
        let reg = source
            .acquire_node("pnp://host-b:1099/n2", &Client::new("alice"))
            .await
            .unwrap();
        assert_eq!(reg.url, "pnp://host-b:1099/n2");
        assert_eq!(reg.host, "host-b");
        assert_eq!(reg.name, "n2");
        assert!(reg.endpoint.lock(&Client::internal()).await.is_ok());
    }

    #[test]
    fn static_source_has_no_deploying_nodes() {
        let source = StaticNodeSource::new("static");
        assert_eq!(source.name(), "static");
        assert!(source.deploying_node("deploying://static/n1").is_none());
        assert!(!source.remove_deploying_node("deploying://static/n1"));
    }
}
