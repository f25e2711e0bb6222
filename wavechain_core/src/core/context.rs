use crate::communication::relay_buffer::RelayBuffer;
use crate::config::{ChainSettings, ChainTopology, NodeIdentity, NodeRole, PeerAddress};
use crate::error::{WaveError, WaveResult};
use std::time::Duration;

/// Where a node sends its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Last node of the chain
    Terminal,
    Peer(PeerAddress),
    /// Destination name with no topology entry; fails at send time
    Unresolved(String),
}

/// Everything a node owns besides its port and current state.
///
/// Built once at startup and owned by the node task; nothing in here is
/// shared with other nodes.
#[derive(Debug)]
pub struct NodeContext {
    pub identity: NodeIdentity,
    pub route: Route,
    pub buffer: RelayBuffer,
    pub cooldown: Duration,
    pub io_timeout: Duration,
}

impl NodeContext {
    pub fn new(identity: NodeIdentity, route: Route, settings: &ChainSettings) -> Self {
        Self {
            identity,
            route,
            buffer: RelayBuffer::new(settings.relay_capacity, settings.overflow_policy),
            cooldown: settings.cooldown(),
            io_timeout: settings.io_timeout(),
        }
    }

    /// Context for `name`; an unknown destination is kept and reported when a cycle sends
    pub fn from_topology(topology: &ChainTopology, name: &str) -> WaveResult<Self> {
        let identity = topology.identity(name)?;
        let route = match topology.next_hop(name) {
            Ok(Some(peer)) => Route::Peer(peer),
            Ok(None) => Route::Terminal,
            Err(_) => Route::Unresolved(identity.destination.clone().unwrap_or_default()),
        };
        Ok(Self::new(identity, route, &topology.settings))
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn is_sensing(&self) -> bool {
        self.identity.role == NodeRole::Sensing
    }

    /// Next hop for a finished cycle; `None` for the terminal node
    pub fn next_hop(&self) -> WaveResult<Option<&PeerAddress>> {
        match &self.route {
            Route::Terminal => Ok(None),
            Route::Peer(peer) => Ok(Some(peer)),
            Route::Unresolved(dest) => Err(WaveError::configuration(format!(
                "Destination '{}' of node '{}' is not in the topology",
                dest, self.identity.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_route_fails_at_lookup() {
        let topology = ChainTopology::from_yaml(
            r#"
            nodes:
              res01: { address: 127.0.0.1, port: 9000, destination: nowhere }
            "#,
        )
        .unwrap();

        let ctx = NodeContext::from_topology(&topology, "res01").unwrap();
        assert_eq!(ctx.route, Route::Unresolved("nowhere".into()));
        assert!(matches!(ctx.next_hop(), Err(WaveError::Configuration(_))));
        assert_eq!(ctx.buffer.capacity(), 6);
    }

    #[test]
    fn test_missing_node_fails_at_startup() {
        let topology = ChainTopology::default();
        assert!(NodeContext::from_topology(&topology, "res01").is_err());
    }
}
