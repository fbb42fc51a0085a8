//! The host set a session dispatches over.
//!
//! Topology discovery is out of scope: the session receives an
//! already-populated [`ClusterState`] and only tracks host health, driven by
//! pool events through [`HostStateListener`].

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::errors::ConnectionError;
use crate::network::pool_manager::PoolListener;

/// Health of a host as observed through its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// No pool event was observed yet.
    Unknown,
    /// The host's pool has at least one live connection.
    Up,
    /// The host's pool is empty or failed to open.
    Down,
}

impl HostState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HostState::Up,
            2 => HostState::Down,
            _ => HostState::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HostState::Unknown => 0,
            HostState::Up => 1,
            HostState::Down => 2,
        }
    }
}

/// A cluster node the session may dispatch to.
#[derive(Debug)]
pub struct Host {
    /// Unique identifier of the host.
    pub host_id: Uuid,
    /// Address requests for this host are sent to.
    pub address: SocketAddr,
    /// Datacenter of the host, if known.
    pub datacenter: Option<String>,

    state: AtomicU8,
}

/// A way hosts are commonly passed around without bumping refcounts.
pub type HostRef<'a> = &'a Arc<Host>;

impl Host {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            host_id: Uuid::new_v4(),
            address,
            datacenter: None,
            state: AtomicU8::new(HostState::Unknown.as_u8()),
        }
    }

    pub fn with_datacenter(address: SocketAddr, datacenter: impl Into<String>) -> Self {
        Self {
            datacenter: Some(datacenter.into()),
            ..Self::new(address)
        }
    }

    pub fn state(&self) -> HostState {
        HostState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: HostState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn is_up(&self) -> bool {
        self.state() == HostState::Up
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}

/// The set of hosts known to a session. Iteration order is the insertion
/// order, which keeps load balancing plans reproducible.
#[derive(Debug, Default)]
pub struct ClusterState {
    hosts: Vec<Arc<Host>>,
    by_address: HashMap<SocketAddr, Arc<Host>>,
}

impl ClusterState {
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        let mut state = ClusterState::default();
        for host in hosts {
            let host = Arc::new(host);
            if state
                .by_address
                .insert(host.address, host.clone())
                .is_none()
            {
                state.hosts.push(host);
            }
        }
        state
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn host(&self, address: &SocketAddr) -> Option<&Arc<Host>> {
        self.by_address.get(address)
    }
}

/// Forwards pool lifecycle events into host states, optionally chaining to a
/// user listener. Install it as the manager's listener to keep the
/// dispatcher's up/down checks current.
pub struct HostStateListener {
    cluster: Arc<ClusterState>,
    inner: Option<Arc<dyn PoolListener>>,
}

impl HostStateListener {
    pub fn new(cluster: Arc<ClusterState>) -> Self {
        Self {
            cluster,
            inner: None,
        }
    }

    pub fn with_inner(cluster: Arc<ClusterState>, inner: Arc<dyn PoolListener>) -> Self {
        Self {
            cluster,
            inner: Some(inner),
        }
    }

    fn set_host_state(&self, address: SocketAddr, state: HostState) {
        if let Some(host) = self.cluster.host(&address) {
            host.set_state(state);
        }
    }
}

impl PoolListener for HostStateListener {
    fn on_pool_up(&self, address: SocketAddr) {
        self.set_host_state(address, HostState::Up);
        if let Some(inner) = &self.inner {
            inner.on_pool_up(address);
        }
    }

    fn on_pool_down(&self, address: SocketAddr) {
        self.set_host_state(address, HostState::Down);
        if let Some(inner) = &self.inner {
            inner.on_pool_down(address);
        }
    }

    fn on_pool_critical_error(&self, address: SocketAddr, error: ConnectionError) {
        self.set_host_state(address, HostState::Down);
        if let Some(inner) = &self.inner {
            inner.on_pool_critical_error(address, error);
        }
    }

    fn on_close(&self) {
        if let Some(inner) = &self.inner {
            inner.on_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_addresses_collapse_to_one_host() {
        let address: SocketAddr = "10.0.0.1:9042".parse().unwrap();
        let state = ClusterState::new([Host::new(address), Host::new(address)]);
        assert_eq!(state.hosts().len(), 1);
        assert!(state.host(&address).is_some());
    }

    #[test]
    fn host_state_transitions_through_listener() {
        let address: SocketAddr = "10.0.0.1:9042".parse().unwrap();
        let cluster = Arc::new(ClusterState::new([Host::new(address)]));
        let listener = HostStateListener::new(cluster.clone());

        assert_eq!(cluster.host(&address).unwrap().state(), HostState::Unknown);
        listener.on_pool_up(address);
        assert!(cluster.host(&address).unwrap().is_up());
        listener.on_pool_down(address);
        assert_eq!(cluster.host(&address).unwrap().state(), HostState::Down);
    }
}
