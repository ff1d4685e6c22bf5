//! Port -> dispatcher registry.
//!
//! The registry owns one [`PortDispatcher`] per configured port. Each
//! dispatcher runs an accept loop per [`Transport`] and holds the port's
//! swappable [`Group`]. Reload goes through [`Registry::apply`], which
//! reconciles ports, or [`Registry::replace_group`] for a single port.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::group::{Group, SharedGroup};
use crate::proxy::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
use crate::resolver::Resolver;

/// Transports a port is served on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
}

impl Transport {
    /// Every transport started for a port.
    pub const ALL: [Transport; 1] = [Transport::Tcp];

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
        }
    }
}

/// Errors from applying a configuration to the registry.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A new port could not be bound. Other ports were still applied.
    #[error("failed to bind {transport} port {port}: {source}")]
    Bind {
        port: u16,
        transport: &'static str,
        #[source]
        source: io::Error,
    },

    /// `replace_group` for a port that is not being served.
    #[error("port {port} is not served")]
    UnknownPort { port: u16 },
}

struct TransportTask {
    transport: Transport,
    local_addr: SocketAddr,
    stats: Arc<ListenerStats>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// The running transports of one port and its current group.
pub struct PortDispatcher {
    port: u16,
    group: SharedGroup,
    tasks: Vec<TransportTask>,
}

impl PortDispatcher {
    /// Bind every transport for `group` and start accepting.
    pub fn start(
        group: Group,
        resolver: Arc<Resolver>,
        bind_ip: Option<IpAddr>,
        max_connections: usize,
    ) -> Result<Self, ApplyError> {
        let port = group.port();
        let fast_open = group.options().listener_fast_open;
        let group = group.into_shared();
        let mut tasks = Vec::with_capacity(Transport::ALL.len());

        for transport in Transport::ALL {
            let task = match transport {
                Transport::Tcp => {
                    let config = ListenerConfig {
                        bind_ip,
                        port,
                        max_connections,
                        fast_open,
                    };
                    Listener::bind(config, Arc::clone(&group), Arc::clone(&resolver))
                        .and_then(spawn_tcp)
                }
            };

            match task {
                Ok(task) => tasks.push(task),
                Err(source) => {
                    // Leave nothing half-started
                    for task in tasks {
                        let _ = task.shutdown.send(());
                    }
                    return Err(ApplyError::Bind {
                        port,
                        transport: transport.name(),
                        source,
                    });
                }
            }
        }

        Ok(Self { port, group, tasks })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Swap in a new group. Connections already running keep the old one.
    pub fn replace_group(&self, group: Group) {
        let old = self.group.load();
        if old.options().listener_fast_open != group.options().listener_fast_open {
            warn!(
                port = self.port,
                "listenerTCPFastOpen changes take effect when the port is rebound"
            );
        }
        self.group.store(Arc::new(group));
        info!(port = self.port, "Group replaced");
    }

    /// Snapshot of the current group.
    pub fn group(&self) -> Arc<Group> {
        self.group.load_full()
    }

    pub fn local_addr(&self, transport: Transport) -> Option<SocketAddr> {
        self.task(transport).map(|task| task.local_addr)
    }

    pub fn stats(&self, transport: Transport) -> Option<Arc<ListenerStats>> {
        self.task(transport).map(|task| Arc::clone(&task.stats))
    }

    fn task(&self, transport: Transport) -> Option<&TransportTask> {
        self.tasks.iter().find(|task| task.transport == transport)
    }

    /// Stop accepting and wait for the accept loops to exit.
    pub async fn shutdown(self) {
        for task in self.tasks {
            let _ = task.shutdown.send(());
            if let Err(e) = task.handle.await {
                error!(
                    port = self.port,
                    transport = task.transport.name(),
                    error = %e,
                    "Accept loop panicked"
                );
            }
        }
        info!(port = self.port, "Port closed");
    }
}

fn spawn_tcp(listener: Listener) -> io::Result<TransportTask> {
    let local_addr = listener.local_addr()?;
    let stats = listener.stats();
    let (shutdown, shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        if let Err(e) = listener.run(shutdown_rx).await {
            error!(bind_addr = %local_addr, error = %e, "Listener error");
        }
    });

    Ok(TransportTask {
        transport: Transport::Tcp,
        local_addr,
        stats,
        shutdown,
        handle,
    })
}

/// All running port dispatchers.
///
/// Owned by whoever runs the process; nothing here is global, so tests can
/// run several registries side by side.
pub struct Registry {
    dispatchers: Mutex<HashMap<u16, PortDispatcher>>,
    resolver: Arc<Resolver>,
    bind_ip: Option<IpAddr>,
    max_connections: usize,
}

impl Registry {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            dispatchers: Mutex::new(HashMap::new()),
            resolver,
            bind_ip: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Bind listeners to this address instead of all interfaces.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    /// Cap concurrent connections on every port; extra clients are dropped.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Reconcile running ports with `groups`.
    ///
    /// Ports no longer present are closed, existing ports get the new group,
    /// new ports are bound. A port that fails to bind is logged and skipped;
    /// the first such failure is returned after every other port is applied.
    pub async fn apply(&self, groups: Vec<Group>) -> Result<(), ApplyError> {
        let mut dispatchers = self.dispatchers.lock().await;

        let wanted: Vec<u16> = groups.iter().map(Group::port).collect();
        let removed: Vec<u16> = dispatchers
            .keys()
            .copied()
            .filter(|port| !wanted.contains(port))
            .collect();
        for port in removed {
            if let Some(dispatcher) = dispatchers.remove(&port) {
                dispatcher.shutdown().await;
            }
        }

        let mut first_error = None;
        for group in groups {
            let port = group.port();
            if let Some(dispatcher) = dispatchers.get(&port) {
                dispatcher.replace_group(group);
                continue;
            }

            let name = group.name().to_string();
            let identities = group.identities().len();
            match PortDispatcher::start(
                group,
                Arc::clone(&self.resolver),
                self.bind_ip,
                self.max_connections,
            ) {
                Ok(dispatcher) => {
                    info!(port, group = %name, identities, "Port started");
                    dispatchers.insert(port, dispatcher);
                }
                Err(e) => {
                    error!(port, group = %name, error = %e, "Failed to start port");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Atomically swap the group served on `group.port()`.
    pub async fn replace_group(&self, group: Group) -> Result<(), ApplyError> {
        let dispatchers = self.dispatchers.lock().await;
        let port = group.port();
        let dispatcher = dispatchers
            .get(&port)
            .ok_or(ApplyError::UnknownPort { port })?;
        dispatcher.replace_group(group);
        Ok(())
    }

    /// Current group snapshot for a port.
    pub async fn group(&self, port: u16) -> Option<Arc<Group>> {
        self.dispatchers.lock().await.get(&port).map(PortDispatcher::group)
    }

    /// Bound TCP address for a port.
    pub async fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.dispatchers
            .lock()
            .await
            .get(&port)
            .and_then(|dispatcher| dispatcher.local_addr(Transport::Tcp))
    }

    pub async fn stats(&self, port: u16) -> Option<Arc<ListenerStats>> {
        self.dispatchers
            .lock()
            .await
            .get(&port)
            .and_then(|dispatcher| dispatcher.stats(Transport::Tcp))
    }

    /// Served ports, ascending.
    pub async fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.dispatchers.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Close every port.
    pub async fn shutdown(&self) {
        let drained: Vec<PortDispatcher> = self
            .dispatchers
            .lock()
            .await
            .drain()
            .map(|(_, dispatcher)| dispatcher)
            .collect();
        for dispatcher in drained {
            dispatcher.shutdown().await;
        }
    }
}
