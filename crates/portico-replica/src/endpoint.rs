//! One proxy endpoint per replica set member: a local listener whose clients
//! are forwarded byte-for-byte to the real member address.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::config::ReplicaSetConfig;
use crate::error::{ReplicaError, Result};
use crate::ports;
use portico_metrics::Stats;

const FORWARD_BUFFER_SIZE: usize = 16 * 1024;

/// The slice of configuration a proxy endpoint needs.
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub client_idle_timeout: std::time::Duration,
    pub message_timeout: std::time::Duration,
    pub max_per_client_connections: usize,
}

impl From<&ReplicaSetConfig> for ProxyServerConfig {
    fn from(config: &ReplicaSetConfig) -> Self {
        Self {
            client_idle_timeout: config.client_idle_timeout,
            message_timeout: config.message_timeout,
            max_per_client_connections: config.max_per_client_connections,
        }
    }
}

/// Read-only surroundings injected into every endpoint at construction. The
/// coordinator owns the endpoints; endpoints never point back at it.
#[derive(Debug)]
pub struct ProxyContext {
    pub stats: Arc<Stats>,
    pub config: ProxyServerConfig,
}

enum Phase {
    Created(std::net::TcpListener),
    Started,
    Stopped,
}

struct EndpointInner {
    phase: Phase,
    acceptor: Option<JoinHandle<()>>,
    conns: Arc<Mutex<JoinSet<()>>>,
}

/// A `(listener, real member address)` pair with a created -> started ->
/// stopped lifecycle. A stopped endpoint is discarded, never restarted.
pub struct ProxyEndpoint {
    real_addr: String,
    proxy_addr: String,
    context: Arc<ProxyContext>,
    shutdown_tx: watch::Sender<bool>,
    inner: Mutex<EndpointInner>,
}

impl ProxyEndpoint {
    pub fn new(
        real_addr: String,
        listener: std::net::TcpListener,
        context: Arc<ProxyContext>,
    ) -> Result<Self> {
        let proxy_addr = ports::proxy_addr(&listener)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            real_addr,
            proxy_addr,
            context,
            shutdown_tx,
            inner: Mutex::new(EndpointInner {
                phase: Phase::Created(listener),
                acceptor: None,
                conns: Arc::new(Mutex::new(JoinSet::new())),
            }),
        })
    }

    pub fn real_addr(&self) -> &str {
        &self.real_addr
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    /// Spawns the acceptor task. Valid exactly once, on a created endpoint.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let listener = match std::mem::replace(&mut inner.phase, Phase::Started) {
            Phase::Created(listener) => listener,
            Phase::Started => {
                return Err(ReplicaError::ProxyStartFailed(self.real_addr.clone()));
            }
            Phase::Stopped => {
                inner.phase = Phase::Stopped;
                return Err(ReplicaError::ProxyStartFailed(self.real_addr.clone()));
            }
        };
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                inner.phase = Phase::Stopped;
                return Err(err.into());
            }
        };

        let shutdown_rx = self.shutdown_tx.subscribe();
        let conns = inner.conns.clone();
        let real_addr = self.real_addr.clone();
        let proxy_addr = self.proxy_addr.clone();
        let context = self.context.clone();
        inner.acceptor = Some(tokio::spawn(async move {
            accept_loop(listener, shutdown_rx, conns, real_addr, proxy_addr, context).await;
        }));
        Ok(())
    }

    /// Shuts the endpoint down. `hard` drops in-flight client connections;
    /// otherwise they are allowed to drain. Idempotent once stopped.
    pub async fn stop(&self, hard: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match std::mem::replace(&mut inner.phase, Phase::Stopped) {
            // never started: just release the listener
            Phase::Created(_) | Phase::Stopped => Ok(()),
            Phase::Started => {
                let _ = self.shutdown_tx.send(true);
                if let Some(acceptor) = inner.acceptor.take() {
                    if acceptor.await.is_err() {
                        return Err(ReplicaError::ProxyStopFailed(self.real_addr.clone()));
                    }
                }
                let mut conns = inner.conns.lock().await;
                if hard {
                    conns.abort_all();
                }
                while conns.join_next().await.is_some() {}
                Ok(())
            }
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy {} => mongo {}", self.proxy_addr, self.real_addr)
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("real_addr", &self.real_addr)
            .field("proxy_addr", &self.proxy_addr)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    conns: Arc<Mutex<JoinSet<()>>>,
    real_addr: String,
    proxy_addr: String,
    context: Arc<ProxyContext>,
) {
    debug!(%proxy_addr, %real_addr, "accepting clients");
    let client_counts: Arc<StdMutex<HashMap<IpAddr, usize>>> =
        Arc::new(StdMutex::new(HashMap::new()));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (client, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%proxy_addr, error = %err, "accept failed");
                        continue;
                    }
                };

                let cap = context.config.max_per_client_connections;
                if cap > 0 {
                    let mut counts = client_counts.lock().unwrap();
                    let count = counts.entry(peer.ip()).or_insert(0);
                    if *count >= cap {
                        warn!(%proxy_addr, client = %peer, "rejecting client, connection limit reached");
                        continue;
                    }
                    *count += 1;
                }

                context.stats.bump_sum("clients_connected", 1);
                let real_addr = real_addr.clone();
                let context = context.clone();
                let client_counts = client_counts.clone();
                let peer_ip = peer.ip();
                let mut set = conns.lock().await;
                // reap connections that already finished
                while set.try_join_next().is_some() {}
                set.spawn(async move {
                    forward_connection(client, &real_addr, &context).await;
                    let mut counts = client_counts.lock().unwrap();
                    if let Some(count) = counts.get_mut(&peer_ip) {
                        *count = count.saturating_sub(1);
                    }
                });
            }
        }
    }
    debug!(%proxy_addr, %real_addr, "acceptor shut down");
}

// Byte-level forwarding, one task per client connection. The connection
// lives until either side closes or the client sits idle past the timeout.
async fn forward_connection(client: TcpStream, real_addr: &str, context: &ProxyContext) {
    let upstream = match TcpStream::connect(real_addr).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%real_addr, error = %err, "failed to dial member");
            return;
        }
    };

    let idle = context.config.client_idle_timeout;
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_member = async move {
        let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];
        loop {
            let n = match tokio::time::timeout(idle, client_read.read(&mut buf)).await {
                // no request from the client within the idle window
                Err(_) => return true,
                Ok(Ok(0)) | Ok(Err(_)) => return false,
                Ok(Ok(n)) => n,
            };
            if upstream_write.write_all(&buf[..n]).await.is_err() {
                return false;
            }
        }
    };
    let member_to_client = async move {
        let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];
        loop {
            let n = match upstream_read.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if client_write.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    };

    tokio::select! {
        idled = client_to_member => {
            if idled {
                debug!(%real_addr, "disconnecting idle client");
            }
        }
        _ = member_to_client => {}
    }
}
