//! Client connections and the per-client connection pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use h2::client::SendRequest;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::{Result, TripleError};

/// One HTTP/2 session to one endpoint, owned by the event loop.
///
/// The session is created lazily on first use, kept alive with PING
/// frames, and marked closed when the connection task exits (GOAWAY,
/// socket error, or idle collection).
pub(crate) struct Connection {
    send: SendRequest<Bytes>,
    closed: CancellationToken,
    last_used: Mutex<Instant>,
}

impl Connection {
    /// Dial an endpoint and complete the HTTP/2 handshake. Runs on the
    /// event loop.
    pub(crate) async fn connect(addr: &str, config: &ClientConfig) -> Result<Arc<Connection>> {
        let socket = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                TripleError::Transport(format!(
                    "connect to {addr} timed out after {:?}",
                    config.connect_timeout
                ))
            })?
            .map_err(|e| TripleError::Transport(format!("connect to {addr} failed: {e}")))?;
        socket.set_nodelay(true).ok();

        let (send, mut session) = h2::client::Builder::new()
            .handshake::<_, Bytes>(socket)
            .await
            .map_err(|e| TripleError::Transport(format!("HTTP/2 handshake with {addr}: {e}")))?;
        debug!(%addr, "connection established");

        let closed = CancellationToken::new();
        let ping_pong = session.ping_pong();

        let task_closed = closed.clone();
        let task_addr = addr.to_string();
        tokio::spawn(async move {
            if let Err(err) = session.await {
                warn!(addr = %task_addr, %err, "connection lost");
            } else {
                debug!(addr = %task_addr, "connection closed");
            }
            task_closed.cancel();
        });

        if let (Some(mut ping_pong), Some(interval)) = (ping_pong, config.keepalive_interval) {
            let ping_closed = closed.clone();
            let ping_addr = addr.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = ping_closed.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(err) = ping_pong.ping(h2::Ping::opaque()).await {
                        debug!(addr = %ping_addr, %err, "keep-alive ping failed");
                        return;
                    }
                }
            });
        }

        Ok(Arc::new(Connection {
            send,
            closed,
            last_used: Mutex::new(Instant::now()),
        }))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A per-call handle onto the session, refreshed for stream capacity.
    pub(crate) async fn checkout(&self) -> Result<SendRequest<Bytes>> {
        *self.last_used.lock().expect("last_used poisoned") = Instant::now();
        let send = self.send.clone();
        send.ready().await.map_err(|e| {
            TripleError::Transport(format!("connection no longer accepts streams: {e}"))
        })
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().expect("last_used poisoned").elapsed()
    }
}

/// Cache of live connections keyed by `host:port`.
pub(crate) struct ConnectionPool {
    config: ClientConfig,
    conns: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionPool {
    pub(crate) fn new(config: ClientConfig) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool {
            config,
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Start the idle sweeper for this pool on the event loop. The
    /// sweeper holds only a weak handle so an abandoned pool shuts its
    /// connections down naturally.
    pub(crate) fn start_sweeper(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        let pool: Weak<ConnectionPool> = Arc::downgrade(self);
        handle.spawn(async move {
            let period = idle_timeout.min(Duration::from_secs(30)).max(Duration::from_millis(100));
            loop {
                tokio::time::sleep(period).await;
                let Some(pool) = pool.upgrade() else { return };
                pool.sweep(idle_timeout);
            }
        });
    }

    fn sweep(&self, idle_timeout: Duration) {
        let mut conns = self.conns.lock().expect("connection pool poisoned");
        conns.retain(|addr, conn| {
            if conn.is_closed() {
                debug!(%addr, "dropping closed connection");
                return false;
            }
            if conn.idle_for() > idle_timeout {
                debug!(%addr, "closing idle connection");
                return false;
            }
            true
        });
    }

    /// Fetch a ready session for the endpoint, dialing on first use and
    /// re-dialing once when the cached session has died.
    pub(crate) async fn checkout(&self, endpoint: &Endpoint) -> Result<SendRequest<Bytes>> {
        let addr = endpoint.addr();
        let cached = {
            let conns = self.conns.lock().expect("connection pool poisoned");
            conns.get(&addr).cloned()
        };
        if let Some(conn) = cached {
            if !conn.is_closed() {
                match conn.checkout().await {
                    Ok(send) => return Ok(send),
                    Err(err) => debug!(%addr, %err, "cached connection unusable, re-dialing"),
                }
            }
        }
        let conn = Connection::connect(&addr, &self.config).await?;
        let send = conn.checkout().await?;
        self.conns
            .lock()
            .expect("connection pool poisoned")
            .insert(addr, conn);
        Ok(send)
    }

    /// Eagerly dial endpoints that are not yet pooled. Failures are left
    /// for the next selection to observe.
    pub(crate) fn warm(self: &Arc<Self>, handle: &tokio::runtime::Handle, endpoints: Vec<Endpoint>) {
        for endpoint in endpoints {
            let pool = Arc::clone(self);
            handle.spawn(async move {
                let addr = endpoint.addr();
                let already = {
                    let conns = pool.conns.lock().expect("connection pool poisoned");
                    conns.get(&addr).map(|c| !c.is_closed()).unwrap_or(false)
                };
                if already {
                    return;
                }
                match Connection::connect(&addr, &pool.config).await {
                    Ok(conn) => {
                        pool.conns
                            .lock()
                            .expect("connection pool poisoned")
                            .insert(addr, conn);
                    }
                    Err(err) => debug!(%addr, %err, "eager dial failed"),
                }
            });
        }
    }
}
