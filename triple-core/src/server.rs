//! Server façade: handler registration, serving, and provider
//! registration in a registry.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::descriptor::MethodDescriptor;
use crate::endpoint::Endpoint;
use crate::error::{Result, TripleError};
use crate::registry::{Lease, Registry, ServiceKey};
use crate::router::Router;
use crate::runtime::Driver;
use crate::status::Status;
use crate::stream::{MessageSink, MessageSource};
use crate::transport::server::accept_loop;

/// Builder collecting handlers before the server binds.
pub struct ServerBuilder {
    router: Router,
    config: ServerConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder::new()
    }
}

impl ServerBuilder {
    pub fn new() -> ServerBuilder {
        ServerBuilder {
            router: Router::new(),
            config: ServerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> ServerBuilder {
        self.config = config;
        self
    }

    /// Register a unary handler.
    pub fn unary<Req, Resp, F>(mut self, method: &MethodDescriptor<Req, Resp>, f: F) -> Self
    where
        F: Fn(&ServerContext, Req) -> std::result::Result<Resp, Status> + Send + Sync + 'static,
        Req: 'static,
        Resp: 'static,
    {
        self.router.add_unary(method, f);
        self
    }

    /// Register a client-streaming handler.
    pub fn client_streaming<Req, Resp, F>(
        mut self,
        method: &MethodDescriptor<Req, Resp>,
        f: F,
    ) -> Self
    where
        F: Fn(&ServerContext, MessageSource<Req>) -> std::result::Result<Resp, Status>
            + Send
            + Sync
            + 'static,
        Req: 'static,
        Resp: 'static,
    {
        self.router.add_client_stream(method, f);
        self
    }

    /// Register a server-streaming handler.
    pub fn server_streaming<Req, Resp, F>(
        mut self,
        method: &MethodDescriptor<Req, Resp>,
        f: F,
    ) -> Self
    where
        F: Fn(&ServerContext, Req, &mut MessageSink<Resp>) -> std::result::Result<(), Status>
            + Send
            + Sync
            + 'static,
        Req: 'static,
        Resp: 'static,
    {
        self.router.add_server_stream(method, f);
        self
    }

    /// Register a bidirectional-streaming handler.
    pub fn bidi_streaming<Req, Resp, F>(
        mut self,
        method: &MethodDescriptor<Req, Resp>,
        f: F,
    ) -> Self
    where
        F: Fn(
                &ServerContext,
                MessageSource<Req>,
                &mut MessageSink<Resp>,
            ) -> std::result::Result<(), Status>
            + Send
            + Sync
            + 'static,
        Req: 'static,
        Resp: 'static,
    {
        self.router.add_bidi_stream(method, f);
        self
    }

    /// Bind and serve on a dedicated event loop sized from the
    /// configured handler-thread count.
    pub fn serve(self, addr: &str) -> Result<Server> {
        let driver = Driver::new(self.config.handler_threads)?;
        self.serve_on(addr, driver)
    }

    /// Bind and serve on an existing event loop. Handlers run on that
    /// loop's blocking pool.
    pub fn serve_on(self, addr: &str, driver: Arc<Driver>) -> Result<Server> {
        let bind_addr = addr.to_string();
        let listener = driver.run(async move {
            tokio::net::TcpListener::bind(&bind_addr).await
        })??;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        driver.spawn(accept_loop(
            listener,
            Arc::new(self.router),
            Arc::new(self.config),
            shutdown.clone(),
        ));
        debug!(%local_addr, "server started");
        Ok(Server {
            local_addr,
            shutdown,
            driver,
            leases: Mutex::new(Vec::new()),
        })
    }
}

/// A running server. Dropping it shuts the listener down and releases
/// every registry lease.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    #[allow(dead_code)]
    driver: Arc<Driver>,
    leases: Mutex<Vec<(Arc<dyn Registry>, Lease)>>,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This server's address as a provider endpoint.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr.ip().to_string(), self.local_addr.port())
    }

    /// Announce this server under a service key. The lease is released
    /// on shutdown.
    pub fn register(&self, registry: Arc<dyn Registry>, key: &ServiceKey) -> Result<()> {
        let lease = registry.register(key, &self.endpoint())?;
        self.leases
            .lock()
            .map_err(|_| TripleError::IllegalState("lease table poisoned".into()))?
            .push((registry, lease));
        Ok(())
    }

    /// Stop accepting connections, release registry leases, and send
    /// GOAWAY on open sessions. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut leases) = self.leases.lock() {
            for (registry, lease) in leases.drain(..) {
                if let Err(err) = registry.unregister(lease) {
                    warn!(%err, "failed to release registry lease");
                }
            }
        }
        self.shutdown.cancel();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
