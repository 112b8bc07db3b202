//! Client façade: endpoint resolution plus the four call shapes.
//!
//! All call APIs are synchronous and run on the caller's thread; the
//! event loop does the I/O. Do not call them from inside the loop (i.e.
//! from an async task): they block.

use std::sync::Arc;

use crate::call::client::{start_call, CallSetup};
use crate::config::ClientConfig;
use crate::context::{CallOptions, CallShared};
use crate::descriptor::{CallPattern, MethodDescriptor};
use crate::directory::Directory;
use crate::endpoint::Endpoint;
use crate::error::{Result, TripleError};
use crate::registry::{Registry, ServiceKey};
use crate::runtime::Driver;
use crate::status::Status;
use crate::stream::{MessageSink, MessageSource};
use crate::transport::client::ConnectionPool;
use crate::url::{RpcUrl, UrlOptions};

enum Target {
    /// A fixed provider from a `tri://` reference.
    Direct(Endpoint),
    /// A registry-fed directory; every call selects afresh.
    Discovered(Directory),
}

/// A client for one referenced service.
pub struct Client {
    driver: Arc<Driver>,
    pool: Arc<ConnectionPool>,
    target: Target,
    config: ClientConfig,
}

impl Client {
    /// Connect to a direct `tri://host:port/service` reference using the
    /// process-wide event loop.
    pub fn connect(url: &str) -> Result<Client> {
        Client::connect_with(url, ClientConfig::default(), Driver::shared())
    }

    /// Connect to a direct reference with explicit configuration. URL
    /// options override the configuration.
    pub fn connect_with(url: &str, mut config: ClientConfig, driver: Arc<Driver>) -> Result<Client> {
        let url: RpcUrl = url.parse()?;
        if url.scheme() != "tri" {
            return Err(TripleError::InvalidArgument(format!(
                "expected a tri:// reference, got scheme {:?}",
                url.scheme()
            )));
        }
        let options = UrlOptions::from_url(&url)?;
        config.apply_url_options(&options);
        let (host, port) = url.host_port()?;
        let endpoint = Endpoint::new(host, port);
        let pool = ConnectionPool::new(config.clone());
        pool.start_sweeper(driver.handle());
        Ok(Client {
            driver,
            pool,
            target: Target::Direct(endpoint),
            config,
        })
    }

    /// Resolve providers through a registry subscription, selecting per
    /// call with the configured load-balance policy.
    pub fn with_registry(
        registry: Arc<dyn Registry>,
        key: ServiceKey,
        config: ClientConfig,
        driver: Arc<Driver>,
    ) -> Result<Client> {
        let directory = Directory::new(registry, key, config.grace_window)?;
        let pool = ConnectionPool::new(config.clone());
        pool.start_sweeper(driver.handle());
        // New endpoints get a connection before the first call lands on
        // them.
        let hook_pool = Arc::clone(&pool);
        let hook_handle = driver.handle().clone();
        directory.set_refresh_hook(Box::new(move |snapshot| {
            hook_pool.warm(&hook_handle, snapshot.endpoints.clone());
        }));
        // The initial snapshot arrived before the hook was in place.
        pool.warm(driver.handle(), directory.snapshot().endpoints.clone());
        Ok(Client {
            driver,
            pool,
            target: Target::Discovered(directory),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The directory backing this client, when registry-resolved.
    pub fn directory(&self) -> Option<&Directory> {
        match &self.target {
            Target::Discovered(directory) => Some(directory),
            Target::Direct(_) => None,
        }
    }

    fn select_endpoint(&self) -> Result<Endpoint> {
        match &self.target {
            Target::Direct(endpoint) => Ok(endpoint.clone()),
            Target::Discovered(directory) => directory.select(self.config.loadbalance),
        }
    }

    fn start<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        options: &CallOptions,
    ) -> Result<(MessageSink<Req>, MessageSource<Resp>, Arc<CallShared>)> {
        let endpoint = self.select_endpoint()?;
        let setup = CallSetup::new(method, endpoint, options, &self.config)?;
        start_call(
            &self.driver,
            Arc::clone(&self.pool),
            setup,
            method.request_codec().clone(),
            method.response_codec().clone(),
            &self.config,
        )
    }

    /// Unary call: exactly one request, exactly one response.
    pub fn unary<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp> {
        ensure_pattern(method, CallPattern::Unary)?;
        let (mut sink, source, _shared) = self.start(method, &options)?;
        sink.send(request)?;
        sink.close();
        recv_single(source)
    }

    /// Client-streaming call: the caller feeds requests, then trades the
    /// sink for the single response.
    pub fn client_streaming<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        options: CallOptions,
    ) -> Result<ClientStreamCall<Req, Resp>> {
        ensure_pattern(method, CallPattern::ClientStream)?;
        let (sink, source, _shared) = self.start(method, &options)?;
        Ok(ClientStreamCall { sink, source })
    }

    /// Server-streaming call: one request, then a lazy finite response
    /// iterator.
    pub fn server_streaming<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        request: &Req,
        options: CallOptions,
    ) -> Result<MessageSource<Resp>> {
        ensure_pattern(method, CallPattern::ServerStream)?;
        let (mut sink, source, _shared) = self.start(method, &options)?;
        sink.send(request)?;
        sink.close();
        Ok(source)
    }

    /// Bidirectional call: both halves stream and close independently.
    pub fn bidi_streaming<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        options: CallOptions,
    ) -> Result<(MessageSink<Req>, MessageSource<Resp>)> {
        ensure_pattern(method, CallPattern::BidiStream)?;
        let (sink, source, _shared) = self.start(method, &options)?;
        Ok((sink, source))
    }
}

fn ensure_pattern<Req, Resp>(
    method: &MethodDescriptor<Req, Resp>,
    expected: CallPattern,
) -> Result<()> {
    if method.pattern() != expected {
        return Err(TripleError::IllegalState(format!(
            "method {} is declared {:?}, not {:?}",
            method.path(),
            method.pattern(),
            expected
        )));
    }
    Ok(())
}

/// Drain a single-response inbound half: one message, then clean
/// trailers.
fn recv_single<Resp>(mut source: MessageSource<Resp>) -> Result<Resp> {
    let value = match source.next() {
        Some(Ok(value)) => value,
        Some(Err(err)) => return Err(err),
        None => {
            return Err(TripleError::Rpc(Status::internal(
                "call completed without a response message",
            )))
        }
    };
    match source.next() {
        None => Ok(value),
        Some(Err(err)) => Err(err),
        Some(Ok(_)) => Err(TripleError::Rpc(Status::internal(
            "more than one response message on a unary call",
        ))),
    }
}

/// In-flight client-streaming call.
pub struct ClientStreamCall<Req, Resp> {
    sink: MessageSink<Req>,
    source: MessageSource<Resp>,
}

impl<Req, Resp> ClientStreamCall<Req, Resp> {
    /// Feed one request, blocking while the outbound queue is full.
    pub fn send(&mut self, request: &Req) -> Result<()> {
        self.sink.send(request)
    }

    /// Half-close the request stream and wait for the response.
    pub fn close_and_recv(mut self) -> Result<Resp> {
        self.sink.close();
        recv_single(self.source)
    }

    /// Cancel the whole call. Idempotent.
    pub fn cancel(&self) {
        self.sink.cancel();
    }
}
