//! Server-side HTTP/2 transport: TCP accept loop and session driving.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::call::server::serve_stream;
use crate::config::ServerConfig;
use crate::router::Router;

/// Accept connections until shutdown fires. Each connection and each of
/// its streams becomes an independent loop task.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                socket.set_nodelay(true).ok();
                tokio::spawn(serve_connection(
                    socket,
                    peer,
                    Arc::clone(&router),
                    Arc::clone(&config),
                    shutdown.clone(),
                ));
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
    debug!("accept loop stopped");
}

/// Drive one HTTP/2 session: handshake, then accept streams until the
/// peer goes away or shutdown asks for a graceful GOAWAY.
async fn serve_connection(
    socket: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    let mut builder = h2::server::Builder::new();
    if let Some(max) = config.max_concurrent_streams {
        builder.max_concurrent_streams(max);
    }
    let mut session = match builder.handshake::<_, Bytes>(socket).await {
        Ok(session) => session,
        Err(err) => {
            debug!(%peer, %err, "HTTP/2 handshake failed");
            return;
        }
    };
    debug!(%peer, "connection accepted");

    let mut draining = false;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled(), if !draining => {
                session.graceful_shutdown();
                draining = true;
                continue;
            }
            accepted = session.accept() => accepted,
        };
        match accepted {
            Some(Ok((request, respond))) => {
                tokio::spawn(serve_stream(
                    request,
                    respond,
                    Arc::clone(&router),
                    Arc::clone(&config),
                    Some(peer),
                ));
            }
            Some(Err(err)) => {
                if err.is_io() || err.reason().is_some() {
                    debug!(%peer, %err, "connection terminated");
                } else {
                    warn!(%peer, %err, "connection error");
                }
                break;
            }
            None => {
                debug!(%peer, "connection closed");
                break;
            }
        }
    }
    // No new streams, but in-flight ones still need the session polled.
    let _ = std::future::poll_fn(|cx| session.poll_closed(cx)).await;
}
