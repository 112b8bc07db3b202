use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::deadline::Deadline;
use crate::error::TripleError;
use crate::status::Status;

/// Write-once slot for the terminal status of a call.
///
/// The first write wins; later writes are ignored, which makes the
/// observed status monotonic no matter how many failure paths race.
#[derive(Debug, Default)]
pub(crate) struct StatusCell(OnceLock<Status>);

impl StatusCell {
    pub(crate) fn new() -> StatusCell {
        StatusCell(OnceLock::new())
    }

    /// Returns true when this call installed the status.
    pub(crate) fn set(&self, status: Status) -> bool {
        self.0.set(status).is_ok()
    }

    pub(crate) fn get(&self) -> Option<&Status> {
        self.0.get()
    }
}

/// Idempotent cancellation signal observable from both the event loop
/// (async) and plain caller threads (blocking).
#[derive(Debug, Clone)]
pub struct Cancellation {
    token: CancellationToken,
    sync: Arc<(Mutex<bool>, Condvar)>,
}

impl Cancellation {
    pub(crate) fn new() -> Cancellation {
        Cancellation {
            token: CancellationToken::new(),
            sync: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Fire the signal. Safe to call any number of times.
    pub fn cancel(&self) {
        let (flag, condvar) = &*self.sync;
        {
            let mut fired = flag.lock().expect("cancellation mutex poisoned");
            *fired = true;
        }
        condvar.notify_all();
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Loop-task suspension point; resolves once cancelled.
    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Block the calling thread until the signal fires.
    pub fn wait(&self) {
        let (flag, condvar) = &*self.sync;
        let mut fired = flag.lock().expect("cancellation mutex poisoned");
        while !*fired {
            fired = condvar.wait(fired).expect("cancellation mutex poisoned");
        }
    }

    /// Block until the signal fires or the timeout elapses. Returns
    /// whether the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.sync;
        let mut fired = flag.lock().expect("cancellation mutex poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !*fired {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, result) = condvar
                .wait_timeout(fired, remaining)
                .expect("cancellation mutex poisoned");
            fired = guard;
            if result.timed_out() && !*fired {
                return false;
            }
        }
        true
    }
}

/// State shared between the caller-facing stream halves and the loop
/// tasks driving one call.
#[derive(Debug)]
pub(crate) struct CallShared {
    pub(crate) status: StatusCell,
    pub(crate) cancel: Cancellation,
    /// Set together with the status when the failure must reset the
    /// HTTP/2 stream; `None` means the failure is carried in trailers
    /// (server) or needs no reset at all.
    pub(crate) reset_reason: Mutex<Option<h2::Reason>>,
    /// Fires when the call has fully terminated, resetting watchers.
    pub(crate) finished: CancellationToken,
    /// The inbound direction ended cleanly (half-close), possibly before
    /// any terminal status exists. Distinguishes a normal end of the
    /// request stream from a torn-down call.
    inbound_done: AtomicBool,
    pub(crate) response_headers: Mutex<Option<HeaderMap>>,
    pub(crate) response_trailers: Mutex<Option<HeaderMap>>,
}

impl CallShared {
    pub(crate) fn new() -> Arc<CallShared> {
        Arc::new(CallShared {
            status: StatusCell::new(),
            cancel: Cancellation::new(),
            reset_reason: Mutex::new(None),
            finished: CancellationToken::new(),
            inbound_done: AtomicBool::new(false),
            response_headers: Mutex::new(None),
            response_trailers: Mutex::new(None),
        })
    }

    pub(crate) fn mark_inbound_done(&self) {
        self.inbound_done.store(true, Ordering::Release);
    }

    pub(crate) fn inbound_done(&self) -> bool {
        self.inbound_done.load(Ordering::Acquire)
    }

    /// Drive the call to a terminal state. The first failure wins both
    /// the status slot and the reset decision; every path converges on
    /// the cancellation token to unblock producer and consumer.
    pub(crate) fn fail(&self, status: Status, reset: Option<h2::Reason>) {
        if self.status.set(status) {
            *self.reset_reason.lock().expect("reset slot poisoned") = reset;
        }
        self.cancel.cancel();
    }

    /// Record a terminal status without waking anyone; used for the
    /// normal completion path where the queues drain naturally.
    pub(crate) fn complete(&self, status: Status) {
        self.status.set(status);
    }

    pub(crate) fn finish(&self) {
        self.finished.cancel();
    }

    pub(crate) fn reset_reason(&self) -> Option<h2::Reason> {
        *self.reset_reason.lock().expect("reset slot poisoned")
    }

    /// The error a blocked producer or consumer observes once the call
    /// is dead.
    pub(crate) fn terminal_error(&self) -> TripleError {
        match self.status.get() {
            Some(status) if status.is_ok() => {
                TripleError::IllegalState("stream already completed".into())
            }
            Some(status) => TripleError::from(status.clone()),
            None => TripleError::Transport("stream terminated without a status".into()),
        }
    }

    pub(crate) fn store_response_headers(&self, headers: HeaderMap) {
        *self.response_headers.lock().expect("headers slot poisoned") = Some(headers);
    }

    pub(crate) fn store_response_trailers(&self, trailers: HeaderMap) {
        *self
            .response_trailers
            .lock()
            .expect("trailers slot poisoned") = Some(trailers);
    }
}

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the client-wide default timeout.
    pub timeout: Option<Duration>,
    /// Additional ASCII request metadata, sent as HTTP/2 headers.
    pub metadata: Vec<(String, String)>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> CallOptions {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> CallOptions {
        self.metadata.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug)]
struct ServerContextInner {
    shared: Arc<CallShared>,
    metadata: HeaderMap,
    deadline: Option<Deadline>,
    peer: Option<SocketAddr>,
}

/// Handler-facing view of one inbound call.
///
/// The polling flag and the blocking waits are the handler's only
/// legitimate early-out mechanism; a cancelled handler should stop
/// producing and return.
#[derive(Debug, Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

impl ServerContext {
    pub(crate) fn new(
        shared: Arc<CallShared>,
        metadata: HeaderMap,
        deadline: Option<Deadline>,
        peer: Option<SocketAddr>,
    ) -> ServerContext {
        ServerContext {
            inner: Arc::new(ServerContextInner {
                shared,
                metadata,
                deadline,
                peer,
            }),
        }
    }

    /// Request metadata as received (pseudo-headers excluded).
    pub fn request_metadata(&self) -> &HeaderMap {
        &self.inner.metadata
    }

    /// Deadline negotiated through `grpc-timeout`, if any.
    pub fn deadline(&self) -> Option<Deadline> {
        self.inner.deadline
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.shared.cancel.is_cancelled()
    }

    /// Block until the call is cancelled (by the peer, a deadline, or a
    /// transport failure).
    pub fn wait_cancelled(&self) {
        self.inner.shared.cancel.wait()
    }

    /// Block until cancellation or the timeout; returns whether the call
    /// was cancelled.
    pub fn wait_cancelled_timeout(&self, timeout: Duration) -> bool {
        self.inner.shared.cancel.wait_timeout(timeout)
    }

    pub(crate) fn shared(&self) -> &Arc<CallShared> {
        &self.inner.shared
    }
}
