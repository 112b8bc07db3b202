//! The network event loop.
//!
//! All sockets and HTTP/2 session state live on one dedicated thread
//! running a current-thread tokio runtime. Caller threads never touch the
//! loop directly: they enqueue work with [`Driver::run`] and exchange
//! messages through bounded queues. User server handlers execute on the
//! runtime's blocking pool, sized to the configured handler-thread count,
//! so a slow handler cannot stall the loop.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use tokio::runtime;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, TripleError};

/// Handle to the event-loop thread.
pub struct Driver {
    handle: runtime::Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Driver {
    /// Spawn an event loop whose blocking pool is capped at
    /// `handler_threads`.
    pub fn new(handler_threads: usize) -> Result<Arc<Driver>> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name("triple-driver".into())
            .spawn(move || {
                let rt = match runtime::Builder::new_current_thread()
                    .enable_all()
                    .max_blocking_threads(handler_threads.max(1))
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = handle_tx.send(Err(err));
                        return;
                    }
                };
                if handle_tx.send(Ok(rt.handle().clone())).is_err() {
                    return;
                }
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("event loop shut down");
            })
            .map_err(|e| TripleError::Transport(format!("failed to spawn event loop: {e}")))?;
        let handle = handle_rx
            .recv()
            .map_err(|_| TripleError::Transport("event loop thread died during startup".into()))?
            .map_err(|e| TripleError::Transport(format!("failed to build event loop: {e}")))?;
        Ok(Arc::new(Driver {
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// The process-wide default loop, created on first use with a handler
    /// pool of one thread per CPU.
    ///
    /// # Panics
    ///
    /// Panics if the loop thread cannot be spawned.
    pub fn shared() -> Arc<Driver> {
        static SHARED: OnceLock<Arc<Driver>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| {
            Driver::new(num_cpus::get()).expect("failed to start the shared event loop")
        }))
    }

    pub(crate) fn handle(&self) -> &runtime::Handle {
        &self.handle
    }

    /// Spawn a task onto the loop without waiting for it.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Run a future on the loop and block the calling thread on its
    /// result. Must not be called from the loop itself.
    pub(crate) fn run<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.blocking_recv()
            .map_err(|_| TripleError::Transport("event loop terminated".into()))
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.lock().expect("shutdown slot poisoned").take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.lock().expect("thread slot poisoned").take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Driver")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_executes_on_the_loop_thread() {
        let driver = Driver::new(2).unwrap();
        let name = driver
            .run(async { thread::current().name().map(str::to_string) })
            .unwrap();
        assert_eq!(name.as_deref(), Some("triple-driver"));
    }

    #[test]
    fn run_supports_io_and_timers() {
        let driver = Driver::new(2).unwrap();
        let elapsed = driver
            .run(async {
                let start = std::time::Instant::now();
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                start.elapsed()
            })
            .unwrap();
        assert!(elapsed >= std::time::Duration::from_millis(10));
    }

    #[test]
    fn dropping_the_driver_stops_the_loop() {
        let driver = Driver::new(1).unwrap();
        drop(driver);
    }
}
