//! I/O engine of a client: runtime, connection pool, buffered service stack
//! and the idle sweeper.

use crate::builder::build_service;
use crate::client::BufferedService;
use crate::config::ClientConfig;
use crate::error::HttpError;
use crate::pool::{ConnectionPool, PoolStats};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tower::buffer::Buffer;

/// Interval between idle connection sweeps
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Requests queued in front of the service stack
const BUFFER_CAPACITY: usize = 1024;

const MAX_IO_THREADS: usize = 4;

pub(crate) struct Engine {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    service: BufferedService,
    pool: Arc<ConnectionPool>,
    sweeper: JoinHandle<()>,
}

impl Engine {
    /// # Errors
    /// `Config` when the runtime cannot start or the stack cannot be built.
    pub(crate) fn start(config: &ClientConfig, tls: Arc<rustls::ClientConfig>) -> Result<Self, HttpError> {
        let threads = std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .min(MAX_IO_THREADS);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("hydra-io")
            .enable_all()
            .build()
            .map_err(|e| HttpError::Config(format!("failed to start the I/O runtime: {e}")))?;
        let handle = runtime.handle().clone();

        let pool = Arc::new(ConnectionPool::new(
            config.pool_max,
            config.max_per_route(),
            config.stale_check,
        ));
        let service = build_service(config, Arc::clone(&pool), tls)?;

        let (service, worker) = Buffer::pair(service, BUFFER_CAPACITY);
        handle.spawn(worker);

        let sweeper = handle.spawn({
            let pool = Arc::clone(&pool);
            async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    pool.sweep();
                }
            }
        });

        tracing::debug!(
            io_threads = threads,
            pool_max = config.pool_max,
            pool_max_per_route = config.max_per_route(),
            "client engine started"
        );
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            service,
            pool,
            sweeper,
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn service(&self) -> BufferedService {
        self.service.clone()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop the sweeper, drop pooled connections and shut the runtime down
    pub(crate) fn shutdown(&self) {
        self.sweeper.abort();
        self.pool.close();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            tracing::debug!("client engine stopped");
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
