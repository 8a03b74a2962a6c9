//! Supervised background tasks: dispatcher workers plus the retry
//! scheduler.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
    scheduler::RetryScheduler,
};

/// Owns the engine's background tasks and their shutdown.
pub(crate) struct WorkerPool {
    dispatcher: Dispatcher,
    scheduler: RetryScheduler,
    worker_count: usize,
    cancellation_token: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WorkerPool {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        scheduler: RetryScheduler,
        worker_count: usize,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { dispatcher, scheduler, worker_count, cancellation_token, handles: Vec::new() }
    }

    /// Spawns `worker_count` dispatcher workers and one retry scheduler.
    pub(crate) fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning delivery workers");

        for worker_id in 0..self.worker_count {
            let dispatcher = self.dispatcher.clone();
            let token = self.cancellation_token.clone();
            let handle = tokio::spawn(async move { dispatcher.run(worker_id, token).await });
            self.handles.push((format!("dispatcher-{worker_id}"), handle));
        }

        let scheduler = self.scheduler.clone();
        let token = self.cancellation_token.clone();
        let handle = tokio::spawn(async move { scheduler.run(token).await });
        self.handles.push(("retry-scheduler".to_string(), handle));

        info!(spawned = self.handles.len(), "delivery workers spawned");
    }

    /// Number of tasks that have not finished.
    pub(crate) fn active_workers(&self) -> usize {
        self.handles.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Cancels every task and waits up to `timeout` for in-flight work.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            tasks = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.handles);

        let join_all = async {
            let mut panics = Vec::new();
            for (worker_id, (name, handle)) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(task = %name, error = %join_error, "worker task panicked");
                    panics.push(DeliveryError::WorkerPanic { worker_id, error: join_error.to_string() });
                }
            }
            panics
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(panics) => match panics.into_iter().next() {
                Some(panic) => Err(panic),
                None => {
                    info!("worker pool shutdown completed");
                    Ok(())
                },
            },
            Err(_) => {
                error!(timeout_seconds = timeout.as_secs(), "worker shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.active_workers();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(active_workers = active, "worker pool dropped without shutdown, cancelling tasks");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::{NoOpEventHandler, TestClock};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        client::DeliveryClient, engine::DeliveryConfig, executor::DeliveryExecutor,
        storage::mock::MockDeliveryStorage,
    };

    fn pool(worker_count: usize) -> WorkerPool {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock = Arc::new(TestClock::new());
        let handler = Arc::new(NoOpEventHandler::new());
        let config = DeliveryConfig {
            worker_count,
            poll_interval: Duration::from_millis(10),
            retry_poll_interval: Duration::from_millis(10),
            ..DeliveryConfig::default()
        };
        let client = Arc::new(DeliveryClient::new(config.client_config.clone()).unwrap());
        let executor = DeliveryExecutor::new(storage.clone(), client, clock.clone(), handler.clone());
        let slots = Arc::new(Semaphore::new(config.max_concurrent_deliveries));
        let dispatcher = Dispatcher::new(
            storage.clone(),
            executor.clone(),
            clock.clone(),
            handler,
            slots.clone(),
            &config,
        );
        let scheduler = RetryScheduler::new(storage, executor, clock, slots, &config);
        WorkerPool::new(dispatcher, scheduler, worker_count, CancellationToken::new())
    }

    #[tokio::test]
    async fn spawns_dispatchers_and_scheduler() {
        let mut pool = pool(4);
        pool.spawn_workers();

        assert_eq!(pool.handles.len(), 5);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.active_workers(), 5);

        pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_workers_is_immediate() {
        let pool = pool(2);
        assert!(pool.shutdown_graceful(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn drop_cancels_running_workers() {
        let mut pool = pool(1);
        pool.spawn_workers();
        let token = pool.cancellation_token.clone();

        drop(pool);

        assert!(token.is_cancelled());
    }
}
