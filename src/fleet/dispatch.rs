//! Concurrent fan-out of one command across a host set.
//!
//! Every host runs on its own task. A host's dial or execution failure is
//! captured in that host's [`ExecutionResult`]; it never aborts the batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use super::error::FleetError;
use super::pool::SessionPool;
use super::types::{ExecutionResult, HostDescriptor};

/// Runs commands against hosts through a shared [`SessionPool`].
pub struct Dispatcher {
    pool: Arc<SessionPool>,
    limiter: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            limiter: None,
        }
    }

    /// Cap the number of hosts worked on at once. `None` or zero means one
    /// task per host with no cap.
    pub fn with_max_concurrency(mut self, max: Option<usize>) -> Self {
        self.limiter = max.filter(|n| *n > 0).map(|n| Arc::new(Semaphore::new(n)));
        self
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Execute `command` on every host and wait for all of them.
    ///
    /// The returned map has exactly one entry per distinct host address.
    pub async fn run(
        &self,
        hosts: &[HostDescriptor],
        command: &str,
        timeout: Duration,
    ) -> Result<HashMap<String, ExecutionResult>, FleetError> {
        if hosts.is_empty() {
            return Err(FleetError::EmptyHostSet);
        }

        info!("Dispatching to {} host(s): {}", hosts.len(), command);
        let started = Instant::now();
        let results = Arc::new(Mutex::new(HashMap::with_capacity(hosts.len())));

        let tasks: Vec<_> = hosts
            .iter()
            .cloned()
            .map(|host| {
                let pool = self.pool.clone();
                let limiter = self.limiter.clone();
                let results = results.clone();
                let command = command.to_string();
                let address = host.address.clone();

                let handle = tokio::spawn(async move {
                    let _permit = match limiter {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    let result = run_one(&pool, &host, &command, timeout).await;
                    results.lock().await.insert(host.address.clone(), result);
                });
                (address, handle)
            })
            .collect();

        let (addresses, handles): (Vec<String>, Vec<_>) = tasks.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut results = results.lock().await;
        for (address, outcome) in addresses.into_iter().zip(joined) {
            if let Err(e) = outcome {
                results.entry(address.clone()).or_insert_with(|| {
                    ExecutionResult::failed(
                        address,
                        FleetError::Channel(format!("worker task failed: {}", e)),
                        Duration::ZERO,
                    )
                });
            }
        }

        let failed = results.values().filter(|r| !r.success).count();
        info!(
            "Dispatch finished in {:?}: {} ok, {} failed",
            started.elapsed(),
            results.len() - failed,
            failed
        );

        Ok(std::mem::take(&mut *results))
    }
}

async fn run_one(
    pool: &SessionPool,
    host: &HostDescriptor,
    command: &str,
    timeout: Duration,
) -> ExecutionResult {
    let started = Instant::now();

    let shell = match pool.acquire(host).await {
        Ok(shell) => shell,
        Err(e) => {
            debug!("{} unavailable: {}", host.address, e);
            return ExecutionResult::failed(&host.address, e, started.elapsed());
        }
    };

    let mut shell = shell.lock().await;
    match shell.execute(command, timeout).await {
        Ok(output) => ExecutionResult::ok(&host.address, output, started.elapsed()),
        Err(e) => ExecutionResult::failed(&host.address, e, started.elapsed()),
    }
}
