//! Keyed cache of remote shells.
//!
//! One [`RemoteShell`] per identity key (`address:port:user`). Acquisition
//! reuses a cached shell after a liveness probe and rebuilds it otherwise.
//!
//! # Locking
//!
//! - The `DashMap` shard lock covers structural changes (inserting a slot,
//!   clearing the map) and is never held across an await.
//! - Every key has its own slot mutex. Probing and dialing happen under that
//!   lock only, so slow hosts do not block other keys, and two callers can
//!   never build two live shells for the same key.
//! - The shell itself sits behind [`SharedShell`]'s mutex, so at most one task
//!   issues commands to it at a time.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::ConnectSettings;
use super::error::FleetError;
use super::shell::RemoteShell;
use super::types::HostDescriptor;

/// A pooled shell. Lock it to execute.
pub type SharedShell = Arc<Mutex<RemoteShell>>;

type Slot = Arc<Mutex<Option<SharedShell>>>;

/// Builds a ready-to-use shell for a host.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, host: &HostDescriptor) -> Result<RemoteShell, FleetError>;
}

/// Connector backed by real SSH connections.
pub struct SshConnector {
    settings: ConnectSettings,
}

impl SshConnector {
    pub fn new(settings: ConnectSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, host: &HostDescriptor) -> Result<RemoteShell, FleetError> {
        RemoteShell::open(host, &self.settings).await
    }
}

/// Pool of remote shells keyed by host identity.
pub struct SessionPool {
    connector: Arc<dyn ShellConnector>,
    slots: DashMap<String, Slot>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn ShellConnector>) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
        }
    }

    /// Pool that dials hosts over SSH with `settings`.
    pub fn ssh(settings: ConnectSettings) -> Self {
        Self::new(Arc::new(SshConnector::new(settings)))
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Return a live shell for `host`, building one on a miss.
    ///
    /// A cached shell is reused when it is healthy and answers a ping. A shell
    /// that timed out twice in a row is rebuilt without probing. Dial and
    /// authentication failures are returned to the caller.
    pub async fn acquire(&self, host: &HostDescriptor) -> Result<SharedShell, FleetError> {
        let key = host.identity_key();
        let slot = self.slot(&key);
        let mut cached = slot.lock().await;

        if let Some(shell) = cached.take() {
            let alive = {
                let mut guard = shell.lock().await;
                if guard.is_healthy() {
                    guard.ping().await
                } else {
                    debug!(
                        "Shell {} unhealthy ({} consecutive timeouts), skipping probe",
                        key,
                        guard.consecutive_timeouts()
                    );
                    false
                }
            };

            if alive {
                *cached = Some(shell.clone());
                return Ok(shell);
            }

            warn!("Evicting dead shell for {}", key);
            shell.lock().await.close().await;
        }

        let shell = Arc::new(Mutex::new(self.connector.connect(host).await?));
        info!("Pooled new shell for {}", key);
        *cached = Some(shell.clone());
        Ok(shell)
    }

    /// Connect every host concurrently. Returns the failures.
    pub async fn warm_up(&self, hosts: &[HostDescriptor]) -> Vec<(HostDescriptor, FleetError)> {
        let attempts = hosts.iter().map(|host| async move {
            match self.acquire(host).await {
                Ok(_) => None,
                Err(e) => Some((host.clone(), e)),
            }
        });

        join_all(attempts).await.into_iter().flatten().collect()
    }

    /// Number of keys currently holding a shell.
    pub async fn len(&self) -> usize {
        let mut count = 0;
        for slot in self.snapshot() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &str) -> bool {
        let slot = match self.slots.get(key) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };
        slot.lock().await.is_some()
    }

    fn snapshot(&self) -> Vec<Slot> {
        self.slots.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Close every shell and empty the pool.
    pub async fn close_all(&self) {
        let slots = self.snapshot();
        self.slots.clear();

        let closing = slots.into_iter().map(|slot| async move {
            if let Some(shell) = slot.lock().await.take() {
                shell.lock().await.close().await;
            }
        });
        join_all(closing).await;

        debug!("Session pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::{Reply, ScriptedConnector, echo_responder};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn host(address: &str) -> HostDescriptor {
        HostDescriptor::new(address, 22, "root", "pw")
    }

    mod acquire {
        use super::*;

        #[tokio::test]
        async fn test_reuses_live_shell() {
            let connector = Arc::new(ScriptedConnector::new(echo_responder));
            let pool = SessionPool::new(connector.clone());

            let first = pool.acquire(&host("10.0.0.1")).await.unwrap();
            let second = pool.acquire(&host("10.0.0.1")).await.unwrap();

            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(first.lock().await.id(), second.lock().await.id());
            assert_eq!(connector.connects(), 1);
        }

        #[tokio::test]
        async fn test_failed_ping_rebuilds_shell() {
            let ping_works = Arc::new(AtomicBool::new(true));
            let flag = ping_works.clone();
            let connector = Arc::new(ScriptedConnector::new(move |cmd| {
                if cmd == "echo ping" && !flag.load(Ordering::SeqCst) {
                    Reply::exit("", 1)
                } else {
                    echo_responder(cmd)
                }
            }));
            let pool = SessionPool::new(connector.clone());
            let target = host("10.0.0.1");

            let first = pool.acquire(&target).await.unwrap();
            let first_id = first.lock().await.id();

            ping_works.store(false, Ordering::SeqCst);
            let second = pool.acquire(&target).await.unwrap();
            let second = second.lock().await;

            assert_ne!(second.id(), first_id);
            assert_eq!(second.identity_key(), target.identity_key());
            assert_eq!(connector.connects(), 2);
            assert_eq!(
                first.lock().await.state(),
                crate::fleet::types::ShellState::Closed
            );
        }

        #[tokio::test]
        async fn test_unhealthy_shell_is_rebuilt() {
            let connector = Arc::new(ScriptedConnector::new(echo_responder));
            let pool = SessionPool::new(connector.clone());
            let target = host("10.0.0.1");

            let shell = pool.acquire(&target).await.unwrap();
            {
                let mut guard = shell.lock().await;
                for _ in 0..2 {
                    let _ = guard.execute("sleep 60", Duration::from_millis(20)).await;
                }
                assert!(!guard.is_healthy());
            }

            let rebuilt = pool.acquire(&target).await.unwrap();
            assert!(!Arc::ptr_eq(&shell, &rebuilt));
            assert_eq!(connector.connects(), 2);
        }

        #[tokio::test]
        async fn test_concurrent_acquire_builds_one_shell() {
            let connector = Arc::new(
                ScriptedConnector::new(echo_responder).with_delay(Duration::from_millis(50)),
            );
            let pool = Arc::new(SessionPool::new(connector.clone()));

            let tasks: Vec<_> = (0..10)
                .map(|_| {
                    let pool = pool.clone();
                    tokio::spawn(async move { pool.acquire(&host("10.0.0.1")).await })
                })
                .collect();

            let shells: Vec<SharedShell> = join_all(tasks)
                .await
                .into_iter()
                .map(|r| r.unwrap().unwrap())
                .collect();

            assert_eq!(connector.connects(), 1);
            assert!(shells.iter().all(|s| Arc::ptr_eq(s, &shells[0])));
        }

        #[tokio::test]
        async fn test_dial_failure_is_reported() {
            let connector =
                Arc::new(ScriptedConnector::new(echo_responder).with_unreachable(&["10.0.0.9"]));
            let pool = SessionPool::new(connector);

            let err = pool.acquire(&host("10.0.0.9")).await.err();
            assert!(matches!(err, Some(FleetError::Connect(_))));
            assert!(!pool.contains("10.0.0.9:22:root").await);
        }

        #[tokio::test]
        async fn test_keys_include_port_and_user() {
            let connector = Arc::new(ScriptedConnector::new(echo_responder));
            let pool = SessionPool::new(connector.clone());

            pool.acquire(&host("10.0.0.1")).await.unwrap();
            pool.acquire(&HostDescriptor::new("10.0.0.1", 2222, "root", "pw"))
                .await
                .unwrap();
            pool.acquire(&HostDescriptor::new("10.0.0.1", 22, "admin", "pw"))
                .await
                .unwrap();

            assert_eq!(pool.len().await, 3);
            assert_eq!(connector.connects(), 3);
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_warm_up_reports_failures() {
            let connector =
                Arc::new(ScriptedConnector::new(echo_responder).with_unreachable(&["10.0.0.2"]));
            let pool = SessionPool::new(connector);
            let hosts = vec![host("10.0.0.1"), host("10.0.0.2"), host("10.0.0.3")];

            let failures = pool.warm_up(&hosts).await;

            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0.address, "10.0.0.2");
            assert_eq!(pool.len().await, 2);
            assert!(pool.contains("10.0.0.3:22:root").await);
        }

        #[tokio::test]
        async fn test_close_all_empties_pool() {
            let connector = Arc::new(ScriptedConnector::new(echo_responder));
            let pool = SessionPool::new(connector);

            let shell = pool.acquire(&host("10.0.0.1")).await.unwrap();
            pool.acquire(&host("10.0.0.2")).await.unwrap();

            pool.close_all().await;

            assert!(pool.is_empty().await);
            assert_eq!(
                shell.lock().await.state(),
                crate::fleet::types::ShellState::Closed
            );
            pool.close_all().await;
        }
    }
}
