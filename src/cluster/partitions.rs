//! Partition Directory & Liveness Tracking
//!
//! Keeps the registry of every partition in the cluster together with its
//! health state. Operations that hit a partition route their errors through
//! [`PartitionDirectory::wrap_result`]: transport failures evict the partition
//! from the alive set, application errors never do. Evicted partitions are
//! rehabilitated by ping checks, either the full sweep
//! ([`check_all_partitions`](PartitionDirectory::check_all_partitions)) or the
//! cheaper dead-only sweep
//! ([`check_dead_partitions`](PartitionDirectory::check_dead_partitions)).
//! Both checks coalesce concurrent callers onto a single in-flight sweep.

use crate::cluster::selector::{RendezvousSelector, ServerSelector};
use crate::fs::contract::FileSystem;
use crate::fs::error::FsError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Identifier of one partition. Two equal ids address the same logical
/// partition for the whole lifetime of the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(pub String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionState {
    Alive,
    Dead,
}

struct PartitionSlot {
    fs: Arc<dyn FileSystem>,
    state: PartitionState,
}

/// A ping sweep in flight: followers wait on the receiver instead of issuing
/// redundant pings.
type CheckFlight = Mutex<Option<watch::Receiver<bool>>>;

/// Clears the flight slot even if the leading sweep is cancelled mid-way.
struct FlightGuard<'a>(&'a CheckFlight);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap() = None;
    }
}

pub struct PartitionDirectory {
    partitions: DashMap<PartitionId, PartitionSlot>,
    selector: Box<dyn ServerSelector>,
    check_all_flight: CheckFlight,
    check_dead_flight: CheckFlight,
}

impl PartitionDirectory {
    pub fn new() -> Self {
        Self::with_selector(Box::new(RendezvousSelector))
    }

    pub fn with_selector(selector: Box<dyn ServerSelector>) -> Self {
        Self {
            partitions: DashMap::new(),
            selector,
            check_all_flight: Mutex::new(None),
            check_dead_flight: Mutex::new(None),
        }
    }

    /// Registers a partition, initially alive.
    pub fn with_partition(self, id: PartitionId, fs: Arc<dyn FileSystem>) -> Self {
        self.register(id, fs);
        self
    }

    pub fn register(&self, id: PartitionId, fs: Arc<dyn FileSystem>) {
        self.partitions.insert(
            id,
            PartitionSlot {
                fs,
                state: PartitionState::Alive,
            },
        );
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Handle for an alive partition, `None` if unknown or marked dead.
    pub fn get(&self, id: &PartitionId) -> Option<Arc<dyn FileSystem>> {
        self.partitions.get(id).and_then(|slot| {
            if slot.state == PartitionState::Alive {
                Some(Arc::clone(&slot.fs))
            } else {
                None
            }
        })
    }

    /// Server selector applied to the current alive set.
    pub fn select(&self, name: &str) -> Vec<PartitionId> {
        self.selector.select_from(name, &self.alive_ids())
    }

    pub fn alive_ids(&self) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|entry| entry.value().state == PartitionState::Alive)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn dead_ids(&self) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|entry| entry.value().state == PartitionState::Dead)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn alive_entries(&self) -> Vec<(PartitionId, Arc<dyn FileSystem>)> {
        self.partitions
            .iter()
            .filter(|entry| entry.value().state == PartitionState::Alive)
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.value().fs)))
            .collect()
    }

    pub fn dead_count(&self) -> usize {
        self.partitions
            .iter()
            .filter(|entry| entry.value().state == PartitionState::Dead)
            .count()
    }

    /// Marks a partition dead so no further operations are routed to it.
    /// Returns whether a transition happened, so callers don't log the same
    /// death twice.
    pub fn mark_dead(&self, id: &PartitionId, cause: &FsError) -> bool {
        if let Some(mut slot) = self.partitions.get_mut(id) {
            if slot.state == PartitionState::Alive {
                slot.state = PartitionState::Dead;
                tracing::warn!("marking partition '{}' as dead: {}", id, cause);
                return true;
            }
        }
        false
    }

    pub fn mark_alive(&self, id: &PartitionId) {
        if let Some(mut slot) = self.partitions.get_mut(id) {
            if slot.state == PartitionState::Dead {
                slot.state = PartitionState::Alive;
                tracing::info!("partition '{}' is alive again", id);
            }
        }
    }

    /// Marks dead only for transport-level causes. Application errors mean
    /// the partition answered, so it stays alive.
    pub fn mark_if_dead(&self, id: &PartitionId, cause: &FsError) {
        if !cause.is_application() {
            self.mark_dead(id, cause);
        }
    }

    /// Adapter installed on every outbound partition operation: application
    /// errors pass through verbatim, transport errors evict the partition and
    /// are rewrapped with the offending id attached.
    pub fn wrap_result<T>(&self, id: &PartitionId, result: Result<T, FsError>) -> Result<T, FsError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_application() => Err(e),
            Err(e) => {
                self.mark_if_dead(id, &e);
                Err(FsError::NodeFailed {
                    id: id.to_string(),
                    cause: Box::new(e),
                })
            }
        }
    }

    /// Pings every partition and reconciles its state: responsive partitions
    /// become alive, unresponsive ones dead. Concurrent callers share one
    /// in-flight sweep.
    pub async fn check_all_partitions(&self) {
        self.coalesced_check(false).await;
    }

    /// Pings only the dead partitions, rehabilitating the ones that respond.
    /// Preferred for periodic use: it does nothing while everything is alive,
    /// since regular operations already mark partitions dead on failure.
    pub async fn check_dead_partitions(&self) {
        self.coalesced_check(true).await;
    }

    async fn coalesced_check(&self, dead_only: bool) {
        let slot = if dead_only {
            &self.check_dead_flight
        } else {
            &self.check_all_flight
        };

        enum Role {
            Leader(watch::Sender<bool>),
            Follower(watch::Receiver<bool>),
        }

        let role = {
            let mut guard = slot.lock().unwrap();
            match guard.as_ref() {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    *guard = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                // Resolves once the leader finishes or gives up.
                let _ = rx.changed().await;
            }
            Role::Leader(tx) => {
                let guard = FlightGuard(slot);
                self.run_check(dead_only).await;
                drop(guard);
                let _ = tx.send(true);
            }
        }
    }

    async fn run_check(&self, dead_only: bool) {
        let targets: Vec<(PartitionId, Arc<dyn FileSystem>)> = self
            .partitions
            .iter()
            .filter(|entry| !dead_only || entry.value().state == PartitionState::Dead)
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.value().fs)))
            .collect();

        let results = futures::future::join_all(targets.into_iter().map(|(id, fs)| async move {
            let result = fs.ping().await;
            (id, result)
        }))
        .await;

        for (id, result) in results {
            match result {
                Ok(()) => self.mark_alive(&id),
                Err(e) => {
                    if !dead_only {
                        self.mark_dead(&id, &e);
                    }
                }
            }
        }
    }
}

impl Default for PartitionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Ping-only filesystem with a controllable health flag.
    struct PingFs {
        healthy: AtomicBool,
        pings: AtomicUsize,
        ping_delay: Duration,
    }

    impl PingFs {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                pings: AtomicUsize::new(0),
                ping_delay: Duration::from_millis(0),
            })
        }

        fn slow(healthy: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                pings: AtomicUsize::new(0),
                ping_delay: delay,
            })
        }
    }

    #[async_trait]
    impl FileSystem for PingFs {
        async fn upload(&self, _: &str) -> Result<crate::fs::stream::ByteSink, FsError> {
            Err(FsError::Io("not implemented".into()))
        }
        async fn upload_sized(
            &self,
            _: &str,
            _: u64,
        ) -> Result<crate::fs::stream::ByteSink, FsError> {
            Err(FsError::Io("not implemented".into()))
        }
        async fn append(&self, _: &str, _: u64) -> Result<crate::fs::stream::ByteSink, FsError> {
            Err(FsError::Io("not implemented".into()))
        }
        async fn download(
            &self,
            _: &str,
            _: u64,
            _: u64,
        ) -> Result<crate::fs::stream::ByteSource, FsError> {
            Err(FsError::Io("not implemented".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), FsError> {
            Ok(())
        }
        async fn list(
            &self,
            _: &str,
        ) -> Result<HashMap<String, crate::fs::metadata::FileMetadata>, FsError> {
            Ok(HashMap::new())
        }
        async fn ping(&self) -> Result<(), FsError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if !self.ping_delay.is_zero() {
                tokio::time::sleep(self.ping_delay).await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(FsError::Io("ping timed out".into()))
            }
        }
    }

    fn directory_of(nodes: &[(&str, Arc<PingFs>)]) -> Arc<PartitionDirectory> {
        let mut directory = PartitionDirectory::new();
        for (id, fs) in nodes {
            directory = directory.with_partition(
                PartitionId::new(*id),
                Arc::clone(fs) as Arc<dyn FileSystem>,
            );
        }
        Arc::new(directory)
    }

    #[tokio::test]
    async fn transitions_happen_exactly_once() {
        let directory = directory_of(&[("a", PingFs::new(true))]);
        let id = PartitionId::new("a");
        let cause = FsError::Io("refused".into());

        assert!(directory.mark_dead(&id, &cause));
        assert!(!directory.mark_dead(&id, &cause));
        assert_eq!(directory.dead_count(), 1);
        assert!(directory.get(&id).is_none());

        directory.mark_alive(&id);
        assert_eq!(directory.dead_count(), 0);
        assert!(directory.get(&id).is_some());
    }

    #[tokio::test]
    async fn application_errors_never_evict() {
        let directory = directory_of(&[("a", PingFs::new(true))]);
        let id = PartitionId::new("a");

        directory.mark_if_dead(&id, &FsError::FileNotFound);
        assert_eq!(directory.dead_count(), 0);

        directory.mark_if_dead(&id, &FsError::Io("reset".into()));
        assert_eq!(directory.dead_count(), 1);
    }

    #[tokio::test]
    async fn wrap_result_tags_transport_failures_with_the_partition() {
        let directory = directory_of(&[("a", PingFs::new(true))]);
        let id = PartitionId::new("a");

        let passthrough = directory.wrap_result::<()>(&id, Err(FsError::FileNotFound));
        assert_eq!(passthrough.unwrap_err(), FsError::FileNotFound);
        assert_eq!(directory.dead_count(), 0);

        let wrapped = directory.wrap_result::<()>(&id, Err(FsError::Io("reset".into())));
        match wrapped.unwrap_err() {
            FsError::NodeFailed { id, cause } => {
                assert_eq!(id, "a");
                assert_eq!(*cause, FsError::Io("reset".into()));
            }
            other => panic!("expected NodeFailed, got {:?}", other),
        }
        assert_eq!(directory.dead_count(), 1);
    }

    #[tokio::test]
    async fn select_only_returns_alive_partitions() {
        let directory = directory_of(&[
            ("a", PingFs::new(true)),
            ("b", PingFs::new(true)),
            ("c", PingFs::new(true)),
        ]);

        assert_eq!(directory.select("file").len(), 3);
        directory.mark_dead(&PartitionId::new("b"), &FsError::Io("gone".into()));

        let selected = directory.select("file");
        assert_eq!(selected.len(), 2);
        assert!(!selected.contains(&PartitionId::new("b")));
    }

    #[tokio::test]
    async fn check_all_reconciles_both_directions() {
        let healthy = PingFs::new(true);
        let broken = PingFs::new(false);
        let directory = directory_of(&[("up", Arc::clone(&healthy)), ("down", Arc::clone(&broken))]);

        // Start from the inverse of reality.
        directory.mark_dead(&PartitionId::new("up"), &FsError::Io("flap".into()));

        directory.check_all_partitions().await;
        assert!(directory.get(&PartitionId::new("up")).is_some());
        assert!(directory.get(&PartitionId::new("down")).is_none());
    }

    #[tokio::test]
    async fn check_dead_only_pings_dead_partitions() {
        let healthy = PingFs::new(true);
        let recovered = PingFs::new(true);
        let directory = directory_of(&[
            ("steady", Arc::clone(&healthy)),
            ("flappy", Arc::clone(&recovered)),
        ]);
        directory.mark_dead(&PartitionId::new("flappy"), &FsError::Io("blip".into()));

        directory.check_dead_partitions().await;

        assert_eq!(healthy.pings.load(Ordering::SeqCst), 0);
        assert_eq!(recovered.pings.load(Ordering::SeqCst), 1);
        assert!(directory.get(&PartitionId::new("flappy")).is_some());
        assert!(directory
            .select("file")
            .contains(&PartitionId::new("flappy")));
    }

    #[tokio::test]
    async fn concurrent_checks_share_one_sweep() {
        let slow = PingFs::slow(true, Duration::from_millis(50));
        let directory = directory_of(&[("only", Arc::clone(&slow))]);

        let (a, b, c) = tokio::join!(
            directory.check_all_partitions(),
            directory.check_all_partitions(),
            directory.check_all_partitions(),
        );
        let _ = (a, b, c);

        assert_eq!(slow.pings.load(Ordering::SeqCst), 1);

        // A later call after the flight completed issues a fresh ping.
        directory.check_all_partitions().await;
        assert_eq!(slow.pings.load(Ordering::SeqCst), 2);
    }
}
