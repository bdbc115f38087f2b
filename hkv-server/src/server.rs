//! Server orchestration (spec §4.7): owns the shard manager, clocks,
//! persistence handle, notifier, and background task set, and exposes the
//! operation interface from spec §6 for the protocol front end to dispatch
//! against.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hkv_common::config::FsyncPolicy;
use hkv_common::{Config, ErrorKind, HkvError, HkvResult, HybridLogicalClock, VectorClock};
use hkv_engine::crdt::{CrdtKind, CrdtValue, InitialValue};
use hkv_engine::{PersistenceManager, ShardManager, TtlStatus};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::notifier::{keyspace_channel, Notifier, EXPIRED_CHANNEL};
use crate::stats::{ServerInfo, ServerStats};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

fn hash_node_id(node_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    node_id.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Default)]
struct BackgroundTaskFailures {
    ttl_sweep: AtomicU32,
    memory_monitor: AtomicU32,
    snapshot: AtomicU32,
    cleanup: AtomicU32,
}

impl BackgroundTaskFailures {
    fn counter(&self, task: &str) -> &AtomicU32 {
        match task {
            "ttl_sweep" => &self.ttl_sweep,
            "memory_monitor" => &self.memory_monitor,
            "snapshot" => &self.snapshot,
            _ => &self.cleanup,
        }
    }
}

/// Reports whether this node may currently accept writes. Defaults to
/// always-leader; a clustering collaborator can override it (spec §4.7
/// "leader check"). The core never implements consensus itself.
pub trait LeaderCheck: Send + Sync {
    fn is_leader(&self) -> bool;
}

struct AlwaysLeader;
impl LeaderCheck for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

pub struct Server {
    config: Config,
    node_id: u64,
    shards: ShardManager,
    hlc: HybridLogicalClock,
    vector_clock: VectorClock,
    persistence: Mutex<PersistenceManager>,
    notifier: Notifier,
    leader_check: Box<dyn LeaderCheck>,
    running: AtomicBool,
    degraded: AtomicBool,
    task_failures: BackgroundTaskFailures,
    shutdown: Notify,
    start_time: Instant,
}

impl Server {
    /// Builds a server from a validated config: recovers persisted state
    /// into a fresh shard manager before returning, so the server never
    /// accepts operations against a partially-restored keyspace (spec §4.6
    /// "Recovery is complete before the server accepts external
    /// operations").
    pub fn new(config: Config) -> HkvResult<Self> {
        config.validate()?;
        if config.storage.backend != hkv_common::config::StorageBackend::Memory {
            return Err(HkvError::invalid_argument(
                "only the memory storage backend is implemented by this core",
            ));
        }

        let node_id = hash_node_id(&config.node_id);
        let shards = ShardManager::new(
            config.sharding.num_shards,
            config.cache.eviction_policy,
            config.cache.max_memory,
            config.cache.memory_threshold,
            config.sharding.placement_strategy,
        );

        let persistence = PersistenceManager::open(
            &config.storage.data_dir,
            config.storage.aof_enabled,
            config.storage.aof_fsync_policy,
        )?;
        let restored_hlc = persistence.recover(&shards, node_id)?;

        let hlc = HybridLogicalClock::new(node_id);
        if let Some(ts) = restored_hlc {
            hlc.update(ts);
        }

        Ok(Server {
            config: config.clone(),
            node_id,
            shards,
            hlc,
            vector_clock: VectorClock::new(node_id),
            persistence: Mutex::new(persistence),
            notifier: Notifier::new(config.pubsub.message_buffer_size as usize),
            leader_check: Box::new(AlwaysLeader),
            running: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            task_failures: BackgroundTaskFailures::default(),
            shutdown: Notify::new(),
            start_time: Instant::now(),
        })
    }

    pub fn with_leader_check(mut self, check: Box<dyn LeaderCheck>) -> Self {
        self.leader_check = check;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn mark_running_for_test(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Spawns the background task set (spec §4.7): TTL sweep, memory-
    /// pressure monitor, snapshot scheduler, and tombstone cleanup. Each
    /// task observes `self.shutdown` and exits at its next sleep boundary
    /// (spec §5 cancellation model).
    pub async fn start(self: &Arc<Self>) -> HkvResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(node_id = self.config.node_id, shards = self.shards.num_shards(), "starting hyperkv server");

        self.spawn_ttl_sweep();
        self.spawn_memory_monitor();
        if self.config.storage.snapshot_enabled {
            self.spawn_snapshot_scheduler();
        }
        if self.config.storage.aof_enabled {
            self.spawn_aof_flusher();
        }
        if let Some(interval) = self.config.tombstone_gc_interval() {
            self.spawn_tombstone_cleanup(interval);
        }
        Ok(())
    }

    /// Idempotent graceful shutdown: flips the running flag, wakes every
    /// background task, drains persistence, and writes a final snapshot
    /// (spec §4.7 "On stop").
    pub async fn stop(self: &Arc<Self>) -> HkvResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!("stopping hyperkv server");
        self.shutdown.notify_waiters();

        {
            let mut persistence = self.persistence.lock();
            persistence.flush()?;
            if self.config.storage.snapshot_enabled {
                let ts = self.hlc.current();
                let now_millis = now_millis();
                persistence.snapshot(&self.shards, self.node_id, ts, now_millis)?;
            }
        }
        Ok(())
    }

    fn spawn_ttl_sweep(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut expired_total = 0usize;
                    for shard in this.shards.shards() {
                        expired_total += shard.ttl.sweep(1024, |key| {
                            shard.remove_expired(key);
                            this.notifier.publish(EXPIRED_CHANNEL, key);
                        });
                    }
                    expired_total
                }));
                this.record_task_outcome("ttl_sweep", outcome.is_ok());
            }
        });
    }

    fn spawn_memory_monitor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let batch_size = this.config.cache.eviction_batch_size as usize;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    this.shards.evict_if_needed(batch_size)
                }));
                this.record_task_outcome("memory_monitor", outcome.is_ok());
            }
        });
    }

    fn spawn_snapshot_scheduler(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = this.config.snapshot_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let ts = this.hlc.current();
                let now_millis = now_millis();
                let result = this
                    .persistence
                    .lock()
                    .snapshot(&this.shards, this.node_id, ts, now_millis);
                if let Err(e) = &result {
                    error!(error = %e, "scheduled snapshot failed");
                }
                this.record_task_outcome("snapshot", result.is_ok());
            }
        });
    }

    fn spawn_aof_flusher(self: &Arc<Self>) {
        if self.config.storage.aof_fsync_policy != FsyncPolicy::Everysec {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                let result = this.persistence.lock().flush();
                if let Err(e) = &result {
                    error!(error = %e, "append-log flush failed");
                }
                this.record_task_outcome("cleanup", result.is_ok());
            }
        });
    }

    fn spawn_tombstone_cleanup(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                // Tombstone GC policy (spec §9 Open Question): OR-Set and
                // LWW-Set tombstones are retained for the lifetime of the
                // process rather than actively compacted; the original
                // implementation's compaction pass operated on a
                // replication log this core does not maintain per-entry.
                // This tick exists as the hook future GC strategies attach
                // to, and currently just records a heartbeat.
                this.record_task_outcome("cleanup", true);
            }
        });
    }

    fn record_task_outcome(&self, task: &str, success: bool) {
        let counter = self.task_failures.counter(task);
        if success {
            counter.store(0, Ordering::Relaxed);
            return;
        }
        let failures = counter.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(task, failures, "background task iteration failed");
        if failures > self.config.background_task_failure_threshold {
            if !self.degraded.swap(true, Ordering::Relaxed) {
                error!(task, "background task failure threshold exceeded, entering degraded state");
            }
        }
    }

    fn check_running(&self) -> HkvResult<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HkvError::Shutdown)
        }
    }

    fn check_leader(&self) -> HkvResult<()> {
        if self.leader_check.is_leader() {
            Ok(())
        } else {
            Err(HkvError::NotLeader)
        }
    }

    fn notify_mutation(&self, key: &[u8]) {
        let channel = keyspace_channel(key);
        self.notifier.publish(&channel, key);
    }

    // ---- operation interface (spec §6) ----

    pub fn get(&self, key: &[u8]) -> HkvResult<Option<CrdtValue>> {
        self.check_running()?;
        self.shards.execute_on_shard(key, |shard| shard.get(key))
    }

    pub fn set(
        &self,
        key: &[u8],
        initial: InitialValue,
        kind: CrdtKind,
        ttl: Option<Duration>,
    ) -> HkvResult<bool> {
        self.check_running()?;
        self.check_leader()?;
        let ts = self.hlc.tick();
        self.vector_clock.tick();

        let fresh = hkv_engine::create_crdt(kind, Some(initial), self.node_id, ts);
        let (prior_value, prior_ttl) = self.shards.execute_on_shard(key, |shard| shard.raw_snapshot(key));
        let result = self.shards.execute_on_shard(key, |shard| {
            shard.set(key, kind, Some(clone_initial(&fresh)), self.node_id, ts, ttl)
        });
        result?;

        if let Err(e) = self.persistence.lock().log_set(key, &fresh, self.node_id, ts, ttl) {
            warn!(error = %e, "append-log write failed for set, rolling back in-memory change");
            self.shards.execute_on_shard(key, |shard| shard.restore_raw(key, prior_value, prior_ttl));
            return Err(e);
        }
        self.notify_mutation(key);
        Ok(true)
    }

    pub fn delete(&self, key: &[u8]) -> HkvResult<bool> {
        self.check_running()?;
        self.check_leader()?;
        let ts = self.hlc.tick();
        let (prior_value, prior_ttl) = self.shards.execute_on_shard(key, |shard| shard.raw_snapshot(key));
        let existed = self.shards.execute_on_shard(key, |shard| shard.delete(key))?;
        if existed {
            if let Err(e) = self.persistence.lock().log_delete(key, self.node_id, ts) {
                warn!(error = %e, "append-log write failed for delete, rolling back in-memory change");
                self.shards.execute_on_shard(key, |shard| shard.restore_raw(key, prior_value, prior_ttl));
                return Err(e);
            }
            self.notify_mutation(key);
        }
        Ok(existed)
    }

    pub fn exists(&self, key: &[u8]) -> HkvResult<bool> {
        self.check_running()?;
        self.shards.execute_on_shard(key, |shard| shard.exists(key))
    }

    pub fn scan(&self, cursor: u64, pattern: &str, count: usize) -> HkvResult<(u64, Vec<Vec<u8>>)> {
        self.check_running()?;
        Ok(self.shards.scan(cursor, pattern, count))
    }

    pub fn expire(&self, key: &[u8], ttl: Duration) -> HkvResult<bool> {
        self.check_running()?;
        self.check_leader()?;
        if ttl.is_zero() {
            return Err(HkvError::invalid_argument("ttl must be greater than zero"));
        }
        let ts = self.hlc.tick();
        let prior_ttl = self.shards.execute_on_shard(key, |shard| shard.ttl.get_ttl(key));
        let existed = self.shards.execute_on_shard(key, |shard| {
            if !shard.exists(key)? {
                return Ok(false);
            }
            shard.ttl.set_ttl(key, ttl);
            Ok(true)
        })?;
        if existed {
            if let Err(e) = self.persistence.lock().log_expire(key, self.node_id, ts, ttl) {
                warn!(error = %e, "append-log write failed for expire, rolling back in-memory change");
                self.shards.execute_on_shard(key, |shard| match prior_ttl {
                    Some(d) => shard.ttl.set_ttl(key, d),
                    None => shard.ttl.remove_ttl(key),
                });
                return Err(e);
            }
            self.notify_mutation(key);
        }
        Ok(existed)
    }

    /// `ttl(k)`: distinguishes a missing key from a persistent one from one
    /// with remaining time (spec §6), rather than conflating "no TTL" with
    /// "under a second left".
    pub fn ttl(&self, key: &[u8]) -> HkvResult<TtlStatus> {
        self.check_running()?;
        self.shards.execute_on_shard(key, |shard| {
            if !shard.exists(key)? {
                return Ok(TtlStatus::Missing);
            }
            Ok(match shard.ttl.get_ttl(key) {
                Some(remaining) => TtlStatus::ExpiresIn(remaining),
                None => TtlStatus::NoExpiry,
            })
        })
    }

    pub fn persist(&self, key: &[u8]) -> HkvResult<bool> {
        self.check_running()?;
        self.check_leader()?;
        let ts = self.hlc.tick();
        let prior_ttl = self.shards.execute_on_shard(key, |shard| shard.ttl.get_ttl(key));
        let removed = self.shards.execute_on_shard(key, |shard| {
            if !shard.exists(key)? {
                return Ok(false);
            }
            Ok(shard.ttl.remove_ttl(key))
        })?;
        if removed {
            if let Err(e) = self.persistence.lock().log_persist(key, self.node_id, ts) {
                warn!(error = %e, "append-log write failed for persist, rolling back in-memory change");
                if let Some(d) = prior_ttl {
                    self.shards.execute_on_shard(key, |shard| shard.ttl.set_ttl(key, d));
                }
                return Err(e);
            }
        }
        Ok(removed)
    }

    pub fn crdt_add(&self, key: &[u8], item: &[u8]) -> HkvResult<bool> {
        self.check_running()?;
        self.check_leader()?;
        let ts = self.hlc.tick();
        let (prior_value, prior_ttl) = self.shards.execute_on_shard(key, |shard| shard.raw_snapshot(key));
        self.shards.execute_on_shard(key, |shard| shard.crdt_add(key, item, ts, self.node_id))?;
        if let Err(e) = self.persistence.lock().log_crdt_add(key, item, self.node_id, ts) {
            warn!(error = %e, "append-log write failed for crdt add, rolling back in-memory change");
            self.shards.execute_on_shard(key, |shard| shard.restore_raw(key, prior_value, prior_ttl));
            return Err(e);
        }
        self.notify_mutation(key);
        Ok(true)
    }

    pub fn crdt_remove(&self, key: &[u8], item: &[u8]) -> HkvResult<bool> {
        self.check_running()?;
        self.check_leader()?;
        let ts = self.hlc.tick();
        let (prior_value, prior_ttl) = self.shards.execute_on_shard(key, |shard| shard.raw_snapshot(key));
        let existed = self.shards.execute_on_shard(key, |shard| shard.crdt_remove(key, item, ts, self.node_id))?;
        if existed {
            if let Err(e) = self.persistence.lock().log_crdt_remove(key, item, self.node_id, ts) {
                warn!(error = %e, "append-log write failed for crdt remove, rolling back in-memory change");
                self.shards.execute_on_shard(key, |shard| shard.restore_raw(key, prior_value, prior_ttl));
                return Err(e);
            }
            self.notify_mutation(key);
        }
        Ok(existed)
    }

    pub fn crdt_contains(&self, key: &[u8], item: &[u8]) -> HkvResult<bool> {
        self.check_running()?;
        self.shards.execute_on_shard(key, |shard| shard.crdt_contains(key, item))
    }

    pub fn crdt_increment(&self, key: &[u8], amount: u64) -> HkvResult<bool> {
        self.check_running()?;
        self.check_leader()?;
        let ts = self.hlc.tick();
        let (prior_value, prior_ttl) = self.shards.execute_on_shard(key, |shard| shard.raw_snapshot(key));
        self.shards.execute_on_shard(key, |shard| shard.crdt_increment(key, amount, self.node_id))?;
        if let Err(e) = self.persistence.lock().log_crdt_increment(key, amount, self.node_id, ts) {
            warn!(error = %e, "append-log write failed for crdt increment, rolling back in-memory change");
            self.shards.execute_on_shard(key, |shard| shard.restore_raw(key, prior_value, prior_ttl));
            return Err(e);
        }
        self.notify_mutation(key);
        Ok(true)
    }

    pub fn crdt_decrement(&self, key: &[u8], amount: u64) -> HkvResult<bool> {
        self.check_running()?;
        self.check_leader()?;
        let ts = self.hlc.tick();
        let (prior_value, prior_ttl) = self.shards.execute_on_shard(key, |shard| shard.raw_snapshot(key));
        self.shards.execute_on_shard(key, |shard| shard.crdt_decrement(key, amount, self.node_id))?;
        if let Err(e) = self.persistence.lock().log_crdt_decrement(key, amount, self.node_id, ts) {
            warn!(error = %e, "append-log write failed for crdt decrement, rolling back in-memory change");
            self.shards.execute_on_shard(key, |shard| shard.restore_raw(key, prior_value, prior_ttl));
            return Err(e);
        }
        self.notify_mutation(key);
        Ok(true)
    }

    pub fn crdt_value(&self, key: &[u8]) -> HkvResult<Option<i64>> {
        self.check_running()?;
        self.shards.execute_on_shard(key, |shard| shard.crdt_value(key))
    }

    pub fn publish(&self, channel: &str, message: &[u8]) -> HkvResult<usize> {
        self.check_running()?;
        Ok(self.notifier.publish(channel, message))
    }

    pub fn subscribe(&self, channel: &str) -> HkvResult<tokio::sync::broadcast::Receiver<Vec<u8>>> {
        self.check_running()?;
        Ok(self.notifier.subscribe(channel))
    }

    pub fn get_info(&self) -> ServerInfo {
        ServerInfo {
            node_id: self.config.node_id.clone(),
            version: SERVER_VERSION,
            role: if self.leader_check.is_leader() { "master" } else { "follower" },
            uptime_secs: self.start_time.elapsed().as_secs(),
            degraded: self.degraded.load(Ordering::Relaxed),
            num_shards: self.shards.num_shards(),
        }
    }

    pub fn get_stats(&self) -> ServerStats {
        ServerStats::collect(&self.shards, self.start_time.elapsed().as_secs())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn clone_initial(value: &CrdtValue) -> InitialValue {
    match value {
        CrdtValue::LwwRegister(r) => InitialValue::Bytes(r.get().map(|b| b.to_vec()).unwrap_or_default()),
        CrdtValue::LwwSet(s) => InitialValue::Elements(s.elements().map(|e| e.to_vec()).collect()),
        CrdtValue::OrSet(s) => InitialValue::Elements(s.values().map(|e| e.to_vec()).collect()),
        CrdtValue::PnCounter(c) => InitialValue::Amount(c.value().unsigned_abs()),
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(data_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = data_dir.to_string_lossy().to_string();
        config.storage.snapshot_enabled = false;
        config.sharding.num_shards = 2;
        config
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("hyperkv-server-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn set_then_get_roundtrips() {
        let dir = temp_dir("set-get");
        let server = Server::new(test_config(&dir)).unwrap();
        server.running.store(true, Ordering::Release);

        server.set(b"k", InitialValue::Bytes(b"v".to_vec()), CrdtKind::Lww, None).unwrap();
        let value = server.get(b"k").unwrap().unwrap();
        match value {
            CrdtValue::LwwRegister(r) => assert_eq!(r.get(), Some(&b"v"[..])),
            _ => panic!("expected lww"),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn shutdown_rejects_further_operations() {
        let dir = temp_dir("shutdown");
        let server = Server::new(test_config(&dir)).unwrap();
        let err = server.get(b"k").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shutdown);
        let _ = std::fs::remove_dir_all(&dir);
    }

    struct NeverLeader;
    impl LeaderCheck for NeverLeader {
        fn is_leader(&self) -> bool {
            false
        }
    }

    #[test]
    fn not_leader_rejects_writes() {
        let dir = temp_dir("not-leader");
        let server = Server::new(test_config(&dir)).unwrap().with_leader_check(Box::new(NeverLeader));
        server.running.store(true, Ordering::Release);
        let err = server.set(b"k", InitialValue::Bytes(b"v".to_vec()), CrdtKind::Lww, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotLeader);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn repeated_increments_accumulate_through_server() {
        let dir = temp_dir("incr");
        let server = Server::new(test_config(&dir)).unwrap();
        server.running.store(true, Ordering::Release);
        server.crdt_increment(b"c", 5).unwrap();
        server.crdt_increment(b"c", 3).unwrap();
        assert_eq!(server.crdt_value(b"c").unwrap(), Some(8));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ttl_distinguishes_missing_persistent_and_expiring() {
        let dir = temp_dir("ttl-status");
        let server = Server::new(test_config(&dir)).unwrap();
        server.running.store(true, Ordering::Release);

        assert_eq!(server.ttl(b"nope").unwrap(), TtlStatus::Missing);

        server.set(b"persistent", InitialValue::Bytes(b"v".to_vec()), CrdtKind::Lww, None).unwrap();
        assert_eq!(server.ttl(b"persistent").unwrap(), TtlStatus::NoExpiry);

        server
            .set(b"expiring", InitialValue::Bytes(b"v".to_vec()), CrdtKind::Lww, Some(Duration::from_secs(60)))
            .unwrap();
        match server.ttl(b"expiring").unwrap() {
            TtlStatus::ExpiresIn(remaining) => assert!(remaining <= Duration::from_secs(60)),
            other => panic!("expected ExpiresIn, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
