//! Operation coordinator — the one object every worker in an
//! operation shares: the queue, the listing cache, the disk-work channel,
//! the explored-path set, the cached welcome-banner/`SYST` reply, the
//! global speed meter, and the paused/resumed flag.
//!
//! Grounded on `FtpService` (`sorng-ftp::ftp::service`), which plays the
//! same "owns pool + queue, exposes the methods workers/callers delegate
//! to" role for a single Tauri-embedded session. This generalizes that
//! shape from one GUI-facing service object into a per-operation
//! `Context`: everything that was a process-wide singleton in the
//! original becomes a field here, threaded through workers via `Arc`, except the
//! listing cache, which the design notes keep as the one true
//! cross-operation singleton.

use crate::cache::ListingCache;
use crate::config::OperationConfig;
use crate::disk::DiskWorkChannel;
use crate::explored::{CycleKind, ExploredPathSet};
use crate::path::ServerPathSyntax;
use crate::queue::{ForceAction, OperationQueue, QueueCounters};
use crate::worker::{Worker, WorkerEvent, WorkerHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// Token-bucket-ish bandwidth limiter shared by every worker of one
/// operation, so the configured cap bounds the operation's *aggregate*
/// throughput rather than each connection independently.
///
/// Grounded on `saworbit-orbit`'s `core::bandwidth::apply_limit` — same
/// "compare bytes-per-second against the cap since the last checkpoint,
/// sleep off the excess" shape — adapted from a per-thread blocking sleep
/// to an async, mutex-guarded checkpoint so concurrent workers don't race
/// updating the window.
pub struct SpeedMeter {
    max_bytes_per_sec: u64,
    window: Mutex<(Instant, u64)>,
    total_bytes: AtomicU64,
}

impl SpeedMeter {
    pub fn new(max_bytes_per_sec: u64) -> Self {
        Self {
            max_bytes_per_sec,
            window: Mutex::new((Instant::now(), 0)),
            total_bytes: AtomicU64::new(0),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_bytes_per_sec == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Account for `bytes` just transferred by some worker and sleep off
    /// any excess over the cap accumulated in the current one-second
    /// window. A no-op when the operation has no speed limit configured.
    pub async fn throttle(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        if self.is_unlimited() || bytes == 0 {
            return;
        }

        let sleep_for = {
            let mut guard = self.window.lock().await;
            let (window_start, window_bytes) = &mut *guard;
            *window_bytes += bytes;
            let elapsed = window_start.elapsed();
            let elapsed_secs = elapsed.as_secs_f64();

            let mut sleep_for = None;
            if elapsed_secs < 1.0 && elapsed_secs > 0.0 {
                let bytes_per_sec = *window_bytes as f64 / elapsed_secs;
                if bytes_per_sec > self.max_bytes_per_sec as f64 {
                    let target_secs = *window_bytes as f64 / self.max_bytes_per_sec as f64;
                    sleep_for = Some(Duration::from_secs_f64((target_secs - elapsed_secs).max(0.0)));
                }
            }
            if elapsed >= Duration::from_secs(1) {
                *window_start = Instant::now();
                *window_bytes = 0;
            }
            sleep_for
        };

        if let Some(d) = sleep_for {
            tokio::time::sleep(d).await;
        }
    }
}

/// Cross-worker shared state for one bulk operation. One instance is
/// constructed per operation and handed to every worker as an `Arc`; the
/// queue, cache, disk channel, and explored set are all shared mutable
/// state behind mutexes, each held only across short critical sections.
pub struct OperationCoordinator {
    /// Correlates log lines across every worker of one operation, the same
    /// role `FtpClient::connect`'s per-connection `session_id` plays —
    /// generalized here to cover the whole multi-worker operation rather
    /// than a single session.
    pub operation_id: uuid::Uuid,
    pub config: OperationConfig,
    pub queue: Arc<Mutex<OperationQueue>>,
    pub cache: Arc<ListingCache>,
    pub disk: DiskWorkChannel,
    explored: Mutex<ExploredPathSet>,
    server_first_reply: Mutex<Option<String>>,
    server_system: Mutex<Option<String>>,
    speed_meter: Arc<SpeedMeter>,
    paused: AtomicBool,
    /// Workers currently in `Sleeping` with a live control connection,
    /// keyed by worker id — candidates for `give_work_to_sleeping_con_worker`.
    sleeping: Mutex<HashMap<u32, mpsc::Sender<WorkerEvent>>>,
    last_activity: Mutex<Instant>,
}

impl OperationCoordinator {
    pub fn new(config: OperationConfig, cache: Arc<ListingCache>) -> Arc<Self> {
        let path_syntax = ServerPathSyntax::Unix; // refined once a worker detects the server type
        let max_bandwidth = config.max_bandwidth_bytes_per_sec;
        Arc::new(Self {
            operation_id: uuid::Uuid::new_v4(),
            disk: DiskWorkChannel::spawn(),
            queue: Arc::new(Mutex::new(OperationQueue::new())),
            cache,
            explored: Mutex::new(ExploredPathSet::new(path_syntax)),
            server_first_reply: Mutex::new(None),
            server_system: Mutex::new(None),
            speed_meter: Arc::new(SpeedMeter::new(max_bandwidth)),
            paused: AtomicBool::new(false),
            sleeping: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            config,
        })
    }

    /// Spawn `config.max_concurrent_workers` workers and start each one's
    /// event loop as its own task, returning the handles callers use to
    /// drive and cancel them.
    pub fn spawn(self: &Arc<Self>) -> Vec<WorkerHandle> {
        let count = self.config.max_concurrent_workers.max(1);
        let mut handles = Vec::with_capacity(count);
        for id in 0..count as u32 {
            let (mut worker, handle) = Worker::new(id, Arc::clone(self));
            handles.push(WorkerHandle {
                tx: handle.tx.clone(),
                should_stop: Arc::clone(&handle.should_stop),
            });
            tokio::spawn(async move {
                worker.run().await;
            });
        }
        handles
    }

    // ── immutable config view ──────────────────────────────────────

    pub fn list_command(&self) -> &str {
        &self.config.list_command
    }

    pub fn init_ftp_commands(&self) -> &[String] {
        &self.config.login_script
    }

    // ── server banner / SYST cache, idempotent first-writer-wins ────

    pub async fn set_server_first_reply(&self, reply: impl Into<String>) {
        let mut guard = self.server_first_reply.lock().await;
        if guard.is_none() {
            *guard = Some(reply.into());
        }
    }

    pub async fn server_first_reply(&self) -> Option<String> {
        self.server_first_reply.lock().await.clone()
    }

    pub async fn set_server_system(&self, reply: impl Into<String>) {
        let mut guard = self.server_system.lock().await;
        if guard.is_none() {
            *guard = Some(reply.into());
        }
    }

    pub async fn server_system(&self) -> Option<String> {
        self.server_system.lock().await.clone()
    }

    // ── explored-path set, operation-owned ───────────────────────────

    pub async fn is_already_explored_path(&self, path: &str) -> bool {
        self.explored.lock().await.contains(path)
    }

    pub async fn add_to_explored_paths(&self, path: &str) -> bool {
        self.explored.lock().await.insert(path)
    }

    /// Check whether a CWD/PWD round trip just closed a cycle, without
    /// recording it — `requested` is the path the worker asked to CWD
    /// into, `resolved` is what the server's PWD reply reported back.
    pub async fn check_explore_cycle(&self, requested: &str, resolved: &str) -> Option<CycleKind> {
        self.explored.lock().await.check_cycle(requested, resolved)
    }

    // ── pause / resume ────────────────────────────────────────────────

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // ── cross-worker wake signalling ─────────────────────────────────

    pub async fn mark_sleeping(&self, worker_id: u32, tx: mpsc::Sender<WorkerEvent>) {
        self.sleeping.lock().await.insert(worker_id, tx);
    }

    pub async fn clear_sleeping(&self, worker_id: u32) {
        self.sleeping.lock().await.remove(&worker_id);
    }

    /// Wake every worker currently sleeping so each re-enters
    /// `LookingForWork` and re-queries the queue.
    pub async fn post_new_work_available(&self) {
        let sleepers = self.sleeping.lock().await;
        for tx in sleepers.values() {
            let _ = tx.try_send(WorkerEvent::WorkAvailable);
        }
    }

    /// Hand `caller`'s current item to a sibling worker that is sleeping
    /// with a live control connection, instead of making `caller`
    /// reconnect from scratch. Returns whether a sleeping sibling was
    /// found and woken; the actual item handoff happens through the
    /// queue (the woken worker calls `find_work` itself).
    pub async fn give_work_to_sleeping_con_worker(&self, caller: u32) -> bool {
        let sleepers = self.sleeping.lock().await;
        for (id, tx) in sleepers.iter() {
            if *id == caller {
                continue;
            }
            if tx.try_send(WorkerEvent::WorkAvailable).is_ok() {
                return true;
            }
        }
        false
    }

    // ── speed / activity ──────────────────────────────────────────────

    pub fn global_transfer_speed_meter(&self) -> Arc<SpeedMeter> {
        Arc::clone(&self.speed_meter)
    }

    pub async fn touch_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn get_global_last_activity_time(&self) -> Instant {
        *self.last_activity.lock().await
    }

    // ── progress ──────────────────────────────────────────────────────

    pub async fn counters(&self) -> QueueCounters {
        self.queue.lock().await.counters()
    }

    /// The caller answered a `user-input-needed` prompt for item `id`.
    /// Returns `false` if the item had already moved past that state by
    /// the time the answer arrived.
    pub async fn resolve_user_input(&self, id: u32, action: ForceAction) -> bool {
        let resolved = self.queue.lock().await.resolve_user_input(id, action);
        if resolved {
            self.post_new_work_available().await;
        }
        resolved
    }

    /// The caller gave up on a `user-input-needed` item without answering
    /// it — finalise it as `ForcedToFail` instead of leaving it stuck.
    pub async fn force_to_fail(&self, id: u32) {
        self.queue.lock().await.force_to_fail(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OperationConfig {
        serde_json::from_str(r#"{"host":"ftp.example.com","username":"anon","password":"x"}"#).unwrap()
    }

    #[tokio::test]
    async fn server_first_reply_is_first_writer_wins() {
        let coord = OperationCoordinator::new(config(), Arc::new(ListingCache::default()));
        coord.set_server_first_reply("220 hello").await;
        coord.set_server_first_reply("220 something else").await;
        assert_eq!(coord.server_first_reply().await.as_deref(), Some("220 hello"));
    }

    #[tokio::test]
    async fn explored_paths_are_shared_across_the_operation() {
        let coord = OperationCoordinator::new(config(), Arc::new(ListingCache::default()));
        assert!(!coord.is_already_explored_path("/pub").await);
        assert!(coord.add_to_explored_paths("/pub").await);
        assert!(coord.is_already_explored_path("/pub").await);
        assert!(!coord.add_to_explored_paths("/pub").await);
    }

    #[tokio::test]
    async fn pausing_blocks_find_work_via_is_paused() {
        let coord = OperationCoordinator::new(config(), Arc::new(ListingCache::default()));
        assert!(!coord.is_paused());
        coord.pause();
        assert!(coord.is_paused());
        coord.resume();
        assert!(!coord.is_paused());
    }

    #[tokio::test]
    async fn unlimited_speed_meter_never_sleeps() {
        let meter = SpeedMeter::new(0);
        let start = Instant::now();
        meter.throttle(10_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(meter.total_bytes(), 10_000_000);
    }

    #[tokio::test]
    async fn give_work_to_sleeping_con_worker_skips_the_caller() {
        let coord = OperationCoordinator::new(config(), Arc::new(ListingCache::default()));
        let (tx, mut rx) = mpsc::channel(4);
        coord.mark_sleeping(7, tx).await;
        assert!(!coord.give_work_to_sleeping_con_worker(7).await);
        assert!(rx.try_recv().is_err());
    }
}
