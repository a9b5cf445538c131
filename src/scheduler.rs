use crate::config::EngineConfig;
use crate::endpoints::{EndpointResolver, HttpMethod};
use crate::error::{PollError, TransportError};
use crate::model::{OperationId, OperationKind, Phase, StatusRecord};
use crate::refresh::TargetVerifier;
use crate::store::{Merged, ReconciliationStore};
use crate::transport::RemoteTransport;
use crate::wire::RemoteStatus;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ERROR_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct PollSettings {
    pub interval: Duration,
    pub jitter_pct: u8,
    pub max_failed_polls: u32,
    pub max_duration: Option<Duration>,
    pub verify_failed_targets: bool,
}

impl PollSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            interval: config.poll_interval,
            jitter_pct: config.poll_jitter_pct,
            max_failed_polls: config.max_failed_polls.max(1),
            max_duration: config.max_poll_duration,
            verify_failed_targets: config.verify_failed_targets,
        }
    }

    /// Interval spread by ±`jitter_pct` so many loops don't fire together.
    pub fn next_delay(&self) -> Duration {
        let base = self.interval.as_millis().min(u64::MAX as u128) as u64;
        let spread = base.saturating_mul(self.jitter_pct.min(90) as u64) / 100;
        if spread == 0 {
            return self.interval;
        }
        let millis = rand::thread_rng().gen_range(base - spread..=base + spread);
        Duration::from_millis(millis.max(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    NotScheduled,
    Scheduled,
    Terminated,
}

struct LoopEntry {
    token: u64,
    abort: AbortHandle,
}

struct Shared {
    transport: Arc<dyn RemoteTransport>,
    resolver: Arc<EndpointResolver>,
    store: Arc<ReconciliationStore>,
    verifier: Option<Arc<dyn TargetVerifier>>,
    settings: PollSettings,
    loops: Mutex<HashMap<OperationId, LoopEntry>>,
    terminated: Mutex<HashSet<OperationId>>,
    last_errors: Mutex<HashMap<OperationId, PollError>>,
    errors: broadcast::Sender<PollError>,
    tokens: AtomicU64,
}

/// Owns every polling loop. One loop per operation id at most; loops end
/// on a terminal phase, on cancellation, when the record is cleared, or
/// when a cap is exceeded.
#[derive(Clone)]
pub struct PollingScheduler {
    shared: Arc<Shared>,
}

impl PollingScheduler {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        resolver: Arc<EndpointResolver>,
        store: Arc<ReconciliationStore>,
        settings: PollSettings,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transport,
                resolver,
                store,
                verifier: None,
                settings,
                loops: Mutex::new(HashMap::new()),
                terminated: Mutex::new(HashSet::new()),
                last_errors: Mutex::new(HashMap::new()),
                errors,
                tokens: AtomicU64::new(1),
            }),
        }
    }

    /// Must be called before the scheduler is cloned or used.
    pub fn with_verifier(mut self, verifier: Arc<dyn TargetVerifier>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.verifier = Some(verifier);
        }
        self
    }

    pub fn settings(&self) -> &PollSettings {
        &self.shared.settings
    }

    /// Starts polling `id`. Returns false when nothing was started: the id
    /// is already polled, cannot be polled, or its record is terminal.
    pub fn schedule(&self, id: &OperationId, kind: OperationKind, target: &str) -> bool {
        if !id.is_remote() || self.shared.resolver.status_path(kind, id).is_none() {
            return false;
        }
        if self
            .shared
            .store
            .get(id)
            .is_some_and(|record| record.is_terminal())
        {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("poll-schedule-skipped id={id} reason=no-runtime");
            return false;
        };
        let Ok(mut loops) = self.shared.loops.lock() else {
            return false;
        };
        if loops.contains_key(id) {
            debug!("poll-already-scheduled id={id}");
            return false;
        }

        let token = self.shared.tokens.fetch_add(1, Ordering::Relaxed);
        let task = handle.spawn(run_loop(
            self.shared.clone(),
            id.clone(),
            kind,
            target.to_string(),
            token,
        ));
        loops.insert(
            id.clone(),
            LoopEntry {
                token,
                abort: task.abort_handle(),
            },
        );
        drop(loops);

        if let Ok(mut terminated) = self.shared.terminated.lock() {
            terminated.remove(id);
        }
        if let Ok(mut errors) = self.shared.last_errors.lock() {
            errors.remove(id);
        }
        info!("poll-scheduled id={id} kind={}", kind.as_str());
        true
    }

    /// Stops observing `id`. The stored record is left untouched.
    pub fn cancel(&self, id: &OperationId) -> bool {
        let entry = self
            .shared
            .loops
            .lock()
            .ok()
            .and_then(|mut loops| loops.remove(id));
        let Some(entry) = entry else {
            return false;
        };
        entry.abort.abort();
        if let Ok(mut terminated) = self.shared.terminated.lock() {
            terminated.insert(id.clone());
        }
        info!("poll-cancelled id={id}");
        true
    }

    pub fn shutdown(&self) {
        let entries: Vec<(OperationId, LoopEntry)> = match self.shared.loops.lock() {
            Ok(mut loops) => loops.drain().collect(),
            Err(_) => return,
        };
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        if let Ok(mut terminated) = self.shared.terminated.lock() {
            for (id, entry) in entries {
                entry.abort.abort();
                terminated.insert(id);
            }
        }
        info!("poll-shutdown loops={count}");
    }

    pub fn state(&self, id: &OperationId) -> LoopState {
        if self
            .shared
            .loops
            .lock()
            .map(|loops| loops.contains_key(id))
            .unwrap_or(false)
        {
            return LoopState::Scheduled;
        }
        if self
            .shared
            .terminated
            .lock()
            .map(|terminated| terminated.contains(id))
            .unwrap_or(false)
        {
            return LoopState::Terminated;
        }
        LoopState::NotScheduled
    }

    pub fn active_count(&self) -> usize {
        self.shared.loops.lock().map(|loops| loops.len()).unwrap_or(0)
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<PollError> {
        self.shared.errors.subscribe()
    }

    pub fn last_error(&self, id: &OperationId) -> Option<PollError> {
        self.shared
            .last_errors
            .lock()
            .ok()
            .and_then(|errors| errors.get(id).cloned())
    }

    /// One out-of-band status query merged through the same rules as the
    /// scheduled ones. `Ok(None)` when the id is not in the store.
    pub async fn refresh_now(
        &self,
        id: &OperationId,
    ) -> Result<Option<StatusRecord>, TransportError> {
        let Some(record) = self.shared.store.get(id) else {
            return Ok(None);
        };
        let merged = self.shared.poll_once(id, record.kind, &record.target).await?;
        Ok(merged.and_then(|merged| merged.current))
    }
}

enum LoopExit {
    Terminal,
    Cleared,
    Capped,
}

async fn run_loop(
    shared: Arc<Shared>,
    id: OperationId,
    kind: OperationKind,
    target: String,
    token: u64,
) {
    let started = Instant::now();
    let mut failures: u32 = 0;
    let exit = loop {
        tokio::time::sleep(shared.settings.next_delay()).await;
        match shared.store.get(&id) {
            None => break LoopExit::Cleared,
            Some(record) if record.is_terminal() => break LoopExit::Terminal,
            Some(_) => {}
        }

        match shared.poll_once(&id, kind, &target).await {
            Ok(None) => break LoopExit::Cleared,
            Ok(Some(merged)) => {
                failures = 0;
                let phase = merged.current.as_ref().map(|r| r.phase);
                debug!("poll-tick id={id} outcome={:?} phase={phase:?}", merged.outcome);
                if phase.is_some_and(Phase::is_terminal) {
                    break LoopExit::Terminal;
                }
            }
            Err(err) => {
                failures += 1;
                warn!(
                    "poll-failed id={id} attempt={failures} code={} error={err}",
                    err.code()
                );
                if failures >= shared.settings.max_failed_polls {
                    shared.publish(PollError::ExceededMaxAttempts {
                        id: id.clone(),
                        attempts: failures,
                    });
                    break LoopExit::Capped;
                }
            }
        }

        if let Some(max) = shared.settings.max_duration {
            let elapsed = started.elapsed();
            if elapsed >= max {
                shared.publish(PollError::ExceededMaxDuration {
                    id: id.clone(),
                    elapsed_secs: elapsed.as_secs(),
                });
                break LoopExit::Capped;
            }
        }
    };

    match exit {
        LoopExit::Terminal => info!("poll-finished id={id}"),
        LoopExit::Cleared => debug!("poll-stopped id={id} reason=cleared"),
        LoopExit::Capped => {}
    }
    shared.finish_loop(&id, token);
}

impl Shared {
    async fn poll_once(
        &self,
        id: &OperationId,
        kind: OperationKind,
        target: &str,
    ) -> Result<Option<Merged>, TransportError> {
        let path = self
            .resolver
            .status_path(kind, id)
            .ok_or_else(|| TransportError::InvalidUrl(id.to_string()))?;
        // Taken before the request so a slow reply loses to a later one.
        let revision = self.store.next_revision();
        let body = self.transport.send(HttpMethod::Get, &path, None).await?;
        let remote =
            RemoteStatus::from_value(body).map_err(|err| TransportError::Decode(err.to_string()))?;
        let reported_failure = remote.success == Some(false);

        let fallback = self
            .store
            .get(id)
            .map(|record| record.target)
            .unwrap_or_else(|| target.to_string());
        let mut record = remote.into_record(kind, &fallback, revision);

        if record.phase == Phase::Failed && reported_failure && self.settings.verify_failed_targets
        {
            if let Some(verifier) = self.verifier.as_ref() {
                if verifier.target_exists(kind, &record.target).await {
                    info!("poll-failure-overridden id={id} target={}", record.target);
                    record.mark_verified_success();
                }
            }
        }

        Ok(self.store.merge_existing(id, record))
    }

    fn publish(&self, err: PollError) {
        warn!("poll-gave-up id={} code={} error={err}", err.id(), err.code());
        if let Ok(mut errors) = self.last_errors.lock() {
            errors.insert(err.id().clone(), err.clone());
        }
        let _ = self.errors.send(err);
    }

    fn finish_loop(&self, id: &OperationId, token: u64) {
        let mut removed = false;
        if let Ok(mut loops) = self.loops.lock() {
            if loops.get(id).is_some_and(|entry| entry.token == token) {
                loops.remove(id);
                removed = true;
            }
        }
        if removed {
            if let Ok(mut terminated) = self.terminated.lock() {
                terminated.insert(id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogLine;
    use crate::testkit::ScriptedTransport;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    fn settings(max_failed: u32) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(2),
            jitter_pct: 0,
            max_failed_polls: max_failed,
            max_duration: None,
            verify_failed_targets: true,
        }
    }

    fn scheduler_with(
        transport: Arc<ScriptedTransport>,
        settings: PollSettings,
    ) -> (PollingScheduler, Arc<ReconciliationStore>) {
        let store = Arc::new(ReconciliationStore::default());
        let scheduler = PollingScheduler::new(
            transport,
            Arc::new(EndpointResolver::new("docker")),
            store.clone(),
            settings,
        );
        (scheduler, store)
    }

    fn seed(store: &ReconciliationStore, id: &OperationId, kind: OperationKind, phase: Phase) {
        let mut record = StatusRecord::pending(kind, "app:latest", store.next_revision());
        record.phase = phase;
        store.merge(id, record);
    }

    struct AlwaysPresent;

    #[async_trait]
    impl TargetVerifier for AlwaysPresent {
        async fn target_exists(&self, _kind: OperationKind, _target: &str) -> bool {
            true
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut settings = settings(3);
        settings.jitter_pct = 20;
        for _ in 0..200 {
            let delay = settings.next_delay();
            assert!(delay >= Duration::from_millis(1_600));
            assert!(delay <= Duration::from_millis(2_400));
        }
        settings.jitter_pct = 0;
        assert_eq!(settings.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn build_polls_until_terminal() {
        let transport = ScriptedTransport::new();
        transport.respond("GET docker/build/b1", Ok(json!({ "status": "building" })));
        transport.respond(
            "GET docker/build/b1",
            Ok(json!({ "status": "completed", "success": true, "logs": [{ "log": "done", "timestamp": "t1" }] })),
        );
        let (scheduler, store) = scheduler_with(transport.clone(), settings(3));
        let id = OperationId::remote("b1");
        seed(&store, &id, OperationKind::Build, Phase::Pending);

        assert!(scheduler.schedule(&id, OperationKind::Build, "app:latest"));
        assert_eq!(scheduler.state(&id), LoopState::Scheduled);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let record = store.get(&id).unwrap();
        assert_eq!(record.phase, Phase::Succeeded);
        assert!(record.finished_at.is_some());
        assert_eq!(transport.calls("GET docker/build/b1"), 2);
        assert_eq!(scheduler.state(&id), LoopState::Terminated);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_schedule_is_a_noop() {
        let transport = ScriptedTransport::new();
        transport.respond("GET docker/pull/p1", Ok(json!({ "status": "pulling" })));
        transport.respond("GET docker/pull/p1", Ok(json!({ "status": "completed" })));
        let (scheduler, store) = scheduler_with(transport.clone(), settings(3));
        let id = OperationId::remote("p1");
        seed(&store, &id, OperationKind::Pull, Phase::Pending);

        assert!(scheduler.schedule(&id, OperationKind::Pull, "alpine"));
        assert!(!scheduler.schedule(&id, OperationKind::Pull, "alpine"));
        assert_eq!(scheduler.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(transport.calls("GET docker/pull/p1"), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.calls("GET docker/pull/p1"), 2);
        // Terminal records are never rescheduled.
        assert!(!scheduler.schedule(&id, OperationKind::Pull, "alpine"));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_surfaces_error_and_keeps_record() {
        let transport = ScriptedTransport::new();
        for _ in 0..3 {
            transport.respond("GET docker/pull/p1", Err(TransportError::Timeout));
        }
        let (scheduler, store) = scheduler_with(transport.clone(), settings(3));
        let mut errors = scheduler.subscribe_errors();
        let id = OperationId::remote("p1");
        seed(&store, &id, OperationKind::Pull, Phase::InProgress);

        scheduler.schedule(&id, OperationKind::Pull, "alpine");
        let err = errors.recv().await.unwrap();
        assert_eq!(
            err,
            PollError::ExceededMaxAttempts {
                id: id.clone(),
                attempts: 3
            }
        );
        assert_eq!(scheduler.last_error(&id), Some(err));
        assert_eq!(store.get(&id).unwrap().phase, Phase::InProgress);
        assert_eq!(transport.calls("GET docker/pull/p1"), 3);
        tokio::task::yield_now().await;
        assert_eq!(scheduler.state(&id), LoopState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_poll_resets_the_failure_count() {
        let transport = ScriptedTransport::new();
        transport.respond("GET docker/pull/p1", Err(TransportError::Status(502)));
        transport.respond("GET docker/pull/p1", Err(TransportError::Timeout));
        transport.respond("GET docker/pull/p1", Ok(json!({ "status": "pulling" })));
        transport.respond("GET docker/pull/p1", Err(TransportError::Timeout));
        transport.respond("GET docker/pull/p1", Ok(json!({ "status": "completed" })));
        let (scheduler, store) = scheduler_with(transport.clone(), settings(3));
        let id = OperationId::remote("p1");
        seed(&store, &id, OperationKind::Pull, Phase::Pending);

        scheduler.schedule(&id, OperationKind::Pull, "alpine");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(store.get(&id).unwrap().phase, Phase::Succeeded);
        assert!(scheduler.last_error(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_cap_stops_the_loop() {
        let transport = ScriptedTransport::new();
        transport.respond_always("GET docker/build/b1", Ok(json!({ "status": "building" })));
        let mut settings = settings(30);
        settings.max_duration = Some(Duration::from_secs(5));
        let (scheduler, store) = scheduler_with(transport.clone(), settings);
        let id = OperationId::remote("b1");
        seed(&store, &id, OperationKind::Build, Phase::Pending);

        scheduler.schedule(&id, OperationKind::Build, "app");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(matches!(
            scheduler.last_error(&id),
            Some(PollError::ExceededMaxDuration { .. })
        ));
        assert_eq!(transport.calls("GET docker/build/b1"), 3);
        assert_eq!(store.get(&id).unwrap().phase, Phase::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling_without_touching_the_record() {
        let transport = ScriptedTransport::new();
        transport.respond_always("GET docker/build/b1", Ok(json!({ "status": "building" })));
        let (scheduler, store) = scheduler_with(transport.clone(), settings(3));
        let id = OperationId::remote("b1");
        seed(&store, &id, OperationKind::Build, Phase::Pending);

        scheduler.schedule(&id, OperationKind::Build, "app");
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(transport.calls("GET docker/build/b1"), 2);
        assert!(scheduler.cancel(&id));
        assert!(!scheduler.cancel(&id));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.calls("GET docker/build/b1"), 2);
        assert_eq!(store.get(&id).unwrap().phase, Phase::InProgress);
        assert_eq!(scheduler.state(&id), LoopState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_record_ends_its_loop() {
        let transport = ScriptedTransport::new();
        transport.respond_always("GET docker/pull/p1", Ok(json!({ "status": "pulling" })));
        let (scheduler, store) = scheduler_with(transport.clone(), settings(3));
        let id = OperationId::remote("p1");
        seed(&store, &id, OperationKind::Pull, Phase::Pending);

        scheduler.schedule(&id, OperationKind::Pull, "alpine");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        store.remove(&id);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.calls("GET docker/pull/p1"), 1);
        assert!(store.get(&id).is_none());
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_failure_is_reverified_before_merging() {
        let transport = ScriptedTransport::new();
        transport.respond(
            "GET docker/pull/p1",
            Ok(json!({ "status": "completed", "success": false, "error": "EOF" })),
        );
        let store = Arc::new(ReconciliationStore::default());
        let scheduler = PollingScheduler::new(
            transport.clone(),
            Arc::new(EndpointResolver::new("docker")),
            store.clone(),
            settings(3),
        )
        .with_verifier(Arc::new(AlwaysPresent));
        let id = OperationId::remote("p1");
        seed(&store, &id, OperationKind::Pull, Phase::InProgress);

        scheduler.schedule(&id, OperationKind::Pull, "alpine");
        tokio::time::sleep(Duration::from_secs(3)).await;
        let record = store.get(&id).unwrap();
        assert_eq!(record.phase, Phase::Succeeded);
        assert!(record.verified_by_listing);
        assert!(record.failure_category.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unverified_failure_is_classified() {
        let transport = ScriptedTransport::new();
        transport.respond(
            "GET docker/build/b1",
            Ok(json!({
                "status": "completed",
                "success": false,
                "logs": [{ "log": "COPY failed: stat app.py: file does not exist", "timestamp": "t" }]
            })),
        );
        let (scheduler, store) = scheduler_with(transport.clone(), settings(3));
        let id = OperationId::remote("b1");
        seed(&store, &id, OperationKind::Build, Phase::InProgress);

        scheduler.schedule(&id, OperationKind::Build, "app");
        tokio::time::sleep(Duration::from_secs(3)).await;
        let record = store.get(&id).unwrap();
        assert_eq!(record.phase, Phase::Failed);
        assert_eq!(
            record.failure_category,
            Some(crate::model::FailureCategory::MissingBuildContextFile)
        );
        assert_eq!(
            record.log_lines,
            vec![LogLine::at("COPY failed: stat app.py: file does not exist", "t")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_merges_through_the_store() {
        let transport = ScriptedTransport::new();
        transport.respond("GET docker/build/b1", Ok(json!({ "status": "building" })));
        let (scheduler, store) = scheduler_with(transport.clone(), settings(3));
        let id = OperationId::remote("b1");
        seed(&store, &id, OperationKind::Build, Phase::Pending);

        let record = scheduler.refresh_now(&id).await.unwrap().unwrap();
        assert_eq!(record.phase, Phase::InProgress);
        assert!(scheduler
            .refresh_now(&OperationId::remote("missing"))
            .await
            .unwrap()
            .is_none());
    }

    struct ClearsDuringRequest {
        store: Arc<ReconciliationStore>,
        id: OperationId,
    }

    #[async_trait]
    impl RemoteTransport for ClearsDuringRequest {
        async fn send(
            &self,
            _method: HttpMethod,
            _path: &str,
            _body: Option<&Value>,
        ) -> Result<Value, TransportError> {
            self.store.remove(&self.id);
            Ok(json!({ "status": "complete" }))
        }
    }

    #[tokio::test]
    async fn record_cleared_mid_request_is_not_recreated() {
        let store = Arc::new(ReconciliationStore::default());
        let id = OperationId::remote("b1");
        seed(&store, &id, OperationKind::Build, Phase::Pending);
        let transport = Arc::new(ClearsDuringRequest {
            store: store.clone(),
            id: id.clone(),
        });
        let scheduler = PollingScheduler::new(
            transport,
            Arc::new(EndpointResolver::new("docker")),
            store.clone(),
            settings(3),
        );

        assert!(scheduler.refresh_now(&id).await.unwrap().is_none());
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn provisional_and_local_ids_are_never_polled() {
        let transport = ScriptedTransport::new();
        let (scheduler, _store) = scheduler_with(transport, settings(3));
        assert!(!scheduler.schedule(&OperationId::provisional(), OperationKind::Build, "a"));
        assert!(!scheduler.schedule(&OperationId::local(), OperationKind::ContainerAction, "c"));
        assert!(!scheduler.schedule(
            &OperationId::remote("c1"),
            OperationKind::ContainerAction,
            "c"
        ));
        assert_eq!(scheduler.active_count(), 0);
    }
}
