//! The surface consumers use: launching, reading, subscribing and clearing.
//! One [`Engine`] owns one store; every component gets it injected.

use crate::classifier::{FailureClassifier, FailureReport};
use crate::config::EngineConfig;
use crate::endpoints::{Action, EndpointResolver, TargetRef};
use crate::error::{EngineError, JournalError, LaunchError, PollError, TransportError, WaitError};
use crate::history::{HistoryLoader, HistoryReport};
use crate::journal::OperationJournal;
use crate::launcher::{BuildSpec, ContainerActionOutcome, OperationLauncher, pull_payload};
use crate::model::{OperationId, OperationKind, ResourceKind, StatusRecord};
use crate::refresh::{
    CachedListing, HttpResourceRefresher, ResourceCache, ResourceRefreshCoordinator,
    ResourceRefresher, TargetVerifier,
};
use crate::scheduler::{LoopState, PollSettings, PollingScheduler};
use crate::store::{ReconciliationStore, StoreEvent, Subscription};
use crate::transport::{HttpTransport, RemoteTransport};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

enum JournalWrite {
    Upsert(OperationId, StatusRecord),
    Remove(OperationId),
    Flush(oneshot::Sender<()>),
}

pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn RemoteTransport>>,
    resolver: Option<EndpointResolver>,
    classifier: Option<FailureClassifier>,
    refresher: Option<Arc<dyn ResourceRefresher>>,
    verifier: Option<Arc<dyn TargetVerifier>>,
    journal: Option<OperationJournal>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            resolver: None,
            classifier: None,
            refresher: None,
            verifier: None,
            journal: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn resolver(mut self, resolver: EndpointResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn ResourceRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn TargetVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn journal(mut self, journal: OperationJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Wires the components together. Journal writes need a running tokio
    /// runtime; without one the journal is left unattached.
    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        let transport: Arc<dyn RemoteTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        let resolver = Arc::new(
            self.resolver
                .unwrap_or_else(|| EndpointResolver::new(&config.resource_prefix)),
        );
        let store = Arc::new(ReconciliationStore::new(
            self.classifier.unwrap_or_default(),
        ));
        let cache = Arc::new(ResourceCache::default());
        let http_refresher = Arc::new(HttpResourceRefresher::new(
            transport.clone(),
            resolver.clone(),
            cache.clone(),
        ));
        let refresher: Arc<dyn ResourceRefresher> = match self.refresher {
            Some(refresher) => refresher,
            None => http_refresher.clone(),
        };
        let verifier: Arc<dyn TargetVerifier> = match self.verifier {
            Some(verifier) => verifier,
            None => http_refresher,
        };

        let coordinator = Arc::new(ResourceRefreshCoordinator::new(
            refresher,
            config.refresh_window,
        ));
        let mut scheduler = PollingScheduler::new(
            transport.clone(),
            resolver.clone(),
            store.clone(),
            PollSettings::from_config(&config),
        );
        if config.verify_failed_targets {
            scheduler = scheduler.with_verifier(verifier);
        }
        let launcher = OperationLauncher::new(transport.clone(), resolver.clone(), store.clone());
        let history = HistoryLoader::new(transport, resolver, store.clone(), scheduler.clone());

        let hook_coordinator = coordinator.clone();
        let terminal_hook = store.subscribe_terminal(move |id, record| {
            if let Some(decision) = hook_coordinator.on_terminal_success(record) {
                debug!("refresh-requested id={id} decision={decision:?}");
            }
        });

        let (journal_hook, journal_tx, journal_task) = match self.journal.clone() {
            Some(journal) => match attach_journal(&store, journal) {
                Some((hook, tx, task)) => (Some(hook), Some(tx), Some(task)),
                None => (None, None, None),
            },
            None => (None, None, None),
        };

        Ok(Engine {
            config,
            store,
            launcher,
            scheduler,
            coordinator,
            history,
            cache,
            journal: self.journal,
            journal_tx,
            journal_task,
            _terminal_hook: terminal_hook,
            _journal_hook: journal_hook,
        })
    }
}

fn attach_journal(
    store: &Arc<ReconciliationStore>,
    journal: OperationJournal,
) -> Option<(Subscription, mpsc::UnboundedSender<JournalWrite>, AbortHandle)> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("journal-detached reason=no-runtime");
        return None;
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<JournalWrite>();
    let task = handle.spawn(async move {
        while let Some(write) = rx.recv().await {
            let result = match write {
                JournalWrite::Upsert(id, record) => journal.upsert(&id, &record).await.map(|_| ()),
                JournalWrite::Remove(id) => journal.remove(&id).await.map(|_| ()),
                JournalWrite::Flush(done) => {
                    let _ = done.send(());
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!("journal-write-failed code={} error={err}", err.code());
            }
        }
    });

    let hook_tx = tx.clone();
    let hook = store.subscribe(move |event| {
        let write = match event {
            StoreEvent::Upserted { id, record } | StoreEvent::Replaced { id, record, .. } => {
                if id.is_provisional() {
                    return;
                }
                JournalWrite::Upsert(id.clone(), record.clone())
            }
            StoreEvent::Removed { id } => JournalWrite::Remove(id.clone()),
        };
        let _ = hook_tx.send(write);
    });
    Some((hook, tx, task.abort_handle()))
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<ReconciliationStore>,
    launcher: OperationLauncher,
    scheduler: PollingScheduler,
    coordinator: Arc<ResourceRefreshCoordinator>,
    history: HistoryLoader,
    cache: Arc<ResourceCache>,
    journal: Option<OperationJournal>,
    journal_tx: Option<mpsc::UnboundedSender<JournalWrite>>,
    journal_task: Option<AbortHandle>,
    _terminal_hook: Subscription,
    _journal_hook: Option<Subscription>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ReconciliationStore> {
        &self.store
    }

    pub async fn launch_build(&self, spec: &BuildSpec) -> Result<OperationId, LaunchError> {
        let target = spec.target();
        let id = self
            .launcher
            .launch_tracked(Action::Build, &target, &spec.payload())
            .await?;
        self.scheduler.schedule(&id, OperationKind::Build, &target);
        Ok(id)
    }

    pub async fn launch_pull(&self, image_ref: &str) -> Result<OperationId, LaunchError> {
        let target = image_ref.trim();
        let id = self
            .launcher
            .launch_tracked(Action::Pull, target, &pull_payload(target))
            .await?;
        self.scheduler.schedule(&id, OperationKind::Pull, target);
        Ok(id)
    }

    pub async fn perform_container_action(
        &self,
        action: Action,
        target: &TargetRef,
        payload: &Value,
    ) -> Result<ContainerActionOutcome, LaunchError> {
        self.launcher.perform(action, target, payload).await
    }

    pub fn get_operation(&self, id: &OperationId) -> Option<StatusRecord> {
        self.store.get(id)
    }

    pub fn operations(&self) -> Vec<(OperationId, StatusRecord)> {
        self.store.snapshot()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn subscribe_terminal<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&OperationId, &StatusRecord) + Send + Sync + 'static,
    {
        self.store.subscribe_terminal(listener)
    }

    /// Stops watching `id` and drops its record. Only explicit calls remove
    /// records; terminal ones are otherwise kept.
    pub fn clear_from_history(&self, id: &OperationId) -> Option<StatusRecord> {
        self.scheduler.cancel(id);
        self.store.remove(id)
    }

    pub fn poll_errors(&self) -> broadcast::Receiver<PollError> {
        self.scheduler.subscribe_errors()
    }

    pub fn poll_error(&self, id: &OperationId) -> Option<PollError> {
        self.scheduler.last_error(id)
    }

    /// Starts polling an operation this process did not launch.
    pub fn track(&self, id: &OperationId, kind: OperationKind, target: &str) -> bool {
        if !self.store.contains(id) {
            let mut placeholder = StatusRecord::pending(kind, target, 0);
            placeholder.started_at = None;
            self.store.merge(id, placeholder);
        }
        self.scheduler.schedule(id, kind, target)
    }

    pub fn cancel(&self, id: &OperationId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn loop_state(&self, id: &OperationId) -> LoopState {
        self.scheduler.state(id)
    }

    pub async fn refresh_operation(
        &self,
        id: &OperationId,
    ) -> Result<Option<StatusRecord>, TransportError> {
        self.scheduler.refresh_now(id).await
    }

    pub async fn load_history(&self) -> HistoryReport {
        self.history.load().await
    }

    /// Re-adopts operations the journal saw running when the last process
    /// stopped.
    pub async fn resume_from_journal(&self) -> Result<HistoryReport, JournalError> {
        let mut report = HistoryReport::default();
        if let Some(journal) = self.journal.as_ref() {
            let entries = journal.load_unfinished().await?;
            self.history.absorb(entries, &mut report);
        }
        Ok(report)
    }

    /// Waits until queued journal writes are on disk.
    pub async fn flush_journal(&self) {
        let Some(tx) = self.journal_tx.as_ref() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(JournalWrite::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn failure_report(&self, id: &OperationId) -> Option<FailureReport> {
        self.store
            .get(id)
            .and_then(|record| FailureReport::from_record(&record))
    }

    pub fn images(&self) -> Option<CachedListing> {
        self.cache.get(ResourceKind::Images)
    }

    pub fn containers(&self) -> Option<CachedListing> {
        self.cache.get(ResourceKind::Containers)
    }

    pub async fn refresh(&self, resource: ResourceKind) -> Result<Vec<Value>, TransportError> {
        self.coordinator.refresh_now(resource).await
    }

    /// Resolves once `id` is terminal, or with the reason tracking ended
    /// first.
    pub async fn wait_until_settled(&self, id: &OperationId) -> Result<StatusRecord, WaitError> {
        let (tx, mut events) = mpsc::unbounded_channel::<()>();
        let watched = id.clone();
        let _subscription = self.store.subscribe(move |event| {
            if event.id() == &watched {
                let _ = tx.send(());
            }
        });
        let mut errors = self.scheduler.subscribe_errors();
        let recheck = self.scheduler.settings().interval;

        loop {
            // Loop state first: a loop merges its last record before it
            // finishes, so a stopped loop's record is already visible below.
            let state = self.scheduler.state(id);
            let last_error = self.scheduler.last_error(id);
            match self.store.get(id) {
                None => return Err(WaitError::Unknown(id.clone())),
                Some(record) if record.is_terminal() => return Ok(record),
                Some(_) => {}
            }
            if let Some(err) = last_error {
                return Err(WaitError::Poll(err));
            }
            if state != LoopState::Scheduled {
                return Err(WaitError::Stopped(id.clone()));
            }

            tokio::select! {
                _ = events.recv() => {}
                received = errors.recv() => {
                    if let Ok(err) = received {
                        if err.id() == id {
                            return Err(WaitError::Poll(err));
                        }
                    }
                }
                _ = tokio::time::sleep(recheck) => {}
            }
        }
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.coordinator.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.journal_task.take() {
            task.abort();
        }
    }
}
