use crate::endpoints::{EndpointResolver, HttpMethod};
use crate::error::TransportError;
use crate::model::{OperationId, OperationKind, StatusRecord};
use crate::scheduler::{LoopState, PollingScheduler};
use crate::store::{MergeOutcome, ReconciliationStore};
use crate::transport::RemoteTransport;
use crate::wire::parse_history;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct HistoryReport {
    pub loaded: usize,
    pub accepted: usize,
    pub rejected_stale: usize,
    /// Entries ignored because a live loop already owns the id.
    pub skipped_scheduled: usize,
    /// Non-terminal entries that now have a polling loop.
    pub resumed: Vec<OperationId>,
    pub failures: Vec<(OperationKind, TransportError)>,
}

/// Bulk-loads past operations into the store. Entries carry revisions
/// derived from their own timestamps, so they never win against live data.
pub struct HistoryLoader {
    transport: Arc<dyn RemoteTransport>,
    resolver: Arc<EndpointResolver>,
    store: Arc<ReconciliationStore>,
    scheduler: PollingScheduler,
}

impl HistoryLoader {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        resolver: Arc<EndpointResolver>,
        store: Arc<ReconciliationStore>,
        scheduler: PollingScheduler,
    ) -> Self {
        Self {
            transport,
            resolver,
            store,
            scheduler,
        }
    }

    pub async fn load(&self) -> HistoryReport {
        let mut report = HistoryReport::default();
        for (kind, path) in self.resolver.history_paths() {
            match self.transport.send(HttpMethod::Get, &path, None).await {
                Ok(body) => self.absorb(parse_history(kind, &body), &mut report),
                Err(err) => {
                    warn!(
                        "history-load-failed kind={} path={path} code={} error={err}",
                        kind.as_str(),
                        err.code()
                    );
                    report.failures.push((kind, err));
                }
            }
        }
        info!(
            "history-loaded entries={} accepted={} resumed={}",
            report.loaded,
            report.accepted,
            report.resumed.len()
        );
        report
    }

    /// Merges entries from any bulk source and resumes polling for the ones
    /// that are still running.
    pub fn absorb(&self, entries: Vec<(OperationId, StatusRecord)>, report: &mut HistoryReport) {
        for (id, record) in entries {
            report.loaded += 1;
            if id.is_provisional() {
                continue;
            }
            if self.scheduler.state(&id) == LoopState::Scheduled {
                report.skipped_scheduled += 1;
                continue;
            }
            let kind = record.kind;
            let merged = self.store.merge(&id, record);
            match merged.outcome {
                MergeOutcome::Inserted | MergeOutcome::Updated => report.accepted += 1,
                MergeOutcome::RejectedStale => report.rejected_stale += 1,
                MergeOutcome::Unchanged => {}
            }
            let Some(current) = merged.current else {
                continue;
            };
            if !current.is_terminal() && self.scheduler.schedule(&id, kind, &current.target) {
                report.resumed.push(id);
            }
        }
    }
}
