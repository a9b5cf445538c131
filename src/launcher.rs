use crate::endpoints::{Action, Endpoint, EndpointResolver, TargetRef};
use crate::error::LaunchError;
use crate::model::{LogLine, OperationId, OperationKind, Phase, StatusRecord};
use crate::store::ReconciliationStore;
use crate::transport::RemoteTransport;
use crate::wire::{RemoteStatus, extract_operation_id, pointer_as_str};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub dockerfile_name: String,
    pub image_name: String,
    pub tag: String,
}

impl BuildSpec {
    pub fn new(
        dockerfile_name: impl Into<String>,
        image_name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            dockerfile_name: dockerfile_name.into(),
            image_name: image_name.into(),
            tag: tag.into(),
        }
    }

    fn image_name_lower(&self) -> String {
        self.image_name.trim().to_ascii_lowercase()
    }

    fn tag_lower(&self) -> String {
        let tag = self.tag.trim().to_ascii_lowercase();
        if tag.is_empty() { "latest".to_string() } else { tag }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.image_name_lower(), self.tag_lower())
    }

    /// Image references must be lowercase on the remote side.
    pub fn payload(&self) -> Value {
        json!({
            "dockerfile_name": self.dockerfile_name.trim(),
            "image_name": self.image_name_lower(),
            "tag": self.tag_lower(),
        })
    }
}

pub fn pull_payload(image_ref: &str) -> Value {
    json!({ "image": image_ref.trim() })
}

/// Result of a container action. Remote refusals that still came back 2xx
/// are represented as a Failed record, not as an error.
#[derive(Clone, Debug)]
pub struct ContainerActionOutcome {
    pub id: OperationId,
    pub record: StatusRecord,
    pub endpoint: Endpoint,
    pub response: Value,
}

impl ContainerActionOutcome {
    pub fn succeeded(&self) -> bool {
        self.record.phase == Phase::Succeeded
    }
}

pub struct OperationLauncher {
    transport: Arc<dyn RemoteTransport>,
    resolver: Arc<EndpointResolver>,
    store: Arc<ReconciliationStore>,
}

impl OperationLauncher {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        resolver: Arc<EndpointResolver>,
        store: Arc<ReconciliationStore>,
    ) -> Self {
        Self {
            transport,
            resolver,
            store,
        }
    }

    /// Submits a build or pull and inserts its Pending record before
    /// returning the remote id.
    pub async fn launch(
        &self,
        action: Action,
        target: &str,
        payload: &Value,
    ) -> Result<OperationId, LaunchError> {
        let (id, response) = self.submit_operation(action, payload).await?;
        let record = StatusRecord::pending(action.kind(), target, self.store.next_revision());
        self.store.merge(&id, record);
        self.apply_echoed_status(&id, action.kind(), target, response);
        Ok(id)
    }

    /// Like [`launch`](Self::launch), but shows a provisional record while
    /// the submission is in flight. The provisional entry is swapped for
    /// the real one on success and removed on failure.
    pub async fn launch_tracked(
        &self,
        action: Action,
        target: &str,
        payload: &Value,
    ) -> Result<OperationId, LaunchError> {
        let kind = action.kind();
        if kind == OperationKind::ContainerAction {
            return Err(LaunchError::UnsupportedAction {
                action: action.as_str(),
            });
        }
        let provisional = OperationId::provisional();
        self.store.merge(
            &provisional,
            StatusRecord::pending(kind, target, self.store.next_revision()),
        );

        match self.submit_operation(action, payload).await {
            Ok((id, response)) => {
                let record = StatusRecord::pending(kind, target, self.store.next_revision());
                self.store.replace_provisional(&provisional, &id, record);
                self.apply_echoed_status(&id, kind, target, response);
                Ok(id)
            }
            Err(err) => {
                self.store.remove(&provisional);
                Err(err)
            }
        }
    }

    /// Runs a container action through its fallback chain and records the
    /// outcome under a local id.
    pub async fn perform(
        &self,
        action: Action,
        target: &TargetRef,
        payload: &Value,
    ) -> Result<ContainerActionOutcome, LaunchError> {
        if !action.is_container_action() {
            return Err(LaunchError::UnsupportedAction {
                action: action.as_str(),
            });
        }
        let body = container_payload(action, target, payload);
        let candidates = self.resolver.resolve(action, target);
        let (endpoint, response) = self
            .try_candidates(action, &candidates, &body, |_| true)
            .await?;

        let remote_error = pointer_as_str(&response, "/error")
            .or_else(|| pointer_as_str(&response, "/detail"))
            .map(str::to_string);
        let mut record = StatusRecord::pending(
            OperationKind::ContainerAction,
            target.describe(),
            self.store.next_revision(),
        );
        if let Some(message) = pointer_as_str(&response, "/message") {
            record.log_lines.push(LogLine::new(message));
        }
        match remote_error {
            Some(message) => {
                record.log_lines.push(LogLine::new(format!("ERROR: {message}")));
                record.error = Some(message);
                record.finish(Phase::Failed);
            }
            None => record.finish(Phase::Succeeded),
        }

        let id = OperationId::local();
        let merged = self.store.merge(&id, record.clone());
        let record = merged.current.unwrap_or(record);
        info!(
            "container-action id={id} action={} target={} phase={}",
            action.as_str(),
            target.describe(),
            record.phase.as_str()
        );
        Ok(ContainerActionOutcome {
            id,
            record,
            endpoint,
            response,
        })
    }

    async fn submit_operation(
        &self,
        action: Action,
        payload: &Value,
    ) -> Result<(OperationId, Value), LaunchError> {
        if action.is_container_action() {
            return Err(LaunchError::UnsupportedAction {
                action: action.as_str(),
            });
        }
        let candidates = self.resolver.resolve(action, &TargetRef::default());
        let (endpoint, response) = self
            .try_candidates(action, &candidates, payload, |body| {
                extract_operation_id(body).is_some()
            })
            .await?;
        let id = extract_operation_id(&response)
            .map(OperationId::remote)
            .ok_or_else(|| LaunchError::AllEndpointsExhausted {
                action: action.as_str(),
                attempts: candidates.len(),
                last: format!("{} {}: missing operation id", endpoint.method.as_str(), endpoint.path),
            })?;
        info!("launch-accepted action={} id={id} path={}", action.as_str(), endpoint.path);
        Ok((id, response))
    }

    /// Tries each candidate in order, one at a time. A 2xx whose body fails
    /// `accept` counts as a rejection of that candidate.
    async fn try_candidates<F>(
        &self,
        action: Action,
        candidates: &[Endpoint],
        payload: &Value,
        accept: F,
    ) -> Result<(Endpoint, Value), LaunchError>
    where
        F: Fn(&Value) -> bool,
    {
        if candidates.is_empty() {
            return Err(LaunchError::NoCandidates {
                action: action.as_str(),
            });
        }
        let mut last = String::new();
        for (idx, endpoint) in candidates.iter().enumerate() {
            match self
                .transport
                .send(endpoint.method, &endpoint.path, Some(payload))
                .await
            {
                Ok(body) if accept(&body) => return Ok((endpoint.clone(), body)),
                Ok(_) => {
                    warn!(
                        "launch-candidate-rejected action={} path={} attempt={} reason=missing-operation-id",
                        action.as_str(),
                        endpoint.path,
                        idx + 1
                    );
                    last = format!("{} {}: missing operation id", endpoint.method.as_str(), endpoint.path);
                }
                Err(err) => {
                    warn!(
                        "launch-candidate-rejected action={} path={} attempt={} code={} error={err}",
                        action.as_str(),
                        endpoint.path,
                        idx + 1,
                        err.code()
                    );
                    last = format!("{} {}: {err}", endpoint.method.as_str(), endpoint.path);
                }
            }
        }
        Err(LaunchError::AllEndpointsExhausted {
            action: action.as_str(),
            attempts: candidates.len(),
            last,
        })
    }

    /// Submission responses may already carry a running status; apply it
    /// on top of the Pending record.
    fn apply_echoed_status(&self, id: &OperationId, kind: OperationKind, target: &str, response: Value) {
        let Ok(remote) = RemoteStatus::from_value(response) else {
            return;
        };
        if remote.status.is_none() || remote.phase() != Phase::InProgress {
            return;
        }
        let record = remote.into_record(kind, target, self.store.next_revision());
        self.store.merge(id, record);
    }
}

/// Stop and delete send the container id in the body on their first
/// candidate; the path-addressed candidates ignore it.
fn container_payload(action: Action, target: &TargetRef, payload: &Value) -> Value {
    let mut body = match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => return other.clone(),
    };
    if matches!(action, Action::Stop | Action::Delete) && !body.contains_key("container_id") {
        if let Some(id) = target.id.as_deref().or(target.name.as_deref()) {
            body.insert("container_id".to_string(), Value::String(id.to_string()));
        }
    }
    Value::Object(body)
}
