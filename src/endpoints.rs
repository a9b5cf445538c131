use crate::model::{OperationId, OperationKind, ResourceKind};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Build,
    Pull,
    Create,
    Start,
    Stop,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Pull => "pull",
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "build" => Some(Self::Build),
            "pull" => Some(Self::Pull),
            "create" | "run" => Some(Self::Create),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "delete" | "remove" | "rm" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn kind(self) -> OperationKind {
        match self {
            Self::Build => OperationKind::Build,
            Self::Pull => OperationKind::Pull,
            _ => OperationKind::ContainerAction,
        }
    }

    pub fn is_container_action(self) -> bool {
        self.kind() == OperationKind::ContainerAction
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// One candidate path shape. Placeholders: `{resource}`, `{name}`, `{id}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointTemplate {
    pub method: HttpMethod,
    pub path: String,
}

impl EndpointTemplate {
    pub fn post(path: &str) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub path: String,
}

/// What a container action is aimed at. Either field may be missing; paths
/// that need the missing one are skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetRef {
    pub name: Option<String>,
    pub id: Option<String>,
}

impl TargetRef {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            id: None,
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            name: None,
            id: Some(id.into()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn describe(&self) -> String {
        match (&self.name, &self.id) {
            (Some(name), Some(id)) => format!("{name} ({id})"),
            (Some(name), None) => name.clone(),
            (None, Some(id)) => id.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Turns an action and its target into an ordered fallback chain of
/// endpoints. The order is a preference; every entry may be rejected.
#[derive(Clone, Debug)]
pub struct EndpointResolver {
    resource: String,
    table: HashMap<Action, Vec<EndpointTemplate>>,
}

impl EndpointResolver {
    pub fn new(resource_prefix: &str) -> Self {
        Self::with_table(resource_prefix, default_table())
    }

    pub fn with_table(resource_prefix: &str, table: HashMap<Action, Vec<EndpointTemplate>>) -> Self {
        Self {
            resource: resource_prefix.trim().trim_matches('/').to_string(),
            table,
        }
    }

    pub fn resolve(&self, action: Action, target: &TargetRef) -> Vec<Endpoint> {
        self.table
            .get(&action)
            .map(|templates| {
                templates
                    .iter()
                    .filter_map(|template| {
                        self.render(&template.path, target).map(|path| Endpoint {
                            method: template.method,
                            path,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn status_path(&self, kind: OperationKind, id: &OperationId) -> Option<String> {
        if !id.is_remote() {
            return None;
        }
        let segment = match kind {
            OperationKind::Build => "build",
            OperationKind::Pull => "pull",
            OperationKind::ContainerAction => return None,
        };
        Some(join_path(&[
            &self.resource,
            segment,
            &encode_segment(id.raw()),
        ]))
    }

    pub fn history_paths(&self) -> Vec<(OperationKind, String)> {
        vec![
            (
                OperationKind::Pull,
                join_path(&[&self.resource, "pulls", "history"]),
            ),
            (OperationKind::Build, join_path(&[&self.resource, "builds"])),
        ]
    }

    pub fn listing_path(&self, resource: ResourceKind) -> String {
        join_path(&[&self.resource, resource.as_str()])
    }

    fn render(&self, template: &str, target: &TargetRef) -> Option<String> {
        let mut rendered = template.replace("{resource}", &self.resource);
        if rendered.contains("{name}") {
            let name = target.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
            rendered = rendered.replace("{name}", &encode_segment(name));
        }
        if rendered.contains("{id}") {
            let id = target.id.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
            rendered = rendered.replace("{id}", &encode_segment(id));
        }
        Some(join_path(&[&rendered]))
    }
}

fn default_table() -> HashMap<Action, Vec<EndpointTemplate>> {
    let mut table = HashMap::new();
    table.insert(
        Action::Build,
        vec![EndpointTemplate::post("{resource}/image/build")],
    );
    table.insert(
        Action::Pull,
        vec![EndpointTemplate::post("{resource}/image/pull")],
    );
    table.insert(
        Action::Create,
        vec![
            EndpointTemplate::post("{resource}/container/create"),
            EndpointTemplate::post("{resource}/containers/create"),
            EndpointTemplate::post("container/create"),
        ],
    );
    table.insert(
        Action::Start,
        vec![
            EndpointTemplate::post("container/{name}/start"),
            EndpointTemplate::post("container/id/{id}/start"),
        ],
    );
    table.insert(
        Action::Stop,
        vec![
            EndpointTemplate::post("{resource}/container/stop"),
            EndpointTemplate::post("container/{name}/stop"),
            EndpointTemplate::post("container/id/{id}/stop"),
        ],
    );
    table.insert(
        Action::Delete,
        vec![
            EndpointTemplate::post("{resource}/container/delete"),
            EndpointTemplate::post("container/{name}/delete"),
            EndpointTemplate::post("container/id/{id}/delete"),
        ],
    );
    table
}

fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
