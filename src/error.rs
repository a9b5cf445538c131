use crate::model::OperationId;
use thiserror::Error;

/// Failure of a single request to the remote service.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("remote answered with status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Status(_) => "bad-status",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
            Self::InvalidUrl(_) => "invalid-url",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("no endpoint candidates for {action}")]
    NoCandidates { action: &'static str },
    #[error("{action} is not supported here")]
    UnsupportedAction { action: &'static str },
    #[error("all {attempts} endpoint candidates for {action} were rejected (last: {last})")]
    AllEndpointsExhausted {
        action: &'static str,
        attempts: usize,
        last: String,
    },
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoCandidates { .. } => "no-candidates",
            Self::UnsupportedAction { .. } => "unsupported-action",
            Self::AllEndpointsExhausted { .. } => "all-endpoints-exhausted",
        }
    }
}

/// Surfaced once a polling loop gives up; the stored record is left as-is.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("polling {id} failed {attempts} consecutive times")]
    ExceededMaxAttempts { id: OperationId, attempts: u32 },
    #[error("polling {id} exceeded {elapsed_secs}s without a terminal status")]
    ExceededMaxDuration { id: OperationId, elapsed_secs: u64 },
}

impl PollError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExceededMaxAttempts { .. } => "exceeded-max-attempts",
            Self::ExceededMaxDuration { .. } => "exceeded-max-duration",
        }
    }

    pub fn id(&self) -> &OperationId {
        match self {
            Self::ExceededMaxAttempts { id, .. } | Self::ExceededMaxDuration { id, .. } => id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("{0} is not tracked")]
    Unknown(OperationId),
    #[error("tracking of {0} stopped before it finished")]
    Stopped(OperationId),
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("journal migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("journal storage unavailable: {0}")]
    Storage(String),
    #[error("journal row undecodable: {0}")]
    Decode(String),
}

impl JournalError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "db-error",
            Self::Migrate(_) => "migrate-error",
            Self::Storage(_) => "storage-error",
            Self::Decode(_) => "decode-error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Everything the engine's setup and the command line surface can fail with.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config-invalid",
            Self::Transport(err) => err.code(),
            Self::Journal(err) => err.code(),
            Self::Launch(err) => err.code(),
            Self::Wait(WaitError::Poll(err)) => err.code(),
            Self::Wait(WaitError::Unknown(_)) => "unknown-operation",
            Self::Wait(WaitError::Stopped(_)) => "tracking-stopped",
        }
    }
}
