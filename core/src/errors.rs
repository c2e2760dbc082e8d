//! Typed error enums for each subsystem, following the one-enum-per-concern
//! style used throughout this workspace: each variant carries enough context
//! to log or project onto an entity without re-querying the database.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("entity not found")]
    NotFound,
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("schema version mismatch: database is at {persisted}, binary expects {expected}")]
    SchemaMismatch { persisted: i64, expected: i64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("payload serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("message missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("unknown task name: {0}")]
    UnknownTask(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("process {0:?} exited with status {1:?}: {2}")]
    Process(Vec<String>, Option<i32>, String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("heat: image not found: {0}")]
    AvmImageNotFound(String),
    #[error("heat: vm not found: {0}")]
    AvmNotFound(String),
    #[error("heat: {0}")]
    Heat(String),
    #[error("amqp admin error {status}: {reason}")]
    AmqpAdmin { status: u16, reason: String },
    #[error("openstack gateway not authenticated: missing endpoint {0}")]
    MissingEndpoint(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("another {process_name} process is already running")]
    AlreadyRunning { process_name: String },
    #[error("failed to create lock socket: {0}")]
    Io(#[from] std::io::Error),
}

pub type LockResult<T> = Result<T, LockError>;

/// Outcome of running a single task handler, replacing the original
/// implementation's thrown `TaskDelay` exception with an explicit result
/// variant (see SPEC_FULL.md §9).
#[derive(Debug)]
pub enum DispatchOutcome {
    Done,
    Retry(String),
    PermanentError(PermanentError),
}

/// A permanent, classified-or-not failure. `classified` distinguishes a
/// recognised Heat condition (image/VM not found) from a generic failure;
/// both project onto an entity, but only the latter additionally
/// nacks-without-requeue when no entity can be identified from the payload.
#[derive(Debug)]
pub struct PermanentError {
    pub reason: String,
    pub classified: bool,
}

impl PermanentError {
    pub fn classified(reason: impl Into<String>) -> Self {
        PermanentError { reason: reason.into(), classified: true }
    }

    pub fn unclassified(reason: impl Into<String>) -> Self {
        PermanentError { reason: reason.into(), classified: false }
    }
}

impl From<DriverError> for PermanentError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::AvmImageNotFound(image) => {
                PermanentError::classified(format!("Image {} not found", image))
            }
            DriverError::AvmNotFound(avm_id) => {
                PermanentError::classified(format!("VM {} not found", avm_id))
            }
            other => PermanentError::unclassified(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
