//! Error types for virtwork
//!
//! Cluster failures are normalized into [`ApiError`] inside the kube-rs client
//! implementation, so nothing above the gateway ever matches on `kube::Error`.
//! Everything else is structured with the resource and cause needed to
//! diagnose a failed run without re-running it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Classification of a cluster API failure.
///
/// Idempotency and retry decisions are made purely on this value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Create of an object that already exists (409 AlreadyExists)
    AlreadyExists,
    /// Object does not exist (404)
    NotFound,
    /// Credentials missing or rejected (401)
    Unauthorized,
    /// Credentials valid but not allowed (403)
    Forbidden,
    /// Rate limited, server timeout, unavailable, or internal error
    Transient,
    /// Anything else, never retried
    Other,
}

impl ApiErrorKind {
    /// Classify an HTTP status code and optional Kubernetes `reason`.
    ///
    /// The reason wins when present since the API server reports a
    /// `ServerTimeout` or `InternalError` with varying status codes.
    pub fn classify(code: u16, reason: &str) -> Self {
        match reason {
            "AlreadyExists" => return Self::AlreadyExists,
            "NotFound" => return Self::NotFound,
            "Unauthorized" => return Self::Unauthorized,
            "Forbidden" => return Self::Forbidden,
            "TooManyRequests" | "ServerTimeout" | "Timeout" | "ServiceUnavailable"
            | "InternalError" => return Self::Transient,
            _ => {}
        }
        match code {
            404 => Self::NotFound,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            429 | 500 | 503 | 504 => Self::Transient,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Transient => "transient",
            Self::Other => "error",
        };
        f.write_str(s)
    }
}

/// A cluster API failure after classification.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind} ({code}): {message}")]
pub struct ApiError {
    /// Classification used for retry and idempotency
    pub kind: ApiErrorKind,
    /// HTTP status code, 0 when the request never got a response
    pub code: u16,
    /// Server (or transport) message
    pub message: String,
}

impl ApiError {
    /// Create an API error
    pub fn new(kind: ApiErrorKind, code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// 409 AlreadyExists
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::AlreadyExists, 409, message)
    }

    /// 404 NotFound
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, 404, message)
    }

    /// 503 ServiceUnavailable, a retryable failure
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Transient, 503, message)
    }

    /// 403 Forbidden
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Forbidden, 403, message)
    }

    /// Whether this failure is worth retrying
    pub fn is_transient(&self) -> bool {
        self.kind == ApiErrorKind::Transient
    }
}

/// Orchestration stage in which a run failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStage {
    /// Namespace create-if-absent
    EnsureNamespace,
    /// Service creation (before any VM)
    CreateService,
    /// Cloud-init secret creation
    CreateSecret,
    /// VirtualMachine creation fan-out
    CreateVm,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EnsureNamespace => "ensuring namespace",
            Self::CreateService => "creating service",
            Self::CreateSecret => "creating cloud-init secret",
            Self::CreateVm => "creating VM",
        };
        f.write_str(s)
    }
}

/// Main error type for virtwork operations
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster API call failed (already classified)
    #[error("{operation} {resource}: {source}")]
    Api {
        /// Verb that failed (e.g. "creating", "listing")
        operation: &'static str,
        /// Resource description, e.g. "VirtualMachine virtwork/virtwork-cpu-0"
        resource: String,
        /// Classified failure
        #[source]
        source: ApiError,
    },

    /// Caller cancelled while an operation was waiting or retrying
    #[error("cancelled while {operation}")]
    Cancelled {
        /// What was in progress
        operation: String,
    },

    /// Readiness deadline elapsed
    #[error("timed out after {timeout:?} waiting for VM {namespace}/{name} to become ready")]
    Timeout {
        /// VM name
        name: String,
        /// VM namespace
        namespace: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Transient failures persisted for every allowed attempt
    #[error("retries exhausted after {attempts} attempts, last error: {last}")]
    RetriesExhausted {
        /// Total attempts made
        attempts: u32,
        /// Error from the final attempt
        last: Box<Error>,
    },

    /// Unknown workload kind requested
    #[error("unknown workload {name:?}; available: {available}")]
    UnknownWorkload {
        /// Requested name
        name: String,
        /// Comma-separated sorted list of valid names
        available: String,
    },

    /// Orchestration stage failed; the run stops here
    #[error("{stage} {resource}: {source}")]
    Stage {
        /// Stage that failed
        stage: RunStage,
        /// Offending resource name
        resource: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// One or more VMs did not become ready
    #[error("{} of {total} VMs failed readiness check: {}", .failures.len(), .failures.join("; "))]
    ReadinessFailed {
        /// `<vm>: <cause>` per failed VM
        failures: Vec<String>,
        /// Number of VMs polled
        total: usize,
    },

    /// Invalid configuration or plan
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Audit store failure
    #[error("audit error: {message}")]
    Audit {
        /// Description of what failed
        message: String,
    },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a classified API failure with the operation and resource it hit
    pub fn api(operation: &'static str, resource: impl Into<String>, source: ApiError) -> Self {
        Self::Api {
            operation,
            resource: resource.into(),
            source,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an audit error
    pub fn audit(msg: impl Into<String>) -> Self {
        Self::Audit {
            message: msg.into(),
        }
    }

    /// Attach orchestration stage context
    pub fn at_stage(self, stage: RunStage, resource: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            resource: resource.into(),
            source: Box::new(self),
        }
    }

    /// The classified API failure, if this error carries one
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the retry loop should try again
    pub fn is_transient(&self) -> bool {
        self.api_error().is_some_and(ApiError::is_transient)
    }

    /// Whether the cluster reported the object missing
    pub fn is_not_found(&self) -> bool {
        self.api_error()
            .is_some_and(|e| e.kind == ApiErrorKind::NotFound)
    }

    /// Whether this is a cancellation, looking through stage and retry wrappers
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Stage { source, .. } => source.is_cancelled(),
            Self::RetriesExhausted { last, .. } => last.is_cancelled(),
            _ => false,
        }
    }
}
