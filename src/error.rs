//! Failure modes of the autoscaling control loop
//!
//! Errors split along how the reconciler reacts to them: misconfigurations
//! are logged and dropped (the user has to fix the policy), everything else
//! is retriable and goes back on the work queue.

use std::fmt;

pub type Result<T> = std::result::Result<T, OperatorError>;

#[derive(Debug)]
pub enum OperatorError {
    /// A request against the Kubernetes API failed.
    KubeApi(String),
    /// A policy names a queue service no registered driver serves.
    UnsupportedQueueService { service: String },
    /// A maxDisruption expression cannot be applied.
    InvalidMaxDisruption { expr: String, reason: String },
    /// The workload a policy points at is absent from the watch cache.
    WorkloadMissing {
        kind: &'static str,
        name: String,
        namespace: String,
    },
    /// A queue driver could not observe its queue this poll.
    QueueDriver { queue: String, detail: String },
    /// The watch caches never became ready.
    CacheSync(String),
    /// The operator cannot start with the given configuration.
    Bootstrap(String),
}

impl OperatorError {
    /// Whether retrying without a policy change can ever succeed. The
    /// reconciler forgets misconfigured items instead of requeueing them.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            OperatorError::UnsupportedQueueService { .. }
                | OperatorError::InvalidMaxDisruption { .. }
        )
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(detail) => {
                write!(f, "kubernetes api request failed: {detail}")
            }
            OperatorError::UnsupportedQueueService { service } => {
                write!(f, "no queue driver is registered for service {service:?}")
            }
            OperatorError::InvalidMaxDisruption { expr, reason } => {
                write!(f, "maxDisruption {expr:?} cannot be applied: {reason}")
            }
            OperatorError::WorkloadMissing {
                kind,
                name,
                namespace,
            } => {
                write!(f, "{kind} {name} not found in namespace {namespace}")
            }
            OperatorError::QueueDriver { queue, detail } => {
                write!(f, "polling queue {queue} failed: {detail}")
            }
            OperatorError::CacheSync(detail) => {
                write!(f, "watch caches never became ready: {detail}")
            }
            OperatorError::Bootstrap(detail) => {
                write!(f, "operator cannot start: {detail}")
            }
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}
