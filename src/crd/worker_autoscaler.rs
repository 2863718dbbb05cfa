//! WorkerAutoscaler Custom Resource Definition
//!
//! Declares a scaling policy tying a message queue to a worker Deployment
//! (or ReplicaSet): replica bounds, the target backlog per worker, and an
//! optional per-job processing time that enables the velocity floor.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// WorkerAutoscaler is the Schema for the workerautoscalers API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "wpa.io",
    version = "v1",
    kind = "WorkerAutoscaler",
    namespaced,
    status = "WorkerAutoscalerStatus",
    shortname = "wpa",
    printcolumn = r#"{"name":"Min","type":"integer","jsonPath":".spec.minReplicas"}"#,
    printcolumn = r#"{"name":"Max","type":"integer","jsonPath":".spec.maxReplicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentReplicas"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Messages","type":"integer","jsonPath":".status.currentMessages"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAutoscalerSpec {
    /// Lower bound on worker replicas
    pub min_replicas: i32,

    /// Upper bound on worker replicas
    pub max_replicas: i32,

    /// Largest allowed single-step scale down, as an integer or a percentage
    /// of the current replica count (e.g. "2" or "10%"). Falls back to the
    /// controller-wide default when unset.
    #[serde(default)]
    pub max_disruption: Option<String>,

    /// URI of the queue the workers drain (e.g. an SQS queue URL or
    /// beanstalk://host:port/tube)
    #[serde(rename = "queueURI")]
    pub queue_uri: String,

    /// Name of the queue provider that serves this URI ("sqs", "beanstalkd")
    pub queue_service_name: String,

    /// Name of the worker Deployment to scale
    #[serde(default)]
    pub deployment_name: Option<String>,

    /// Name of the worker ReplicaSet to scale (alternative to deploymentName)
    #[serde(default)]
    pub replica_set_name: Option<String>,

    /// Queue backlog one worker is expected to absorb
    pub target_messages_per_worker: i32,

    /// Seconds a single worker takes to process one job. Enables the
    /// velocity floor; 0 or unset disables it.
    #[serde(default)]
    pub seconds_to_process_one_job: Option<f64>,
}

/// WorkerAutoscalerStatus reflects the last reconciled state
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAutoscalerStatus {
    /// Replicas the workload currently requests
    #[serde(default)]
    pub current_replicas: i32,

    /// Replicas the workload reports available
    #[serde(default)]
    pub available_replicas: i32,

    /// Replicas the controller last computed as desired
    #[serde(default)]
    pub desired_replicas: i32,

    /// Queue backlog at the last reconciliation
    #[serde(default)]
    pub current_messages: i32,

    /// RFC 3339 timestamp of the last scale action, used for the
    /// scale-down cooldown
    #[serde(default)]
    pub last_scale_time: Option<String>,
}

impl WorkerAutoscaler {
    /// The per-resource maxDisruption, or the controller-wide default.
    pub fn max_disruption<'a>(&'a self, default: &'a str) -> &'a str {
        self.spec.max_disruption.as_deref().unwrap_or(default)
    }

    /// secondsToProcessOneJob with the unset case normalized to 0.0
    /// (velocity floor disabled).
    pub fn seconds_to_process_one_job(&self) -> f64 {
        self.spec.seconds_to_process_one_job.unwrap_or(0.0)
    }
}
