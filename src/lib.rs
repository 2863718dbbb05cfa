//! Worker Autoscaler Operator
//!
//! A Kubernetes operator that scales queue-draining worker Deployments (or
//! ReplicaSets) from live queue state. Each WorkerAutoscaler resource ties a
//! queue URI to a workload with replica bounds and a target backlog per
//! worker; the controller polls the queue, computes the desired replica
//! count under hysteresis and disruption constraints, and writes it back.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: wpa.io/v1
//! kind: WorkerAutoscaler
//! metadata:
//!   name: otpsms
//! spec:
//!   minReplicas: 0
//!   maxReplicas: 20
//!   maxDisruption: "10%"
//!   queueURI: beanstalk://beanstalkd.queues.svc:11300/otpsms
//!   queueServiceName: beanstalkd
//!   deploymentName: otpsms-worker
//!   targetMessagesPerWorker: 200
//!   secondsToProcessOneJob: 0.3
//! ```

pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod workqueue;

pub use controllers::{ControllerConfig, WorkerAutoscalerController};
pub use crd::{WorkerAutoscaler, WorkerAutoscalerSpec, WorkerAutoscalerStatus};
pub use error::{OperatorError, Result};
