//! Custom Resource Definitions for the worker autoscaler operator
//!
//! A single CRD is managed:
//! - WorkerAutoscaler: a queue-to-workload scaling policy

mod worker_autoscaler;

pub use worker_autoscaler::{WorkerAutoscaler, WorkerAutoscalerSpec, WorkerAutoscalerStatus};
