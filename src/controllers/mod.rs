//! Controllers for the worker autoscaler operator
//!
//! The reconciler watches WorkerAutoscaler resources and converges each
//! policy's workload replica count with the desired count computed by the
//! scaling module.

pub mod scaling;
mod worker_autoscaler;

pub use scaling::{
    desired_workers, max_disruptable_workers, parse_int_or_percent, scale_operation,
    ScaleOperation, TOLERANCE,
};
pub use worker_autoscaler::{
    ControllerConfig, EventKind, ScalerEvent, WorkerAutoscalerController,
};
