//! Queue registry, poller fabric and provider drivers
//!
//! The [`Queues`] registry keeps one live record per scaling policy with the
//! last observed backlog, sender velocity and idle-worker count. A poller
//! task per record invokes the policy's [`QueueService`] driver on a fixed
//! cadence; the reconciler only ever reads the registry.

mod beanstalkd;
mod registry;
mod sqs;

pub use beanstalkd::BeanstalkService;
pub use registry::{QueueInfo, QueueSpec, Queues, UNSYNCED_QUEUE_MESSAGES};
pub use sqs::SqsService;

use async_trait::async_trait;

use crate::error::OperatorError;

/// Registered name of the SQS driver.
pub const SQS_QUEUE_SERVICE: &str = "sqs";
/// Registered name of the beanstalkd driver.
pub const BEANSTALK_QUEUE_SERVICE: &str = "beanstalkd";

/// Tag a driver-side failure with the queue it came from.
pub(crate) fn driver_error(queue: &str, detail: impl std::fmt::Display) -> OperatorError {
    OperatorError::QueueDriver {
        queue: queue.to_string(),
        detail: detail.to_string(),
    }
}

/// A pluggable queue provider.
///
/// `poll` observes the queue named by `spec.uri` and publishes what it saw
/// back into the registry via [`Queues::set_messages`],
/// [`Queues::set_messages_sent_per_minute`] and [`Queues::set_idle_workers`].
/// Errors stay inside the driver: a failed poll logs and leaves the record
/// at its previous values.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Provider kind this driver serves ("sqs", "beanstalkd", ...).
    fn name(&self) -> &'static str;

    /// Observe the queue once and write the results into the registry.
    async fn poll(&self, key: &str, spec: &QueueSpec, queues: &Queues);
}
