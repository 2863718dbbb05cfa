//! Concurrent registry of per-policy queue records and their pollers

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::QueueService;
use crate::error::{OperatorError, Result};

/// Sentinel backlog value for a record that has never been populated by its
/// poller. The reconciler must skip scaling decisions while it is present.
pub const UNSYNCED_QUEUE_MESSAGES: i32 = -1;

/// Snapshot of the policy fields a driver needs to interpret a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    /// Queue URI from the policy (provider-specific form).
    pub uri: String,
    /// Replicas the workload currently requests, for idle-worker math.
    pub current_workers: i32,
    /// Per-job processing time; 0.0 when the policy does not set it.
    pub seconds_to_process_one_job: f64,
}

/// What the reconciler reads for one policy.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub display_name: String,
    pub messages: i32,
    pub messages_sent_per_minute: f64,
    pub idle_workers: i32,
}

struct QueueRecord {
    display_name: String,
    messages: i32,
    messages_sent_per_minute: f64,
    idle_workers: i32,
    service_name: String,
    spec: QueueSpec,
}

/// Process-wide mapping from policy key (`namespace/name`) to a live queue
/// record. Cheap to clone; all clones share the same records and pollers.
#[derive(Clone)]
pub struct Queues {
    records: Arc<RwLock<HashMap<String, QueueRecord>>>,
    pollers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    services: Arc<HashMap<&'static str, Arc<dyn QueueService>>>,
    poll_interval: Duration,
}

impl Queues {
    pub fn new(poll_interval: Duration, services: Vec<Arc<dyn QueueService>>) -> Self {
        let services = services
            .into_iter()
            .map(|s| (s.name(), s))
            .collect::<HashMap<_, _>>();
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            pollers: Arc::new(Mutex::new(HashMap::new())),
            services: Arc::new(services),
            poll_interval,
        }
    }

    /// Register a policy's queue, starting a poller for it.
    ///
    /// Idempotent per key: when the URI and provider are unchanged only the
    /// mutable spec fields (`current_workers`, `seconds_to_process_one_job`)
    /// are refreshed and the existing poller keeps running, so observed
    /// backlog survives replica changes. A changed URI or provider tears the
    /// record down and starts over from `UNSYNCED`.
    pub fn add(
        &self,
        namespace: &str,
        name: &str,
        uri: &str,
        queue_service_name: &str,
        current_workers: i32,
        seconds_to_process_one_job: f64,
    ) -> Result<()> {
        let key = policy_key(namespace, name);
        let service = self
            .services
            .get(queue_service_name)
            .cloned()
            .ok_or_else(|| OperatorError::UnsupportedQueueService {
                service: queue_service_name.to_string(),
            })?;

        {
            let mut records = self.records.write().unwrap();
            if let Some(record) = records.get_mut(&key) {
                if record.spec.uri == uri && record.service_name == queue_service_name {
                    record.spec.current_workers = current_workers;
                    record.spec.seconds_to_process_one_job = seconds_to_process_one_job;
                    return Ok(());
                }
                debug!(key = %key, "queue spec changed, restarting poller");
                records.remove(&key);
            }
            records.insert(
                key.clone(),
                QueueRecord {
                    display_name: display_queue_name(uri),
                    messages: UNSYNCED_QUEUE_MESSAGES,
                    messages_sent_per_minute: 0.0,
                    idle_workers: 0,
                    service_name: queue_service_name.to_string(),
                    spec: QueueSpec {
                        uri: uri.to_string(),
                        current_workers,
                        seconds_to_process_one_job,
                    },
                },
            );
        }

        let poller = {
            let queues = self.clone();
            let key = key.clone();
            let interval = self.poll_interval;
            tokio::spawn(async move {
                loop {
                    let Some(spec) = queues.spec_snapshot(&key) else {
                        break;
                    };
                    service.poll(&key, &spec, &queues).await;
                    tokio::time::sleep(interval).await;
                }
            })
        };
        if let Some(old) = self.pollers.lock().unwrap().insert(key.clone(), poller) {
            old.abort();
        }
        info!(key = %key, service = queue_service_name, "started queue poller");
        Ok(())
    }

    /// Remove a policy's record and cancel its poller. Idempotent.
    pub fn delete(&self, namespace: &str, name: &str) {
        let key = policy_key(namespace, name);
        let removed = self.records.write().unwrap().remove(&key).is_some();
        if let Some(poller) = self.pollers.lock().unwrap().remove(&key) {
            poller.abort();
        }
        if removed {
            info!(key = %key, "removed queue record");
        }
    }

    /// The registry view the reconciler consumes. `None` when the policy has
    /// no record yet, which the caller treats as a silent skip.
    pub fn get_queue_info(&self, namespace: &str, name: &str) -> Option<QueueInfo> {
        let key = policy_key(namespace, name);
        let records = self.records.read().unwrap();
        records.get(&key).map(|r| QueueInfo {
            display_name: r.display_name.clone(),
            messages: r.messages,
            messages_sent_per_minute: r.messages_sent_per_minute,
            idle_workers: r.idle_workers,
        })
    }

    pub fn set_messages(&self, key: &str, messages: i32) {
        if let Some(record) = self.records.write().unwrap().get_mut(key) {
            record.messages = messages;
        }
    }

    pub fn set_messages_sent_per_minute(&self, key: &str, rate: f64) {
        if let Some(record) = self.records.write().unwrap().get_mut(key) {
            record.messages_sent_per_minute = rate;
        }
    }

    pub fn set_idle_workers(&self, key: &str, idle_workers: i32) {
        if let Some(record) = self.records.write().unwrap().get_mut(key) {
            record.idle_workers = idle_workers;
        }
    }

    /// Cancel every poller and drop all records.
    pub fn shutdown(&self) {
        for (_, poller) in self.pollers.lock().unwrap().drain() {
            poller.abort();
        }
        self.records.write().unwrap().clear();
    }

    fn spec_snapshot(&self, key: &str) -> Option<QueueSpec> {
        self.records
            .read()
            .unwrap()
            .get(key)
            .map(|r| r.spec.clone())
    }
}

fn policy_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Human-friendly queue name: the last path segment of the URI.
fn display_queue_name(uri: &str) -> String {
    if let Ok(parsed) = url::Url::parse(uri) {
        if let Some(segments) = parsed.path_segments() {
            if let Some(last) = segments.filter(|s| !s.is_empty()).last() {
                return last.to_string();
            }
        }
    }
    uri.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(uri)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Driver that publishes fixed values on every poll.
    struct StaticService {
        messages: i32,
        rate: f64,
        idle: i32,
    }

    #[async_trait]
    impl QueueService for StaticService {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn poll(&self, key: &str, _spec: &QueueSpec, queues: &Queues) {
            queues.set_messages(key, self.messages);
            queues.set_messages_sent_per_minute(key, self.rate);
            queues.set_idle_workers(key, self.idle);
        }
    }

    fn test_queues(messages: i32, rate: f64, idle: i32) -> Queues {
        Queues::new(
            Duration::from_millis(5),
            vec![Arc::new(StaticService {
                messages,
                rate,
                idle,
            })],
        )
    }

    #[tokio::test]
    async fn test_unknown_service_rejected() {
        let queues = test_queues(0, 0.0, 0);
        let err = queues
            .add("default", "app", "q://host/q1", "no-such-provider", 1, 0.0)
            .unwrap_err();
        assert!(matches!(
            err,
            OperatorError::UnsupportedQueueService { ref service } if service == "no-such-provider"
        ));
        assert!(err.is_misconfiguration());
        assert!(queues.get_queue_info("default", "app").is_none());
    }

    #[tokio::test]
    async fn test_record_unsynced_until_first_poll() {
        let queues = Queues::new(
            // Long interval: the first poll still runs immediately.
            Duration::from_secs(3600),
            vec![Arc::new(StaticService {
                messages: 42,
                rate: 6.0,
                idle: 1,
            })],
        );
        queues
            .add("default", "app", "q://host/q1", "static", 3, 0.5)
            .unwrap();

        // Poller publishes on its first tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = queues.get_queue_info("default", "app").unwrap();
        assert_eq!(info.messages, 42);
        assert_eq!(info.messages_sent_per_minute, 6.0);
        assert_eq!(info.idle_workers, 1);
        assert_eq!(info.display_name, "q1");
        queues.shutdown();
    }

    #[tokio::test]
    async fn test_add_refreshes_spec_in_place() {
        let queues = test_queues(7, 0.0, 0);
        queues
            .add("default", "app", "q://host/q1", "static", 3, 0.5)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queues.get_queue_info("default", "app").unwrap().messages, 7);

        // Same URI and provider: observed state survives a replica change.
        queues
            .add("default", "app", "q://host/q1", "static", 9, 0.5)
            .unwrap();
        let info = queues.get_queue_info("default", "app").unwrap();
        assert_eq!(info.messages, 7);
        assert_eq!(
            queues.spec_snapshot("default/app").unwrap().current_workers,
            9
        );
        queues.shutdown();
    }

    #[tokio::test]
    async fn test_add_with_new_uri_resets_record() {
        let queues = Queues::new(
            Duration::from_secs(3600),
            vec![Arc::new(StaticService {
                messages: 7,
                rate: 0.0,
                idle: 0,
            })],
        );
        queues
            .add("default", "app", "q://host/q1", "static", 3, 0.0)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queues.get_queue_info("default", "app").unwrap().messages, 7);

        queues
            .add("default", "app", "q://host/q2", "static", 3, 0.0)
            .unwrap();
        let info = queues.get_queue_info("default", "app").unwrap();
        assert_eq!(info.display_name, "q2");
        // The replacement poller repopulates the fresh record.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queues.get_queue_info("default", "app").unwrap().messages, 7);
        queues.shutdown();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let queues = test_queues(1, 0.0, 0);
        queues
            .add("default", "app", "q://host/q1", "static", 1, 0.0)
            .unwrap();
        queues.delete("default", "app");
        assert!(queues.get_queue_info("default", "app").is_none());
        queues.delete("default", "app");
        assert!(queues.get_queue_info("default", "app").is_none());
    }

    #[tokio::test]
    async fn test_setters_ignore_missing_key() {
        let queues = test_queues(0, 0.0, 0);
        // A cancelled poller writing after delete must be a no-op.
        queues.set_messages("default/gone", 5);
        queues.set_messages_sent_per_minute("default/gone", 1.0);
        queues.set_idle_workers("default/gone", 2);
        assert!(queues.get_queue_info("default", "gone").is_none());
    }

    #[test]
    fn test_display_queue_name() {
        assert_eq!(
            display_queue_name("https://sqs.ap-south-1.amazonaws.com/123456789012/otpsms"),
            "otpsms"
        );
        assert_eq!(
            display_queue_name("beanstalk://beanstalkd.queues.svc:11300/emails"),
            "emails"
        );
        assert_eq!(display_queue_name("plain-name"), "plain-name");
    }
}
