//! WorkerAutoscaler Controller
//!
//! Watches WorkerAutoscaler resources and reconciles the replica count of
//! each policy's worker Deployment (or ReplicaSet) against the desired count
//! computed from live queue state. Change events flow through a
//! deduplicating work queue drained by a small fixed pool of workers, so
//! reconciliations for one policy never overlap.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use super::scaling::{self, ScaleOperation};
use crate::crd::{WorkerAutoscaler, WorkerAutoscalerStatus};
use crate::error::{OperatorError, Result};
use crate::metrics::ControllerMetrics;
use crate::queue::{Queues, UNSYNCED_QUEUE_MESSAGES};
use crate::workqueue::WorkQueue;

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts for one workload update before giving up on this tick.
const UPDATE_RETRIES: u32 = 5;
const UPDATE_BASE_BACKOFF: Duration = Duration::from_millis(100);

/// What happened to a WorkerAutoscaler resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Add => write!(f, "add"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// One work-queue item: a policy key (`namespace/name`) and what happened to
/// it. Deduplication covers the full tuple, so an update and a delete for
/// the same key queue independently and drain in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScalerEvent {
    pub key: String,
    pub kind: EventKind,
}

/// Startup configuration for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of reconciler workers draining the work queue.
    pub threadiness: usize,
    /// How often every cached policy is re-enqueued for reconciliation.
    pub resync_period: Duration,
    /// Minimum wall-time gap after a scale action before the next scale down.
    pub scale_down_delay: Duration,
    /// maxDisruption used when the policy does not set one. Validated at
    /// startup.
    pub default_max_disruption: String,
    /// Namespace to watch; `None` watches all namespaces.
    pub namespace: Option<String>,
}

#[derive(Clone)]
struct CacheStores {
    scalers: Store<WorkerAutoscaler>,
    deployments: Store<Deployment>,
    replica_sets: Store<ReplicaSet>,
}

/// Controller context shared by the reconciler workers.
pub struct WorkerAutoscalerController {
    client: Client,
    queues: Queues,
    metrics: Arc<ControllerMetrics>,
    workqueue: WorkQueue<ScalerEvent>,
    config: ControllerConfig,
}

impl WorkerAutoscalerController {
    pub fn new(
        client: Client,
        queues: Queues,
        metrics: Arc<ControllerMetrics>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            queues,
            metrics,
            workqueue: WorkQueue::new(),
            config,
        }
    }

    /// Run the controller until the process receives a shutdown signal.
    ///
    /// Sets up the watch caches, waits for them to sync, then drains the
    /// work queue with `threadiness` workers. Returns an error if the caches
    /// never sync.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("Starting WorkerAutoscaler controller");

        let scaler_api: Api<WorkerAutoscaler> = self.namespaced_or_all();
        let deployment_api: Api<Deployment> = self.namespaced_or_all();
        let replica_set_api: Api<ReplicaSet> = self.namespaced_or_all();

        let (scaler_store, scaler_writer) = reflector::store();
        let (deployment_store, deployment_writer) = reflector::store();
        let (replica_set_store, replica_set_writer) = reflector::store();

        // Dispatcher: apply scaler watch events to the cache and translate
        // them into work-queue items.
        let dispatcher = {
            let workqueue = self.workqueue.clone();
            let events = reflector::reflector(
                scaler_writer,
                watcher(scaler_api, watcher::Config::default()).default_backoff(),
            );
            tokio::spawn(async move {
                let mut known: HashSet<String> = HashSet::new();
                futures::pin_mut!(events);
                while let Some(event) = events.next().await {
                    match event {
                        Ok(watcher::Event::Applied(obj)) => {
                            enqueue_applied(&workqueue, &mut known, &obj);
                        }
                        Ok(watcher::Event::Restarted(objs)) => {
                            for obj in &objs {
                                enqueue_applied(&workqueue, &mut known, obj);
                            }
                        }
                        Ok(watcher::Event::Deleted(obj)) => {
                            let key = object_key(&obj);
                            known.remove(&key);
                            workqueue.add(ScalerEvent {
                                key,
                                kind: EventKind::Delete,
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "worker autoscaler watch error");
                        }
                    }
                }
            })
        };

        // Workload caches only need to stay fresh for reads.
        let deployment_reflector = tokio::spawn(
            reflector::reflector(
                deployment_writer,
                watcher(deployment_api, watcher::Config::default()).default_backoff(),
            )
            .for_each(|event| async {
                if let Err(err) = event {
                    warn!(error = %err, "deployment watch error");
                }
            }),
        );
        let replica_set_reflector = tokio::spawn(
            reflector::reflector(
                replica_set_writer,
                watcher(replica_set_api, watcher::Config::default()).default_backoff(),
            )
            .for_each(|event| async {
                if let Err(err) = event {
                    warn!(error = %err, "replicaset watch error");
                }
            }),
        );

        info!("Waiting for caches to sync");
        let synced = tokio::time::timeout(CACHE_SYNC_TIMEOUT, async {
            scaler_store
                .wait_until_ready()
                .await
                .map_err(|e| OperatorError::CacheSync(e.to_string()))?;
            deployment_store
                .wait_until_ready()
                .await
                .map_err(|e| OperatorError::CacheSync(e.to_string()))
        })
        .await;
        match synced {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(OperatorError::CacheSync(
                    "timed out waiting for initial list".to_string(),
                ))
            }
        }

        // Periodic resync: re-drive every cached policy so drift between the
        // cluster and the registry heals without a change event.
        let resync = {
            let workqueue = self.workqueue.clone();
            let store = scaler_store.clone();
            let period = self.config.resync_period;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    for scaler in store.state() {
                        workqueue.add(ScalerEvent {
                            key: object_key(scaler.as_ref()),
                            kind: EventKind::Update,
                        });
                    }
                }
            })
        };

        info!(threadiness = self.config.threadiness, "Starting workers");
        let stores = CacheStores {
            scalers: scaler_store,
            deployments: deployment_store,
            replica_sets: replica_set_store,
        };
        let mut workers = Vec::new();
        for _ in 0..self.config.threadiness.max(1) {
            let controller = Arc::clone(&self);
            let stores = stores.clone();
            workers.push(tokio::spawn(async move {
                controller.worker_loop(stores).await;
            }));
        }

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
        }

        info!("Shutting down workers");
        self.workqueue.shutdown();
        for worker in workers {
            let _ = worker.await;
        }
        dispatcher.abort();
        deployment_reflector.abort();
        replica_set_reflector.abort();
        resync.abort();
        self.queues.shutdown();

        Ok(())
    }

    fn namespaced_or_all<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match self.config.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn worker_loop(&self, stores: CacheStores) {
        while let Some(event) = self.workqueue.get().await {
            match self.sync(&event, &stores).await {
                Ok(()) => self.workqueue.forget(&event),
                Err(err) => {
                    warn!(key = %event.key, error = %err, "error syncing, requeueing");
                    self.workqueue.requeue_with_backoff(event.clone());
                }
            }
            self.workqueue.done(&event);
        }
    }

    /// Reconcile one dequeued event: refresh the queue registry, compute the
    /// desired replicas, actuate, publish metrics and status.
    async fn sync(&self, event: &ScalerEvent, stores: &CacheStores) -> Result<()> {
        let started = Instant::now();

        let Some((namespace, name)) = split_key(&event.key) else {
            warn!(key = %event.key, "invalid resource key");
            return Ok(());
        };

        let scaler_ref = ObjectRef::<WorkerAutoscaler>::new(name).within(namespace);
        let Some(scaler) = stores.scalers.get(&scaler_ref) else {
            // Deleted from the cluster: tear the registry record down and
            // stop processing.
            warn!(key = %event.key, "worker autoscaler no longer exists");
            self.queues.delete(namespace, name);
            return Ok(());
        };

        let deployment_name = scaler.spec.deployment_name.as_deref().unwrap_or("");
        let replica_set_name = scaler.spec.replica_set_name.as_deref().unwrap_or("");
        let (current_workers, available_workers) = if !deployment_name.is_empty() {
            let workload_ref = ObjectRef::<Deployment>::new(deployment_name).within(namespace);
            match stores.deployments.get(&workload_ref) {
                Some(deployment) => (
                    deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
                    deployment
                        .status
                        .as_ref()
                        .and_then(|s| s.available_replicas)
                        .unwrap_or(0),
                ),
                None => {
                    return Err(OperatorError::WorkloadMissing {
                        kind: "deployment",
                        name: deployment_name.to_string(),
                        namespace: namespace.to_string(),
                    })
                }
            }
        } else if !replica_set_name.is_empty() {
            let workload_ref = ObjectRef::<ReplicaSet>::new(replica_set_name).within(namespace);
            match stores.replica_sets.get(&workload_ref) {
                Some(replica_set) => (
                    replica_set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
                    replica_set
                        .status
                        .as_ref()
                        .and_then(|s| s.available_replicas)
                        .unwrap_or(0),
                ),
                None => {
                    return Err(OperatorError::WorkloadMissing {
                        kind: "replicaset",
                        name: replica_set_name.to_string(),
                        namespace: namespace.to_string(),
                    })
                }
            }
        } else {
            // Absorb instead of requeueing: the next update to the resource
            // re-drives it once the user fixes the reference.
            warn!(key = %event.key, "deployment or replicaset name must be specified");
            return Ok(());
        };

        let seconds_to_process_one_job = scaler.seconds_to_process_one_job();

        match event.kind {
            EventKind::Add | EventKind::Update => {
                if let Err(err) = self.queues.add(
                    namespace,
                    name,
                    &scaler.spec.queue_uri,
                    &scaler.spec.queue_service_name,
                    current_workers,
                    seconds_to_process_one_job,
                ) {
                    if err.is_misconfiguration() {
                        // The user has to fix the policy; requeueing would
                        // spin.
                        warn!(key = %event.key, error = %err, "unable to sync queue");
                        return Ok(());
                    }
                    return Err(err);
                }
            }
            EventKind::Delete => {
                self.queues.delete(namespace, name);
                return Ok(());
            }
        }

        let Some(queue) = self.queues.get_queue_info(namespace, name) else {
            return Ok(());
        };
        if queue.messages == UNSYNCED_QUEUE_MESSAGES {
            warn!(
                queue = %queue.display_name,
                "queue not initialized, waiting for first poll to complete"
            );
            return Ok(());
        }

        let max_disruption = scaler.max_disruption(&self.config.default_max_disruption);
        let desired_workers = match scaling::desired_workers(
            &queue.display_name,
            queue.messages,
            queue.messages_sent_per_minute,
            seconds_to_process_one_job,
            scaler.spec.target_messages_per_worker,
            current_workers,
            queue.idle_workers,
            scaler.spec.min_replicas,
            scaler.spec.max_replicas,
            max_disruption,
        ) {
            Ok(desired) => desired,
            Err(err) => {
                warn!(key = %event.key, error = %err, "invalid maxDisruption, skipping");
                return Ok(());
            }
        };
        debug!(
            queue = %queue.display_name,
            messages = queue.messages,
            current = current_workers,
            desired = desired_workers,
            "reconciling"
        );

        self.metrics.record_queue_state(
            name,
            namespace,
            &queue.display_name,
            queue.messages,
            queue.messages_sent_per_minute,
            queue.idle_workers,
            current_workers,
            desired_workers,
            available_workers,
        );

        let mut last_scale_time = scaler
            .status
            .as_ref()
            .and_then(|s| s.last_scale_time.clone());
        let operation = scaling::scale_operation(
            &queue.display_name,
            desired_workers,
            current_workers,
            last_scale_time.as_deref().and_then(scaling::parse_scale_time),
            self.config.scale_down_delay,
        );

        if matches!(operation, ScaleOperation::ScaleUp | ScaleOperation::ScaleDown) {
            if !deployment_name.is_empty() {
                self.update_deployment(namespace, deployment_name, desired_workers)
                    .await;
            } else {
                self.update_replica_set(namespace, replica_set_name, desired_workers)
                    .await;
            }
            last_scale_time = Some(Utc::now().to_rfc3339());
        }
        debug!(queue = %queue.display_name, operation = %operation, "scale operation");

        self.update_status(
            &scaler,
            namespace,
            name,
            desired_workers,
            current_workers,
            available_workers,
            queue.messages,
            last_scale_time,
        )
        .await?;

        self.metrics.record_loop(name, namespace, started.elapsed());
        Ok(())
    }

    /// Set the Deployment's replicas with an optimistic retry on conflicts.
    async fn update_deployment(&self, namespace: &str, deployment_name: &str, replicas: i32) {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        for attempt in 0..UPDATE_RETRIES {
            let mut deployment = match api.get(deployment_name).await {
                Ok(deployment) => deployment,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    warn!(
                        deployment = deployment_name,
                        namespace, "deployment was not found"
                    );
                    return;
                }
                Err(err) => {
                    error!(
                        deployment = deployment_name,
                        error = %err,
                        "failed to get deployment"
                    );
                    return;
                }
            };
            if let Some(spec) = deployment.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
            match api
                .replace(deployment_name, &PostParams::default(), &deployment)
                .await
            {
                Ok(_) => {
                    info!(deployment = deployment_name, replicas, "scaled deployment");
                    return;
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!(
                        deployment = deployment_name,
                        attempt, "conflict updating deployment, retrying"
                    );
                    tokio::time::sleep(jittered(UPDATE_BASE_BACKOFF * 2u32.pow(attempt))).await;
                }
                Err(err) => {
                    error!(
                        deployment = deployment_name,
                        error = %err,
                        "failed to update deployment"
                    );
                    return;
                }
            }
        }
        error!(
            deployment = deployment_name,
            "failed to update deployment: retries exhausted"
        );
    }

    /// Set the ReplicaSet's replicas with an optimistic retry on conflicts.
    async fn update_replica_set(&self, namespace: &str, replica_set_name: &str, replicas: i32) {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        for attempt in 0..UPDATE_RETRIES {
            let mut replica_set = match api.get(replica_set_name).await {
                Ok(replica_set) => replica_set,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    warn!(
                        replicaset = replica_set_name,
                        namespace, "replicaset was not found"
                    );
                    return;
                }
                Err(err) => {
                    error!(
                        replicaset = replica_set_name,
                        error = %err,
                        "failed to get replicaset"
                    );
                    return;
                }
            };
            if let Some(spec) = replica_set.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
            match api
                .replace(replica_set_name, &PostParams::default(), &replica_set)
                .await
            {
                Ok(_) => {
                    info!(replicaset = replica_set_name, replicas, "scaled replicaset");
                    return;
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!(
                        replicaset = replica_set_name,
                        attempt, "conflict updating replicaset, retrying"
                    );
                    tokio::time::sleep(jittered(UPDATE_BASE_BACKOFF * 2u32.pow(attempt))).await;
                }
                Err(err) => {
                    error!(
                        replicaset = replica_set_name,
                        error = %err,
                        "failed to update replicaset"
                    );
                    return;
                }
            }
        }
        error!(
            replicaset = replica_set_name,
            "failed to update replicaset: retries exhausted"
        );
    }

    /// Write the status sub-resource, suppressed when nothing changed.
    #[allow(clippy::too_many_arguments)]
    async fn update_status(
        &self,
        scaler: &WorkerAutoscaler,
        namespace: &str,
        name: &str,
        desired_replicas: i32,
        current_replicas: i32,
        available_replicas: i32,
        current_messages: i32,
        last_scale_time: Option<String>,
    ) -> Result<()> {
        let stored = scaler.status.clone().unwrap_or_default();
        if status_up_to_date(
            &stored,
            current_replicas,
            available_replicas,
            desired_replicas,
            current_messages,
            &last_scale_time,
        ) {
            debug!(namespace, name, "status is already up to date");
            return Ok(());
        }

        let status = WorkerAutoscalerStatus {
            current_replicas,
            available_replicas,
            desired_replicas,
            current_messages,
            last_scale_time,
        };
        let api: Api<WorkerAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                debug!(namespace, name, "updated status");
                Ok(())
            }
            Err(err) => {
                error!(namespace, name, error = %err, "error updating status");
                Err(err.into())
            }
        }
    }
}

/// Structural equality over the tracked status fields.
fn status_up_to_date(
    stored: &WorkerAutoscalerStatus,
    current_replicas: i32,
    available_replicas: i32,
    desired_replicas: i32,
    current_messages: i32,
    last_scale_time: &Option<String>,
) -> bool {
    stored.current_replicas == current_replicas
        && stored.available_replicas == available_replicas
        && stored.desired_replicas == desired_replicas
        && stored.current_messages == current_messages
        && scale_times_equal(&stored.last_scale_time, last_scale_time)
}

/// Timestamp equality that tolerates formatting differences between what
/// was written and what the API server echoes back.
fn scale_times_equal(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            match (scaling::parse_scale_time(a), scaling::parse_scale_time(b)) {
                (Some(a), Some(b)) => a == b,
                _ => a == b,
            }
        }
        _ => false,
    }
}

fn object_key(scaler: &WorkerAutoscaler) -> String {
    format!(
        "{}/{}",
        scaler.namespace().unwrap_or_default(),
        scaler.name_any()
    )
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Some((namespace, name))
        }
        _ => None,
    }
}

fn enqueue_applied(
    workqueue: &WorkQueue<ScalerEvent>,
    known: &mut HashSet<String>,
    scaler: &WorkerAutoscaler,
) {
    let key = object_key(scaler);
    let kind = if known.insert(key.clone()) {
        EventKind::Add
    } else {
        EventKind::Update
    };
    workqueue.add(ScalerEvent { key, kind });
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(0.5 + rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(
        current: i32,
        available: i32,
        desired: i32,
        messages: i32,
        last_scale_time: Option<&str>,
    ) -> WorkerAutoscalerStatus {
        WorkerAutoscalerStatus {
            current_replicas: current,
            available_replicas: available,
            desired_replicas: desired,
            current_messages: messages,
            last_scale_time: last_scale_time.map(str::to_string),
        }
    }

    #[test]
    fn test_status_write_suppressed_when_unchanged() {
        let stored = status(10, 9, 10, 250, Some("2025-06-01T10:00:00Z"));
        assert!(status_up_to_date(
            &stored,
            10,
            9,
            10,
            250,
            &Some("2025-06-01T10:00:00Z".to_string())
        ));
    }

    #[test]
    fn test_status_write_issued_on_any_field_change() {
        let stored = status(10, 9, 10, 250, None);
        assert!(!status_up_to_date(&stored, 11, 9, 10, 250, &None));
        assert!(!status_up_to_date(&stored, 10, 8, 10, 250, &None));
        assert!(!status_up_to_date(&stored, 10, 9, 12, 250, &None));
        assert!(!status_up_to_date(&stored, 10, 9, 10, 0, &None));
        assert!(!status_up_to_date(
            &stored,
            10,
            9,
            10,
            250,
            &Some("2025-06-01T10:00:00Z".to_string())
        ));
    }

    #[test]
    fn test_scale_times_equal_across_formats() {
        // The API server echoes +00:00 for timestamps written with Z.
        assert!(scale_times_equal(
            &Some("2025-06-01T10:00:00Z".to_string()),
            &Some("2025-06-01T10:00:00+00:00".to_string())
        ));
        assert!(scale_times_equal(&None, &None));
        assert!(!scale_times_equal(
            &Some("2025-06-01T10:00:00Z".to_string()),
            &None
        ));
        assert!(!scale_times_equal(
            &Some("2025-06-01T10:00:00Z".to_string()),
            &Some("2025-06-01T10:05:00Z".to_string())
        ));
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("default/app"), Some(("default", "app")));
        assert_eq!(split_key("no-slash"), None);
        assert_eq!(split_key("/app"), None);
        assert_eq!(split_key("ns/"), None);
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Add.to_string(), "add");
        assert_eq!(EventKind::Update.to_string(), "update");
        assert_eq!(EventKind::Delete.to_string(), "delete");
    }

    #[test]
    fn test_enqueue_applied_distinguishes_add_from_update() {
        let workqueue = WorkQueue::new();
        let mut known = HashSet::new();
        let scaler: WorkerAutoscaler = serde_json::from_str(
            r#"{
                "apiVersion": "wpa.io/v1",
                "kind": "WorkerAutoscaler",
                "metadata": {"name": "otpsms", "namespace": "default"},
                "spec": {
                    "minReplicas": 0,
                    "maxReplicas": 10,
                    "queueURI": "beanstalk://beanstalkd:11300/otpsms",
                    "queueServiceName": "beanstalkd",
                    "deploymentName": "otpsms-worker",
                    "targetMessagesPerWorker": 200
                }
            }"#,
        )
        .unwrap();

        enqueue_applied(&workqueue, &mut known, &scaler);
        enqueue_applied(&workqueue, &mut known, &scaler);
        // First sighting is an add, the second an update; both queue because
        // the tuples differ.
        assert_eq!(workqueue.len(), 2);
    }
}
