//! Worker Autoscaler Operator
//!
//! Scales queue-draining worker deployments from live queue backlog.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! worker-autoscaler
//!
//! # Run with custom log level
//! RUST_LOG=debug worker-autoscaler
//! ```

use clap::Parser;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use worker_autoscaler::controllers::{parse_int_or_percent, ControllerConfig};
use worker_autoscaler::metrics::{self, ControllerMetrics};
use worker_autoscaler::queue::{BeanstalkService, QueueService, Queues, SqsService};
use worker_autoscaler::WorkerAutoscalerController;

/// Worker Autoscaler Operator
#[derive(Parser, Debug)]
#[command(name = "worker-autoscaler")]
#[command(version, about = "Kubernetes operator scaling workers from queue backlog")]
struct Args {
    /// Number of concurrent reconciler workers
    #[arg(long, default_value_t = 2)]
    threadiness: usize,

    /// Seconds between full re-syncs of every WorkerAutoscaler
    #[arg(long, default_value_t = 600)]
    resync_period: u64,

    /// Seconds to wait after a scale action before the next scale down
    #[arg(long, default_value_t = 600)]
    scale_down_delay: u64,

    /// maxDisruption applied to policies that do not set one
    #[arg(long, default_value = "100%")]
    default_max_disruption: String,

    /// Seconds between queue polls
    #[arg(long, default_value_t = 20)]
    queue_poll_interval: u64,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Metrics bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting Worker Autoscaler Operator");
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    // The default maxDisruption backs every policy that does not set one;
    // an unparsable default is a bootstrap error, not a runtime one.
    parse_int_or_percent(&args.default_max_disruption, 1, true)
        .map_err(|e| anyhow::anyhow!("invalid --default-max-disruption: {}", e))?;

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Queue drivers: beanstalkd is always available, SQS only when
    // credentials are configured.
    let mut services: Vec<Arc<dyn QueueService>> = vec![Arc::new(BeanstalkService::new())];
    match SqsService::from_env() {
        Ok(sqs) => services.push(Arc::new(sqs)),
        Err(err) => warn!("SQS queue service disabled: {}", err),
    }
    let queues = Queues::new(Duration::from_secs(args.queue_poll_interval), services);

    let controller_metrics = Arc::new(ControllerMetrics::new()?);
    let metrics_server = tokio::spawn(metrics::serve(
        args.metrics_bind_address.clone(),
        Arc::clone(&controller_metrics),
    ));

    let controller = Arc::new(WorkerAutoscalerController::new(
        client,
        queues,
        controller_metrics,
        ControllerConfig {
            threadiness: args.threadiness,
            resync_period: Duration::from_secs(args.resync_period),
            scale_down_delay: Duration::from_secs(args.scale_down_delay),
            default_max_disruption: args.default_max_disruption.clone(),
            namespace: if args.namespace.is_empty() {
                None
            } else {
                Some(args.namespace.clone())
            },
        },
    ));

    tokio::select! {
        result = controller.run() => {
            result?;
        }
        result = metrics_server => {
            match result {
                Ok(Err(e)) => error!("Metrics server error: {}", e),
                Err(e) => error!("Metrics server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Worker Autoscaler Operator shutting down");
    Ok(())
}
