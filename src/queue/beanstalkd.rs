//! Beanstalkd queue driver
//!
//! Speaks the beanstalk text protocol directly: one `stats-tube` round trip
//! per poll. Mapping into the registry:
//! - `current-jobs-ready` -> backlog
//! - `total-jobs` deltas between polls -> messages sent per minute
//! - `current-jobs-reserved` -> busy workers (idle = current - reserved)
//!
//! Queue URIs look like `beanstalk://host:port/tube`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

use super::{driver_error, QueueService, QueueSpec, Queues, BEANSTALK_QUEUE_SERVICE};
use crate::error::Result;

const DEFAULT_PORT: u16 = 11300;
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
struct TubeStats {
    ready: i32,
    reserved: i32,
    total_jobs: u64,
}

struct TubeSample {
    total_jobs: u64,
    observed_at: Instant,
}

/// Driver for beanstalkd tubes.
pub struct BeanstalkService {
    samples: Mutex<HashMap<String, TubeSample>>,
}

impl BeanstalkService {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_stats(&self, uri: &str) -> Result<Option<TubeStats>> {
        let (host, port, tube) = parse_beanstalk_uri(uri)?;
        let io = async {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| driver_error(&tube, format!("connect {}:{}: {}", host, port, e)))?;
            let mut stream = BufReader::new(stream);
            stream
                .get_mut()
                .write_all(format!("stats-tube {}\r\n", tube).as_bytes())
                .await
                .map_err(|e| driver_error(&tube, e))?;

            let mut header = String::new();
            read_line(&mut stream, &mut header)
                .await
                .map_err(|e| driver_error(&tube, e))?;
            let header = header.trim_end();
            if header == "NOT_FOUND" {
                return Ok(None);
            }
            let len: usize = header
                .strip_prefix("OK ")
                .and_then(|n| n.trim().parse().ok())
                .ok_or_else(|| {
                    driver_error(&tube, format!("unexpected beanstalk reply: {}", header))
                })?;

            // Body is <len> bytes of YAML followed by a trailing CRLF.
            let mut body = vec![0u8; len + 2];
            stream
                .read_exact(&mut body)
                .await
                .map_err(|e| driver_error(&tube, e))?;
            let body = String::from_utf8_lossy(&body[..len]);
            parse_tube_stats(&body)
                .map(Some)
                .ok_or_else(|| driver_error(&tube, "incomplete stats-tube reply"))
        };

        tokio::time::timeout(POLL_TIMEOUT, io)
            .await
            .map_err(|_| driver_error(&tube, "stats-tube timed out"))?
    }

    /// Sent-per-minute from the cumulative `total-jobs` counter.
    fn sent_per_minute(&self, key: &str, total_jobs: u64) -> Option<f64> {
        let mut samples = self.samples.lock().unwrap();
        let now = Instant::now();
        let rate = samples.get(key).and_then(|prev| {
            let elapsed = now.duration_since(prev.observed_at).as_secs_f64();
            if elapsed <= 0.0 {
                return None;
            }
            let delta = total_jobs.saturating_sub(prev.total_jobs);
            Some(delta as f64 / elapsed * 60.0)
        });
        samples.insert(
            key.to_string(),
            TubeSample {
                total_jobs,
                observed_at: now,
            },
        );
        rate
    }
}

impl Default for BeanstalkService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueService for BeanstalkService {
    fn name(&self) -> &'static str {
        BEANSTALK_QUEUE_SERVICE
    }

    async fn poll(&self, key: &str, spec: &QueueSpec, queues: &Queues) {
        match self.fetch_stats(&spec.uri).await {
            Ok(Some(stats)) => {
                queues.set_messages(key, stats.ready);
                queues.set_idle_workers(
                    key,
                    (spec.current_workers - stats.reserved).max(0),
                );
                if let Some(rate) = self.sent_per_minute(key, stats.total_jobs) {
                    queues.set_messages_sent_per_minute(key, rate);
                }
                debug!(
                    key,
                    ready = stats.ready,
                    reserved = stats.reserved,
                    total = stats.total_jobs,
                    "polled tube"
                );
            }
            Ok(None) => {
                // Tube does not exist yet: nothing queued, nobody working.
                queues.set_messages(key, 0);
                queues.set_messages_sent_per_minute(key, 0.0);
                queues.set_idle_workers(key, spec.current_workers);
                self.samples.lock().unwrap().remove(key);
            }
            Err(err) => {
                warn!(key, error = %err, "beanstalk poll failed");
            }
        }
    }
}

async fn read_line(stream: &mut BufReader<TcpStream>, buf: &mut String) -> std::io::Result<()> {
    use tokio::io::AsyncBufReadExt;
    stream.read_line(buf).await?;
    Ok(())
}

fn parse_beanstalk_uri(uri: &str) -> Result<(String, u16, String)> {
    let parsed =
        Url::parse(uri).map_err(|e| driver_error(uri, format!("invalid beanstalk URI: {}", e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| driver_error(uri, "beanstalk URI has no host"))?
        .to_string();
    let port = parsed.port().unwrap_or(DEFAULT_PORT);
    let tube = parsed.path().trim_matches('/').to_string();
    if tube.is_empty() {
        return Err(driver_error(uri, "beanstalk URI names no tube"));
    }
    Ok((host, port, tube))
}

fn parse_tube_stats(body: &str) -> Option<TubeStats> {
    let mut ready = None;
    let mut reserved = None;
    let mut total_jobs = None;
    for line in body.lines() {
        let Some((k, v)) = line.split_once(':') else {
            continue;
        };
        let v = v.trim();
        match k.trim() {
            "current-jobs-ready" => ready = v.parse().ok(),
            "current-jobs-reserved" => reserved = v.parse().ok(),
            "total-jobs" => total_jobs = v.parse().ok(),
            _ => {}
        }
    }
    Some(TubeStats {
        ready: ready?,
        reserved: reserved?,
        total_jobs: total_jobs?,
    })
}
