//! Amazon SQS queue driver
//!
//! Polls `GetQueueAttributes` (JSON protocol) on the queue URL with
//! SigV4-signed requests. Mapping into the registry:
//! - `ApproximateNumberOfMessages` -> backlog
//! - `ApproximateNumberOfMessagesNotVisible` -> in-flight work; idle workers
//!   are only reported while the backlog is empty
//! - sent-per-minute is estimated from enqueue deltas between polls (an
//!   EWMA; messages consumed between two polls are not observable here)
//!
//! Credentials come from the conventional `AWS_*` environment variables.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use super::{driver_error, QueueService, QueueSpec, Queues, SQS_QUEUE_SERVICE};
use crate::error::{OperatorError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Smoothing factor for the enqueue-rate estimate.
const RATE_EWMA_ALPHA: f64 = 0.3;

struct QueueSample {
    depth: i64,
    observed_at: Instant,
    rate_per_minute: f64,
}

struct QueueAttributes {
    visible: i32,
    not_visible: i32,
}

/// Driver for SQS queues.
pub struct SqsService {
    http: reqwest::Client,
    region: String,
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    samples: Mutex<HashMap<String, QueueSample>>,
}

impl SqsService {
    /// Build the driver from the conventional environment variables.
    pub fn from_env() -> Result<Self> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| OperatorError::Bootstrap("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| OperatorError::Bootstrap("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        let region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| "us-east-1".to_string());
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OperatorError::Bootstrap(e.to_string()))?;
        Ok(Self {
            http,
            region,
            access_key,
            secret_key,
            session_token,
            samples: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch_attributes(&self, queue_url: &str) -> Result<QueueAttributes> {
        let parsed = Url::parse(queue_url)
            .map_err(|e| driver_error(queue_url, format!("invalid queue URL: {}", e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| driver_error(queue_url, "queue URL has no host"))?
            .to_string();
        let region = region_from_host(&host).unwrap_or_else(|| self.region.clone());
        let endpoint = format!("{}://{}/", parsed.scheme(), host);

        let body = serde_json::json!({
            "QueueUrl": queue_url,
            "AttributeNames": [
                "ApproximateNumberOfMessages",
                "ApproximateNumberOfMessagesNotVisible",
            ],
        })
        .to_string();
        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-amz-json-1.0".to_string(),
        );
        headers.insert("host".to_string(), host.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(token) = &self.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }
        headers.insert(
            "x-amz-target".to_string(),
            "AmazonSQS.GetQueueAttributes".to_string(),
        );

        let authorization = sigv4_authorization(
            "POST",
            "/",
            "",
            &headers,
            body.as_bytes(),
            &region,
            "sqs",
            &amz_date,
            &self.access_key,
            &self.secret_key,
        );

        let mut request = self.http.post(&endpoint).body(body);
        for (name, value) in &headers {
            if name != "host" {
                request = request.header(name.as_str(), value);
            }
        }
        let response = request
            .header("authorization", authorization)
            .send()
            .await
            .map_err(|e| driver_error(queue_url, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(driver_error(
                queue_url,
                format!("GetQueueAttributes returned {}: {}", status, detail),
            ));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| driver_error(queue_url, e))?;
        let attributes = &value["Attributes"];
        let visible = attribute_i32(attributes, "ApproximateNumberOfMessages").ok_or_else(|| {
            driver_error(queue_url, "response missing ApproximateNumberOfMessages")
        })?;
        let not_visible =
            attribute_i32(attributes, "ApproximateNumberOfMessagesNotVisible").unwrap_or(0);
        Ok(QueueAttributes {
            visible,
            not_visible,
        })
    }

    /// EWMA of positive queue-depth deltas, per minute.
    fn sent_per_minute(&self, key: &str, depth: i64) -> Option<f64> {
        let mut samples = self.samples.lock().unwrap();
        let now = Instant::now();
        match samples.get(key) {
            None => {
                samples.insert(
                    key.to_string(),
                    QueueSample {
                        depth,
                        observed_at: now,
                        rate_per_minute: 0.0,
                    },
                );
                None
            }
            Some(prev) => {
                let elapsed = now.duration_since(prev.observed_at).as_secs_f64();
                if elapsed <= 0.0 {
                    return Some(prev.rate_per_minute);
                }
                let sample = (depth - prev.depth).max(0) as f64 / elapsed * 60.0;
                let rate = RATE_EWMA_ALPHA * sample + (1.0 - RATE_EWMA_ALPHA) * prev.rate_per_minute;
                samples.insert(
                    key.to_string(),
                    QueueSample {
                        depth,
                        observed_at: now,
                        rate_per_minute: rate,
                    },
                );
                Some(rate)
            }
        }
    }
}

#[async_trait]
impl QueueService for SqsService {
    fn name(&self) -> &'static str {
        SQS_QUEUE_SERVICE
    }

    async fn poll(&self, key: &str, spec: &QueueSpec, queues: &Queues) {
        match self.fetch_attributes(&spec.uri).await {
            Ok(attrs) => {
                queues.set_messages(key, attrs.visible);
                let idle = if attrs.visible > 0 {
                    0
                } else {
                    (spec.current_workers - attrs.not_visible).max(0)
                };
                queues.set_idle_workers(key, idle);
                let depth = attrs.visible as i64 + attrs.not_visible as i64;
                if let Some(rate) = self.sent_per_minute(key, depth) {
                    queues.set_messages_sent_per_minute(key, rate);
                }
                debug!(
                    key,
                    visible = attrs.visible,
                    not_visible = attrs.not_visible,
                    "polled queue"
                );
            }
            Err(err) => {
                warn!(key, error = %err, "sqs poll failed");
            }
        }
    }
}

fn attribute_i32(attributes: &serde_json::Value, name: &str) -> Option<i32> {
    attributes[name].as_str().and_then(|s| s.parse().ok())
}

/// Region embedded in a queue host like `sqs.ap-south-1.amazonaws.com`.
fn region_from_host(host: &str) -> Option<String> {
    let mut parts = host.split('.');
    if parts.next()? != "sqs" {
        return None;
    }
    parts.next().map(str::to_string)
}

#[allow(clippy::too_many_arguments)]
fn sigv4_authorization(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: &BTreeMap<String, String>,
    payload: &[u8],
    region: &str,
    service: &str,
    amz_date: &str,
    access_key: &str,
    secret_key: &str,
) -> String {
    let date = &amz_date[..8];
    let signed_headers = headers
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri,
        canonical_query,
        canonical_headers,
        signed_headers,
        hex_sha256(payload)
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let mut key = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes());
    key = hmac_sha256(&key, region.as_bytes());
    key = hmac_sha256(&key, service.as_bytes());
    key = hmac_sha256(&key, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        access_key, scope, signed_headers, signature
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
