//! Signed CloudStack API gateway
//!
//! Every command is a signed GET against the API endpoint. Commands that
//! answer with a `jobid` are polled through `queryAsyncJobResult` until the
//! job finishes or the job timeout elapses, so callers only ever see the
//! terminal result.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use capstack_config::Credentials;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

type HmacSha1 = Hmac<Sha1>;

const JOB_PENDING: u64 = 0;
const JOB_SUCCEEDED: u64 = 1;
const JOB_FAILED: u64 = 2;

/// One API command with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    command: String,
    params: BTreeMap<String, String>,
}

impl ApiRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn opt_param<V: ToString>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    /// Indexed map parameter, e.g. `tags[0].key=...&tags[0].value=...`
    pub fn map_param(mut self, name: &str, entries: &[(&str, &str)]) -> Self {
        for (index, (key, value)) in entries.iter().enumerate() {
            self.params.insert(format!("{}[{}].key", name, index), key.to_string());
            self.params.insert(format!("{}[{}].value", name, index), value.to_string());
        }
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Transport to the CloudStack API
///
/// Returns the unwrapped `<command>response` object, or the `jobresult` of
/// an async command.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn invoke(&self, request: ApiRequest) -> Result<Value>;
}

/// Connection settings for [`HttpGateway`]
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub verify_ssl: bool,

    /// Per-request transport timeout
    pub request_timeout: Duration,

    /// Upper bound on waiting for an async job
    pub job_timeout: Duration,

    pub poll_interval: Duration,
}

impl GatewayConfig {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            api_url: credentials.api_url.clone(),
            api_key: credentials.api_key.clone(),
            secret_key: credentials.secret_key.clone(),
            verify_ssl: credentials.verify_ssl,
            request_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_timeouts(mut self, request_timeout: Duration, job_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        if !config.verify_ssl {
            tracing::warn!("TLS certificate verification disabled for {}", config.api_url);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Query string with the `signature` parameter appended
    pub fn signed_query(&self, request: &ApiRequest) -> Result<String> {
        let mut params: Vec<(&str, &str)> = request
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        params.push(("command", request.command.as_str()));
        params.push(("apiKey", self.config.api_key.as_str()));
        params.push(("response", "json"));
        params.sort_by_key(|(k, _)| k.to_lowercase());

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signature = sign(&query, &self.config.secret_key)?;
        Ok(format!("{}&signature={}", query, urlencoding::encode(&signature)))
    }

    async fn send(&self, request: &ApiRequest) -> Result<Value> {
        let url = format!("{}?{}", self.config.api_url, self.signed_query(request)?);
        tracing::debug!("CloudStack call: {} {:?}", request.command, request.params);

        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_response(&request.command, status, &body)
    }

    async fn wait_for_job(&self, command: &str, job_id: &str) -> Result<Value> {
        let started = Instant::now();
        let poll = ApiRequest::new("queryAsyncJobResult").param("jobid", job_id);

        loop {
            let job = self.send(&poll).await?;
            let status = job.get("jobstatus").and_then(Value::as_u64).unwrap_or(JOB_PENDING);

            match status {
                JOB_SUCCEEDED => {
                    tracing::debug!("Job {} ({}) finished in {:?}", job_id, command, started.elapsed());
                    return Ok(job.get("jobresult").cloned().unwrap_or(Value::Null));
                }
                JOB_FAILED => {
                    let result = job.get("jobresult").cloned().unwrap_or(Value::Null);
                    return Err(GatewayError::JobFailed {
                        job_id: job_id.to_string(),
                        code: result.get("errorcode").and_then(Value::as_u64).unwrap_or(0) as u32,
                        message: result
                            .get("errortext")
                            .and_then(Value::as_str)
                            .unwrap_or("job failed without error text")
                            .to_string(),
                    });
                }
                _ => {}
            }

            if started.elapsed() + self.config.poll_interval > self.config.job_timeout {
                return Err(GatewayError::JobTimeout {
                    job_id: job_id.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn invoke(&self, request: ApiRequest) -> Result<Value> {
        let response = self.send(&request).await?;

        match response.get("jobid").and_then(Value::as_str) {
            Some(job_id) => {
                let job_id = job_id.to_string();
                tracing::debug!("{} started async job {}", request.command, job_id);
                self.wait_for_job(&request.command, &job_id).await
            }
            None => Ok(response),
        }
    }
}

/// HMAC-SHA1 over the lower-cased query, base64 encoded
pub fn sign(query: &str, secret_key: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret_key.as_bytes())
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    mac.update(query.to_lowercase().as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Unwrap `{"<command>response": {...}}` and classify failures
fn parse_response(command: &str, status: u16, body: &str) -> Result<Value> {
    let wrapper = format!("{}response", command.to_lowercase());
    let payload = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        let object = json.as_object()?;
        object
            .get(&wrapper)
            .or_else(|| object.get("errorresponse"))
            .or_else(|| object.values().next())
            .cloned()
    });

    let error_code = payload
        .as_ref()
        .and_then(|p| p.get("errorcode"))
        .and_then(Value::as_u64);
    if let Some(code) = error_code {
        return Err(GatewayError::Api {
            code: code as u32,
            message: payload
                .as_ref()
                .and_then(|p| p.get("errortext"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    match status {
        200..=299 => payload.ok_or_else(|| {
            GatewayError::Decode(format!("{} response has no {} object", command, wrapper))
        }),
        429 | 500..=599 => Err(GatewayError::Unavailable {
            status,
            body: truncate(body),
        }),
        _ => Err(GatewayError::Http {
            status,
            body: truncate(body),
        }),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(256).collect()
}
