//! Incus REST API client.
//!
//! Talks to the local Incus daemon over its unix socket. Every response is
//! the standard Incus envelope (`sync`, `async` or `error`); asynchronous
//! requests return an operation path that is then waited on.
//!
//! Reference: https://linuxcontainers.org/incus/docs/main/rest-api/

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

/// Slack added to the HTTP deadline of an operation wait, on top of the
/// server-side wait timeout.
const WAIT_SLACK: Duration = Duration::from_secs(5);

/// Errors from the Incus API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Api { status: 404, .. })
    }

    /// Whether the server-side message contains `needle`.
    pub fn message_contains(&self, needle: &str) -> bool {
        matches!(self, ApiError::Api { message, .. } if message.contains(needle))
    }
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Standard Incus response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    error: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Background operation as returned by the operations endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Subset of `GET /1.0`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub auth: String,
}

/// Request body for `POST /1.0/instances`.
#[derive(Debug, Serialize)]
pub struct InstancesPost {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub instance_type: String,
    pub source: InstanceSource,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    pub start: bool,
}

#[derive(Debug, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub alias: String,
}

/// Request body for `POST /1.0/instances/{name}/exec`.
#[derive(Debug, Serialize)]
pub struct ExecPost {
    pub command: Vec<String>,
    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,
    pub interactive: bool,
    #[serde(rename = "record-output")]
    pub record_output: bool,
}

/// Request body for `PUT /1.0/instances/{name}/state`.
#[derive(Debug, Serialize)]
pub struct StatePut {
    pub action: String,
    /// Seconds to wait; -1 waits forever.
    pub timeout: i64,
    pub force: bool,
}

/// Subset of the full instance view (`?recursion=1`).
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceFull {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub state: Option<InstanceRuntimeState>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceRuntimeState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network: Option<BTreeMap<String, InstanceNetwork>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceNetwork {
    #[serde(default)]
    pub addresses: Vec<InstanceNetworkAddress>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceNetworkAddress {
    pub family: String,
    pub address: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub scope: String,
}

/// Incus API client for unix socket communication.
pub struct IncusClient {
    socket_path: String,
    client: Client<UnixConnector>,
    request_timeout: Duration,
}

impl IncusClient {
    /// Create a new client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P, request_timeout: Duration) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        Self {
            socket_path,
            client: Client::unix(),
            request_timeout,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    /// Get server information.
    pub async fn server_info(&self) -> Result<ServerInfo, ApiError> {
        let envelope = self
            .request::<()>(Method::GET, "/1.0", None, self.request_timeout)
            .await?;
        Ok(serde_json::from_value(envelope.metadata)?)
    }

    /// Create an instance. Returns the operation path.
    pub async fn create_instance(&self, body: &InstancesPost) -> Result<String, ApiError> {
        let envelope = self
            .request(Method::POST, "/1.0/instances", Some(body), self.request_timeout)
            .await?;
        Ok(envelope.operation)
    }

    /// Run a command in an instance. Returns the operation path.
    pub async fn exec(&self, name: &str, body: &ExecPost) -> Result<String, ApiError> {
        let path = format!("/1.0/instances/{name}/exec");
        let envelope = self
            .request(Method::POST, &path, Some(body), self.request_timeout)
            .await?;
        Ok(envelope.operation)
    }

    /// Change an instance's run state. Returns the operation path.
    pub async fn update_state(&self, name: &str, body: &StatePut) -> Result<String, ApiError> {
        let path = format!("/1.0/instances/{name}/state");
        let envelope = self
            .request(Method::PUT, &path, Some(body), self.request_timeout)
            .await?;
        Ok(envelope.operation)
    }

    /// Delete an instance. Returns the operation path.
    pub async fn delete_instance(&self, name: &str) -> Result<String, ApiError> {
        let path = format!("/1.0/instances/{name}");
        let envelope = self
            .request::<()>(Method::DELETE, &path, None, self.request_timeout)
            .await?;
        Ok(envelope.operation)
    }

    /// Get the full instance view including runtime state.
    pub async fn get_instance_full(&self, name: &str) -> Result<InstanceFull, ApiError> {
        let path = format!("/1.0/instances/{name}?recursion=1");
        self.get(&path).await
    }

    /// Wait for an operation to finish.
    ///
    /// `None` waits without a deadline. An operation that ends in any
    /// status other than success is returned as an API error.
    pub async fn wait_operation(
        &self,
        operation: &str,
        timeout: Option<Duration>,
    ) -> Result<Operation, ApiError> {
        let (path, http_timeout) = wait_request(operation, timeout);

        let envelope = self
            .request::<()>(Method::GET, &path, None, http_timeout)
            .await?;
        let op: Operation = serde_json::from_value(envelope.metadata)?;

        if op.status_code != 200 {
            return Err(ApiError::Api {
                status: op.status_code,
                message: if op.err.is_empty() {
                    format!("operation {} ended with status {}", op.id, op.status)
                } else {
                    op.err
                },
            });
        }

        Ok(op)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let envelope = self
            .request::<()>(Method::GET, path, None, self.request_timeout)
            .await?;
        Ok(serde_json::from_value(envelope.metadata)?)
    }

    /// Perform a request and unwrap the response envelope.
    async fn request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<Envelope, ApiError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Request to Incus API");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(body) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(body)?)
            }
            None => Body::empty(),
        };
        let request = builder.body(body)?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let body = hyper::body::aggregate(response.into_body()).await?;
            Ok::<_, ApiError>((status, body))
        };

        let (status, body) = if timeout == Duration::MAX {
            exchange.await?
        } else {
            tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| ApiError::Timeout(timeout))??
        };

        let envelope: Envelope = match serde_json::from_reader(body.reader()) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(ApiError::Api {
                    status: status.as_u16(),
                    message: status.to_string(),
                })
            }
        };

        if envelope.kind == "error" || !status.is_success() {
            let status = if envelope.error_code != 0 {
                envelope.error_code
            } else {
                status.as_u16()
            };
            error!(status, message = %envelope.error, path = path, "Incus API error");
            return Err(ApiError::Api {
                status,
                message: envelope.error,
            });
        }

        Ok(envelope)
    }
}

/// Path and HTTP deadline for waiting on `operation`.
///
/// `Duration::MAX` as the deadline means no client-side timeout.
fn wait_request(operation: &str, timeout: Option<Duration>) -> (String, Duration) {
    match timeout {
        Some(t) => (
            format!("{operation}/wait?timeout={}", t.as_secs().max(1)),
            t.saturating_add(WAIT_SLACK),
        ),
        None => (format!("{operation}/wait?timeout=-1"), Duration::MAX),
    }
}
