//! JSON-RPC client over HTTP.

use crate::envelope::{RpcError, RpcRequest, RpcResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors from RPC calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error calling {url}: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },

    /// The server returned a JSON-RPC error object.
    #[error("remote error: {0}")]
    Rpc(RpcError),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A client bound to one RPC endpoint.
pub struct RpcClient {
    url: String,
    http: reqwest::Client,
}

impl RpcClient {
    /// Bind to `http://<addr>/rpc`.
    pub fn new(addr: &str) -> Self {
        let url = if addr.starts_with("http://") || addr.starts_with("https://") {
            format!("{}/rpc", addr.trim_end_matches('/'))
        } else {
            format!("http://{addr}/rpc")
        };
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    /// Call `method` with a single by-position parameter.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, ClientError> {
        let id = Value::String(uuid::Uuid::new_v4().to_string());
        let request = RpcRequest::new(method, json!([params]), id);

        let response = self
            .http
            .post(&self.url)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: self.url.clone(),
                source,
            })?;

        let envelope: RpcResponse =
            response
                .json()
                .await
                .map_err(|source| ClientError::Transport {
                    url: self.url.clone(),
                    source,
                })?;

        if let Some(error) = envelope.error {
            return Err(ClientError::Rpc(error));
        }
        let result = envelope
            .result
            .ok_or_else(|| ClientError::Malformed("neither result nor error set".into()))?;
        serde_json::from_value(result).map_err(|e| ClientError::Malformed(e.to_string()))
    }
}
