//! Method registry and axum router.

use crate::envelope::{RpcError, RpcRequest, RpcResponse, PARSE_ERROR};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

const ACCEPTED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/json;charset=UTF-8",
    "application/json-rpc",
];

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// A registry of `Service.Method` handlers served at `/rpc`.
#[derive(Default)]
pub struct RpcServer {
    methods: HashMap<String, Handler>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed method. The handler receives the deserialized single
    /// parameter and its result is serialized back.
    pub fn register<P, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |params: Value| {
            let handler = handler.clone();
            Box::pin(async move {
                let params: P = serde_json::from_value(params)
                    .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                let result = handler(params).await?;
                serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))
            })
        });
        self.methods.insert(name.to_string(), erased);
        self
    }

    /// Build the axum router serving the registry at `/rpc`.
    pub fn into_router(self) -> Router {
        let state = Arc::new(self);
        Router::new().route("/rpc", post(handle_rpc)).with_state(state)
    }

    async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        if request.jsonrpc != "2.0" {
            return RpcResponse::error(
                RpcError::invalid_request("expected jsonrpc: 2.0"),
                id,
            );
        }
        let handler = match self.methods.get(&request.method) {
            Some(h) => h.clone(),
            None => {
                return RpcResponse::error(RpcError::method_not_found(&request.method), id);
            }
        };
        debug!(method = %request.method, "dispatching rpc call");
        match handler(request.single_param()).await {
            Ok(result) => RpcResponse::result(result, id),
            Err(error) => RpcResponse::error(error, id),
        }
    }
}

fn content_type_accepted(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(header::CONTENT_TYPE) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let normalized = value.replace(' ', "");
    ACCEPTED_CONTENT_TYPES
        .iter()
        .any(|accepted| normalized.eq_ignore_ascii_case(accepted))
}

async fn handle_rpc(
    State(server): State<Arc<RpcServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !content_type_accepted(&headers) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            let response = RpcResponse::error(
                RpcError::new(PARSE_ERROR, format!("parse error: {e}")),
                Value::Null,
            );
            return Json(response).into_response();
        }
    };

    Json(server.dispatch(request).await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_router() -> Router {
        RpcServer::new()
            .register("Echo.Say", |text: String| async move { Ok::<_, RpcError>(text) })
            .register("Echo.Fail", |_: Value| async move {
                Err::<Value, _>(RpcError::new(100, "nope"))
            })
            .into_router()
    }

    fn rpc_request(content_type: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/rpc")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn response_json(response: Response) -> RpcResponse {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn dispatches_registered_method() {
        let request = rpc_request(
            "application/json",
            json!({"jsonrpc": "2.0", "method": "Echo.Say", "params": ["hi"], "id": 1}),
        );
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body.result, Some(json!("hi")));
        assert_eq!(body.id, json!(1));
    }

    #[tokio::test]
    async fn unknown_method_yields_error_object() {
        let request = rpc_request(
            "application/json-rpc",
            json!({"jsonrpc": "2.0", "method": "No.Such", "id": 2}),
        );
        let response = test_router().oneshot(request).await.unwrap();
        let body = response_json(response).await;
        assert_eq!(body.error.unwrap().code, crate::envelope::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_errors_carry_code_and_message() {
        let request = rpc_request(
            "application/json;charset=UTF-8",
            json!({"jsonrpc": "2.0", "method": "Echo.Fail", "params": [null], "id": 3}),
        );
        let response = test_router().oneshot(request).await.unwrap();
        let error = response_json(response).await.error.unwrap();
        assert_eq!(error.code, 100);
        assert_eq!(error.message, "nope");
    }

    #[tokio::test]
    async fn rejects_unknown_content_type() {
        let request = rpc_request("text/plain", json!({}));
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let request = Request::builder()
            .method("POST")
            .uri("/rpc")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        let error = response_json(response).await.error.unwrap();
        assert_eq!(error.code, PARSE_ERROR);
    }
}
