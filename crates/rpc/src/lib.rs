//! JSON-RPC 2.0 over HTTP.
//!
//! Small shared surface for the RPC daemons: envelope types, an axum-based
//! method registry mounted at `/rpc`, and a reqwest client. Methods are
//! namespaced `Service.Method` (`Gate.Submit`, `X509.Get`, ...).
//!
//! Accepted content types: `application/json`,
//! `application/json;charset=UTF-8` and `application/json-rpc`; anything else
//! is rejected with 415 before the body is touched.

mod client;
mod envelope;
mod server;

pub use client::{ClientError, RpcClient};
pub use envelope::{RpcError, RpcRequest, RpcResponse, PARSE_ERROR};
pub use server::RpcServer;
