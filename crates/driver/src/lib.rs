//! Nimbus driver gateway.
//!
//! One call surface, `invoke(op, connection, payload)`, over two transports
//! selected at startup: REST, or a direct line-framed RPC channel. Both fold
//! transport and remote failures into [`DriverError`]. No retries here; retry
//! policy belongs to the caller.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use nimbus_core::DriverError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

pub mod model;
mod operation;
mod rest;
mod rpc;

pub use operation::{HttpMethod, Operation, Service};
pub use rest::RestTransport;
pub use rpc::{RpcConfig, RpcReply, RpcRequest, RpcTransport};

/// Deployment-level transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMethod {
    Rest,
    Rpc,
}

impl FromStr for CallMethod {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REST" => Ok(CallMethod::Rest),
            "RPC" | "GRPC" => Ok(CallMethod::Rpc),
            other => Err(DriverError::Config(format!("unknown driver call method '{}'", other))),
        }
    }
}

#[async_trait::async_trait]
pub trait DriverTransport: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Send the already-enveloped `body` and decode the JSON reply.
    async fn call(&self, op: &Operation, body: Option<Value>) -> Result<Value, DriverError>;
}

#[derive(Clone)]
pub struct DriverGateway {
    transport: Arc<dyn DriverTransport>,
}

impl DriverGateway {
    pub fn new(transport: Arc<dyn DriverTransport>) -> Self {
        Self { transport }
    }

    pub fn rest(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DriverError> {
        Ok(Self::new(Arc::new(RestTransport::new(base_url, timeout)?)))
    }

    pub fn rpc(config_path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(RpcTransport::new(config_path)))
    }

    pub fn from_method(
        method: CallMethod,
        rest_url: &str,
        rpc_config: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        match method {
            CallMethod::Rest => Self::rest(rest_url, timeout),
            CallMethod::Rpc => Ok(Self::rpc(rpc_config)),
        }
    }

    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }

    pub async fn invoke(&self, op: Operation, connection_name: &str, payload: Value) -> Result<Value, DriverError> {
        let t0 = Instant::now();
        let body = op.envelope(connection_name, payload);
        let res = self.transport.call(&op, body).await;
        let took = t0.elapsed();
        histogram!("driver_call_ms", took.as_secs_f64() * 1000.0);
        match &res {
            Ok(_) => {
                info!(op = %op, conn = %connection_name, transport = self.transport.kind(), took_ms = %took.as_millis(), "driver: call ok");
            }
            Err(e) => {
                counter!("driver_call_failed_total", 1u64);
                warn!(op = %op, conn = %connection_name, transport = self.transport.kind(), error = %e, "driver: call failed");
            }
        }
        res
    }

    /// [`DriverGateway::invoke`] decoding the reply into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        op: Operation,
        connection_name: &str,
        payload: Value,
    ) -> Result<T, DriverError> {
        let name = op.name();
        let v = self.invoke(op, connection_name, payload).await?;
        serde_json::from_value(v).map_err(|e| DriverError::Decode(format!("{} reply: {}", name, e)))
    }
}
