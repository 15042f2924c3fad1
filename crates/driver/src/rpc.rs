//! Direct-call transport: newline-framed JSON over TCP.
//!
//! Each call loads the YAML config, opens a channel, sends one request line
//! `{"method", "payload"}` (payload is a JSON string) and reads one reply line
//! `{"result", "error"}`. The channel closes when the call returns, on every path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nimbus_core::DriverError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use crate::operation::Operation;
use crate::rest::decode_body;
use crate::DriverTransport;

const MAX_LINE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// `host:port` of the driver's RPC listener.
    pub target: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    120
}

impl RpcConfig {
    pub fn load(path: &Path) -> Result<Self, DriverError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("reading {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&raw).map_err(|e| DriverError::Config(format!("parsing {}: {}", path.display(), e)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub payload: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct RpcTransport {
    config_path: PathBuf,
}

impl RpcTransport {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self { config_path: config_path.into() }
    }

    async fn exchange(&self, conf: &RpcConfig, line: String) -> Result<String, DriverError> {
        let connect = TcpStream::connect(&conf.target);
        let stream = tokio::time::timeout(Duration::from_secs(conf.connect_timeout_secs), connect)
            .await
            .map_err(|_| DriverError::Transport(format!("connect to {} timed out", conf.target)))?
            .map_err(|e| DriverError::Transport(format!("connect to {}: {}", conf.target, e)))?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
        framed.send(line).await.map_err(|e| DriverError::Transport(format!("send: {}", e)))?;
        let reply = tokio::time::timeout(Duration::from_secs(conf.call_timeout_secs), framed.next())
            .await
            .map_err(|_| DriverError::Transport(format!("call to {} timed out", conf.target)))?;
        match reply {
            Some(Ok(line)) => Ok(line),
            Some(Err(e)) => Err(DriverError::Transport(format!("recv: {}", e))),
            None => Err(DriverError::Transport(format!("{} closed the channel without a reply", conf.target))),
        }
    }
}

#[async_trait::async_trait]
impl DriverTransport for RpcTransport {
    fn kind(&self) -> &'static str {
        "rpc"
    }

    async fn call(&self, op: &Operation, body: Option<Value>) -> Result<Value, DriverError> {
        let method = op
            .rpc_method()
            .ok_or_else(|| DriverError::Unsupported(format!("{} has no rpc method", op)))?;
        let conf = RpcConfig::load(&self.config_path)?;
        let payload = match body {
            Some(b) => serde_json::to_string(&b).map_err(|e| DriverError::Decode(e.to_string()))?,
            None => String::new(),
        };
        let req = RpcRequest { method: method.to_string(), payload };
        let line = serde_json::to_string(&req).map_err(|e| DriverError::Decode(e.to_string()))?;
        debug!(op = %op, target = %conf.target, "driver: rpc request");

        let raw = self.exchange(&conf, line).await?;
        let reply: RpcReply =
            serde_json::from_str(&raw).map_err(|e| DriverError::Decode(format!("rpc reply: {}: {}", e, raw)))?;
        if let Some(err) = reply.error.filter(|e| !e.is_empty()) {
            return Err(DriverError::Remote(err));
        }
        decode_body(reply.result.as_deref().unwrap_or(""))
    }
}
