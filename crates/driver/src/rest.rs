//! REST transport. Status 200..=399 is success; anything else becomes
//! [`DriverError::Status`] with the response body kept verbatim.

use std::time::Duration;

use nimbus_core::DriverError;
use reqwest::{redirect, Client, Method, Url};
use serde_json::Value;
use tracing::debug;

use crate::operation::{HttpMethod, Operation};
use crate::DriverTransport;

pub struct RestTransport {
    client: Client,
    base_url: Url,
}

impl RestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DriverError> {
        let client = Client::builder()
            .timeout(timeout)
            // 3xx are reported as success, never followed
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| DriverError::Config(format!("building http client: {}", e)))?;
        let raw = base_url.into();
        let base_url = Url::parse(raw.trim_end_matches('/'))
            .map_err(|e| DriverError::Config(format!("invalid base url {}: {}", raw, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DriverError::Config(format!("invalid base url {}: cannot carry a path", raw)));
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Base URL with `segments` appended, each percent-escaped.
    pub fn url_for(&self, segments: &[String]) -> Result<Url, DriverError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DriverError::Config(format!("invalid base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn method(m: HttpMethod) -> Method {
    match m {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Empty success bodies decode to null.
pub(crate) fn decode_body(text: &str) -> Result<Value, DriverError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| DriverError::Decode(format!("{}: {}", e, text)))
}

#[async_trait::async_trait]
impl DriverTransport for RestTransport {
    fn kind(&self) -> &'static str {
        "rest"
    }

    async fn call(&self, op: &Operation, body: Option<Value>) -> Result<Value, DriverError> {
        let (m, segments) = op.rest_route();
        let url = self.url_for(&segments)?;
        debug!(op = %op, url = %url, "driver: rest request");
        // GET requests carry a JSON body too (connection name)
        let mut req = self.client.request(method(m), url.clone());
        if let Some(b) = &body {
            req = req.json(b);
        }
        let resp = req.send().await.map_err(|e| DriverError::Transport(format!("{} {}: {}", op, url, e)))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| DriverError::Transport(format!("reading body: {}", e)))?;
        if !(200..=399).contains(&status) {
            return Err(DriverError::Status { status, body: text });
        }
        decode_body(&text)
    }
}
