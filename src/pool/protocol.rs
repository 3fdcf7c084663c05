//! Line protocol spoken with guest instances
//!
//! One JSON value per line in each direction. The host sends JSON-RPC
//! requests. The guest answers with zero or more intermediate messages
//! (objects without a `jsonrpc` field) followed by one final response.
//! Before its first request every guest announces itself with a bootstrap
//! line, `{"ready":true}` or `{"ready":false,"error":"..."}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::{JobError, JobId};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: JobId,
    method: &'a str,
    params: &'a Value,
}

/// Serialize a request, line terminator included
pub fn encode_request(id: JobId, method: &str, params: &Value) -> Result<String, JobError> {
    let request = Request {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    };
    let mut line = serde_json::to_string(&request).map_err(|e| JobError::Protocol {
        reason: format!("unencodable request: {}", e),
    })?;
    line.push('\n');
    Ok(line)
}

/// One line from a guest, classified
#[derive(Debug, Clone, PartialEq)]
pub enum GuestMessage {
    /// Final response carrying `result`
    Result(Value),
    /// Final response carrying an error envelope
    Error(String),
    /// Anything without a `jsonrpc` field
    Intermediate(Value),
}

impl GuestMessage {
    pub fn is_final(&self) -> bool {
        !matches!(self, GuestMessage::Intermediate(_))
    }
}

/// Parse and classify one output line
pub fn classify(line: &str) -> Result<GuestMessage, JobError> {
    let value: Value = serde_json::from_str(line).map_err(|e| JobError::Protocol {
        reason: format!("malformed line from guest: {}", e),
    })?;

    if value.get("jsonrpc").is_none() {
        return Ok(GuestMessage::Intermediate(value));
    }
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = match error.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        };
        return Ok(GuestMessage::Error(message));
    }
    Ok(GuestMessage::Result(value.get("result").cloned().unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct Bootstrap {
    ready: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Check the bootstrap line; `Err` carries the reason the guest is unusable
pub fn parse_bootstrap(line: &str) -> Result<(), String> {
    let bootstrap: Bootstrap =
        serde_json::from_str(line).map_err(|e| format!("bad bootstrap line {:?}: {}", line, e))?;
    if bootstrap.ready {
        Ok(())
    } else {
        Err(bootstrap
            .error
            .unwrap_or_else(|| "guest reported not ready".to_string()))
    }
}
