//! Message channel between a portal and the pool serving it
//!
//! Every message crosses as a JSON string, so the two ends only share the
//! wire format, not Rust types or memory. Either end may live on another
//! thread.
//!
//! Portal to pool ([`PoolTask`]):
//!
//! ```text
//! {"type":"new","job":{"id":1,"priority":5,"method":"status","params":{}}}
//! {"type":"update","jobId":1,"priority":0}
//! {"type":"remove","jobId":1}
//! {"type":"close"}
//! ```
//!
//! Pool to portal ([`PoolResponse`]):
//!
//! ```text
//! {"id":1,"end":false,"data":{...}}
//! {"id":1,"end":true,"data":{...}}
//! {"id":1,"end":true,"error":{"kind":"guest","message":"..."}}
//! ```

use futures::channel::mpsc;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::{JobError, JobId, JobResult, Priority};

/// Errors that can occur while posting a message
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("message port closed")]
    Closed,

    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Job description carried by a `new` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: JobId,
    pub priority: Priority,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Control message from a portal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PoolTask {
    New {
        job: TaskSpec,
    },
    Update {
        #[serde(rename = "jobId")]
        job_id: JobId,
        priority: Priority,
    },
    Remove {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    Close,
}

/// Progress or outcome of a job, sent back to the portal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolResponse {
    pub id: JobId,
    pub end: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl PoolResponse {
    /// An intermediate message
    pub fn data(id: JobId, data: Value) -> Self {
        Self {
            id,
            end: false,
            data,
            error: None,
        }
    }

    /// The terminal message for `result`
    pub fn end(id: JobId, result: JobResult) -> Self {
        match result {
            Ok(data) => Self {
                id,
                end: true,
                data,
                error: None,
            },
            Err(error) => Self {
                id,
                end: true,
                data: Value::Null,
                error: Some(error),
            },
        }
    }

    /// Outcome carried by a terminal message
    pub fn into_result(self) -> JobResult {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

/// Create two connected ports
pub fn message_channel() -> (MessagePort, MessagePort) {
    let (left_tx, left_rx) = mpsc::unbounded();
    let (right_tx, right_rx) = mpsc::unbounded();
    (
        MessagePort::new(PortSender { tx: left_tx }, PortReceiver { rx: right_rx }),
        MessagePort::new(PortSender { tx: right_tx }, PortReceiver { rx: left_rx }),
    )
}

/// Sending half of a port
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<String>,
}

impl PortSender {
    pub fn post<T: Serialize>(&self, message: &T) -> Result<(), ChannelError> {
        let json = serde_json::to_string(message)?;
        self.tx.unbounded_send(json).map_err(|_| ChannelError::Closed)
    }

    /// Stop sending; the other end drains what is queued, then sees the end
    pub fn close(&self) {
        self.tx.close_channel();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a port
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl PortReceiver {
    /// Next message, `None` once the other end is gone
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Option<Result<T, serde_json::Error>> {
        let json = self.rx.next().await?;
        Some(serde_json::from_str(&json))
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// One end of a message channel
#[derive(Debug)]
pub struct MessagePort {
    sender: PortSender,
    receiver: PortReceiver,
}

impl MessagePort {
    fn new(sender: PortSender, receiver: PortReceiver) -> Self {
        Self { sender, receiver }
    }

    pub fn post<T: Serialize>(&self, message: &T) -> Result<(), ChannelError> {
        self.sender.post(message)
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Option<Result<T, serde_json::Error>> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}
