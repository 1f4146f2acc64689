use crate::{Result, status::StatusMap};
use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The API's acknowledgment of one sent unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub code: u16,
    #[serde(default)]
    pub error: String,
}

impl Response {
    pub fn new(code: u16, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }
}

/// Connection to the remote collection API as used by the sender.
///
/// `connect_once` and `disconnect_once` are idempotent: connecting while
/// connected and disconnecting while disconnected do nothing.
#[automock]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect_once(&self, tries: u32) -> Result<()>;

    async fn disconnect_once(&self);

    async fn send_bytes(&self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Wait up to `timeout` for the response to the last sent unit.
    async fn recv(&self, timeout: Duration) -> Result<Response>;

    fn status(&self) -> StatusMap;
}
