//! HTTP transport to the collection API.
//!
//! A "connection" is a `reqwest::Client` that has answered a `GET` on the
//! API's ping path. Each spooled unit is POSTed as-is and the HTTP status
//! plus body are kept as the pending [`Response`] until the sender asks for
//! it.

use crate::{Result, error::transport_error};
use async_trait::async_trait;
use dbagent_pipeline::{
    Error as PipelineError, Result as PipelineResult,
    connector::{Connector, Dialer},
    status::{StatusHandle, StatusMap, StatusTable},
    transport::{Response, Transport},
};
use reqwest::{Client, header::CONTENT_TYPE};
use serde::Deserialize;
use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use url::Url;

pub const STATUS_KEY: &str = "data-client";
pub const API_KEY_HEADER: &str = "X-Api-Key";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens clients against one API endpoint.
#[derive(Debug, Clone)]
pub struct ApiDialer {
    url: Url,
    ping_url: Url,
    api_key: String,
}

impl ApiDialer {
    pub fn new(url: &str, ping_path: &str, api_key: impl Into<String>) -> Result<Self> {
        let url = Url::parse(url)?;
        let ping_url = url.join(ping_path)?;
        Ok(Self {
            url,
            ping_url,
            api_key: api_key.into(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn ping_url(&self) -> &Url {
        &self.ping_url
    }
}

#[async_trait]
impl Dialer for ApiDialer {
    type Conn = Client;

    fn target(&self) -> String {
        self.url.to_string()
    }

    async fn open(&self) -> PipelineResult<Client> {
        Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(transport_error)
    }

    async fn ping(&self, conn: &Client) -> PipelineResult<()> {
        conn.get(self.ping_url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(transport_error)?;
        Ok(())
    }

    async fn close(&self, conn: Client) {
        drop(conn);
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

/// Error text of a response body: the `error` field of a JSON body, or the
/// raw body otherwise.
fn error_text(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.error.is_empty() => parsed.error,
        _ => body.trim().to_string(),
    }
}

pub struct HttpTransport {
    connector: AsyncMutex<Connector<ApiDialer>>,
    pending: Mutex<Option<Response>>,
    status: StatusHandle,
}

impl HttpTransport {
    pub fn new(dialer: ApiDialer, max_backoff: Duration, table: &StatusTable) -> Self {
        let status = table.handle(STATUS_KEY);
        status.update("Disconnected");
        Self {
            connector: AsyncMutex::new(Connector::new(dialer, max_backoff)),
            pending: Mutex::new(None),
            status,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connector.lock().await.is_connected()
    }

    fn pending(&self) -> MutexGuard<'_, Option<Response>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect_once(&self, tries: u32) -> PipelineResult<()> {
        let mut connector = self.connector.lock().await;
        if connector.is_connected() {
            return Ok(());
        }

        self.status.update("Connecting");
        match connector.connect(tries).await {
            Ok(()) => {
                info!(target = %connector.dialer().target(), "connected to API");
                self.status.update("Connected");
                Ok(())
            }
            Err(err) => {
                self.status.update("Disconnected");
                Err(err)
            }
        }
    }

    async fn disconnect_once(&self) {
        let mut connector = self.connector.lock().await;
        if connector.is_connected() {
            connector.close().await;
            debug!("disconnected from API");
        }
        self.pending().take();
        self.status.update("Disconnected");
    }

    async fn send_bytes(&self, data: &[u8], timeout: Duration) -> PipelineResult<()> {
        let (client, url, api_key) = {
            let connector = self.connector.lock().await;
            let client = connector.conn().cloned().ok_or(PipelineError::NotConnected)?;
            let dialer = connector.dialer();
            (client, dialer.url.clone(), dialer.api_key.clone())
        };

        self.pending().take();
        let resp = client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, api_key)
            .body(data.to_vec())
            .timeout(timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let code = resp.status().as_u16();
        let body = resp.text().await.map_err(transport_error)?;
        let error = if (200..300).contains(&code) {
            String::new()
        } else {
            error_text(&body)
        };
        debug!(code, bytes = data.len(), "unit posted");

        *self.pending() = Some(Response::new(code, error));
        Ok(())
    }

    async fn recv(&self, _timeout: Duration) -> PipelineResult<Response> {
        self.pending().take().ok_or(PipelineError::NoResponse)
    }

    fn status(&self) -> StatusMap {
        self.status.map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_url_replaces_path() {
        let dialer = ApiDialer::new("https://api.example.com/v1/data", "/ping", "k").unwrap();
        assert_eq!(dialer.ping_url().as_str(), "https://api.example.com/ping");
        assert_eq!(dialer.target(), "https://api.example.com/v1/data");
    }

    #[test]
    fn test_invalid_url() {
        assert!(ApiDialer::new("not a url", "/ping", "").is_err());
    }

    #[test]
    fn test_error_text() {
        assert_eq!(error_text(r#"{"error":"bad metric name"}"#), "bad metric name");
        assert_eq!(error_text("upstream down\n"), "upstream down");
        assert_eq!(error_text(r#"{"other":1}"#), r#"{"other":1}"#);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let table = StatusTable::new();
        let dialer = ApiDialer::new("http://127.0.0.1:9/data", "/ping", "").unwrap();
        let transport = HttpTransport::new(dialer, Duration::from_secs(1), &table);

        assert_eq!(table.get(STATUS_KEY).as_deref(), Some("Disconnected"));
        assert!(matches!(
            transport.send_bytes(b"{}", Duration::from_secs(1)).await,
            Err(PipelineError::NotConnected)
        ));
        assert!(matches!(
            transport.recv(Duration::from_secs(1)).await,
            Err(PipelineError::NoResponse)
        ));
    }
}
