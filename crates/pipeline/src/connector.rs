//! Bounded connection establishment on top of [`Backoff`].

use crate::{Error, Result, backoff::Backoff};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Opens, probes and closes one kind of connection.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: Send + Sync;

    /// Human-readable address used in logs and errors.
    fn target(&self) -> String;

    async fn open(&self) -> Result<Self::Conn>;

    /// Liveness probe on a freshly opened connection.
    async fn ping(&self, conn: &Self::Conn) -> Result<()>;

    async fn close(&self, conn: Self::Conn);
}

pub struct Connector<D: Dialer> {
    dialer: D,
    backoff: Backoff,
    conn: Option<D::Conn>,
}

impl<D: Dialer> Connector<D> {
    pub fn new(dialer: D, max_wait: Duration) -> Self {
        Self {
            dialer,
            backoff: Backoff::new(max_wait),
            conn: None,
        }
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    pub fn conn(&self) -> Option<&D::Conn> {
        self.conn.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Try up to `tries` times to open a live connection, sleeping per the
    /// backoff before each attempt. `tries == 0` succeeds without dialing.
    pub async fn connect(&mut self, tries: u32) -> Result<()> {
        if tries == 0 {
            return Ok(());
        }

        self.close().await;

        let target = self.dialer.target();
        let mut last_err = Error::NotConnected;
        for attempt in 1..=tries {
            let wait = self.backoff.wait();
            if !wait.is_zero() {
                debug!(%target, attempt, ?wait, "waiting before connect");
                tokio::time::sleep(wait).await;
            }

            let conn = match self.dialer.open().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(%target, attempt, tries, %err, "connect failed");
                    last_err = err;
                    continue;
                }
            };

            if let Err(err) = self.dialer.ping(&conn).await {
                warn!(%target, attempt, tries, %err, "connection probe failed");
                self.dialer.close(conn).await;
                last_err = err;
                continue;
            }

            debug!(%target, attempt, "connected");
            self.conn = Some(conn);
            self.backoff.success();
            return Ok(());
        }

        Err(Error::ConnectFailed {
            target,
            tries,
            source: Box::new(last_err),
        })
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.dialer.close(conn).await;
        }
    }
}
