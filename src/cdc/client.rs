use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::cdc::consumer::ConsumerManager;
use crate::core::error::RuntimeError;

/// Reconnect backoff bounds.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// One row-level change from the binlog stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowEvent {
    pub database: String,
    pub table: String,
    pub event_type: RowEventType,
    /// Row image: the full row for INSERT/DELETE, `{before, after}` for
    /// UPDATE.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowEventType {
    Insert,
    Update,
    Delete,
}

#[derive(Serialize)]
struct Subscription<'a> {
    destination: &'a str,
    batch_size: usize,
}

/// Client for the binlog bridge: newline-delimited JSON row events over
/// TCP. Reconnects with exponential backoff; events missed while
/// disconnected are not replayed.
pub struct CdcClient {
    host: String,
    port: u16,
    destination: String,
    batch_size: usize,
}

impl CdcClient {
    pub fn new(host: String, port: u16, destination: String, batch_size: usize) -> Self {
        Self {
            host,
            port,
            destination,
            batch_size,
        }
    }

    /// Consume the stream forever, fanning every event out through the
    /// consumer manager.
    pub async fn run(&self, manager: Arc<ConsumerManager>) -> Result<()> {
        let mut backoff = BACKOFF_BASE;
        loop {
            match self.consume_once(&manager).await {
                Ok(delivered) => {
                    info!("cdc stream ended after {delivered} event(s), reconnecting");
                    if delivered > 0 {
                        backoff = BACKOFF_BASE;
                    }
                }
                Err(e) => {
                    let e = RuntimeError::CdcDisconnected(e.to_string());
                    warn!("{e}; reconnecting in {}s", backoff.as_secs());
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// One connect-subscribe-consume pass, ending at EOF or error. Returns
    /// the number of delivered events.
    pub async fn consume_once(&self, manager: &ConsumerManager) -> Result<u64> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connecting to cdc bridge at {addr}"))?;
        info!(
            "connected to cdc bridge at {addr} (destination={})",
            self.destination
        );

        let (reader, mut writer) = stream.into_split();
        let subscription = serde_json::to_string(&Subscription {
            destination: &self.destination,
            batch_size: self.batch_size,
        })?;
        writer.write_all(subscription.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut delivered = 0u64;
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RowEvent>(line) {
                Ok(event) => {
                    delivered += 1;
                    manager.dispatch(&event).await;
                }
                Err(e) => warn!("unparseable cdc event skipped: {e}"),
            }
        }
        Ok(delivered)
    }
}
