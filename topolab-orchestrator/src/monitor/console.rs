//! Console activity watchdog.
//!
//! Reads a device's serial console line by line over TCP and reports
//! every line with its arrival time. The last activity timestamp is what
//! the status check uses to decide whether a silent, unreachable device
//! is stuck.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

use super::{is_stopped, wait_for_stop, MonitorEvent};

/// Console TCP port of a device: `160` followed by the two-digit id.
pub fn console_port(id: u32) -> Option<u16> {
    format!("160{:02}", id).parse().ok()
}

/// Opens a byte stream to a device console.
#[async_trait]
pub trait ConsoleSource: Send + Sync {
    async fn open(&self, host: &str, port: u16) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Plain TCP console server.
#[derive(Debug, Clone, Default)]
pub struct TcpConsole;

#[async_trait]
impl ConsoleSource for TcpConsole {
    async fn open(&self, host: &str, port: u16) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

pub(crate) struct ConsoleWorker {
    pub device: String,
    pub host: String,
    pub port: u16,
    pub source: Arc<dyn ConsoleSource>,
    pub reconnect: Duration,
}

impl ConsoleWorker {
    /// Read until stopped, reconnecting after errors and EOF. Sends the
    /// `console:<device>` sentinel on exit.
    #[instrument(skip_all, fields(device = %self.device, host = %self.host, port = self.port))]
    pub async fn run(self, tx: mpsc::Sender<MonitorEvent>, mut stop: watch::Receiver<bool>) {
        info!("Starting console watchdog");

        'outer: while !is_stopped(&stop) {
            let opened = tokio::select! {
                opened = self.source.open(&self.host, self.port) => opened,
                _ = wait_for_stop(&mut stop) => break,
            };

            match opened {
                Ok(reader) => {
                    debug!("Console connected");
                    let mut lines = LinesStream::new(BufReader::new(reader).lines());
                    loop {
                        let next = tokio::select! {
                            next = lines.next() => next,
                            _ = wait_for_stop(&mut stop) => break 'outer,
                        };
                        match next {
                            Some(Ok(line)) => {
                                let event = MonitorEvent::Console {
                                    device: self.device.clone(),
                                    at: Utc::now(),
                                    message: line.trim().to_string(),
                                };
                                if tx.send(event).await.is_err() {
                                    warn!("Supervisor gone, stopping console watchdog");
                                    break 'outer;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Console read failed");
                                break;
                            }
                            None => {
                                debug!("Console closed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => debug!(error = %e, "Console not available"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect) => {}
                _ = wait_for_stop(&mut stop) => break,
            }
        }

        info!("Console watchdog stopped");
        let _ = tx.send(MonitorEvent::Stopped(format!("console:{}", self.device))).await;
    }
}
