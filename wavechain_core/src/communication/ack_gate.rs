/// Feeder side of the one-row-at-a-time batch handshake
///
/// The feeder sends a row, and on an accepted response waits for the
/// consumer's `ready_signal` before sending the next one. The ready listener
/// is bound once per gate and reused for every row. A failed or refused
/// send aborts the batch; so does a missing ready signal once the
/// configured timeout runs out.
use crate::batch::BatchRow;
use crate::communication::channel::{send_admitted, EnvelopeHandler, MessageChannel, ServerHandle, DEFAULT_IO_TIMEOUT};
use crate::config::{ChainSettings, PeerAddress};
use crate::error::{WaveError, WaveResult};
use crate::message::{Envelope, Payload, ReadySignal, Response, Timestamp};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default wait for a consumer's ready signal
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct FeederConfig {
    /// `None` waits for the ready signal forever
    pub ready_timeout: Option<Duration>,
    pub io_timeout: Duration,
    /// Ignore ready signals that name a different row
    pub verify_row: bool,
    /// Map raw row values into the motor range before sending
    pub scale: bool,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
            io_timeout: DEFAULT_IO_TIMEOUT,
            verify_row: true,
            scale: false,
        }
    }
}

impl FeederConfig {
    pub fn from_settings(settings: &ChainSettings) -> Self {
        Self {
            ready_timeout: settings.ready_timeout(),
            io_timeout: settings.io_timeout(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederState {
    Idle,
    Sending,
    AwaitingReady,
    Done,
    Aborted,
}

impl fmt::Display for FeederState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeederState::Idle => "IDLE",
            FeederState::Sending => "SENDING",
            FeederState::AwaitingReady => "AWAITING_READY",
            FeederState::Done => "DONE",
            FeederState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: usize,
    pub total: usize,
}

/// Accepts ready signals on behalf of the feeder
pub struct ReadyListener {
    name: String,
    tx: mpsc::UnboundedSender<ReadySignal>,
}

impl EnvelopeHandler for ReadyListener {
    async fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Response {
        match envelope.payload {
            Payload::ReadySignal(ready) => {
                debug!("[{}] ready signal from {} ({})", self.name, ready.source, peer);
                if self.tx.send(ready).is_err() {
                    return Response::error("feeder is not waiting").with_node(self.name.as_str());
                }
                Response::success("ready signal received").with_node(self.name.as_str())
            }
            Payload::Ack => Response::success("ack").with_node(self.name.as_str()),
            other => Response::error(format!("feeder does not accept '{}'", other.kind()))
                .with_node(self.name.as_str()),
        }
    }
}

pub struct AckGate {
    name: String,
    consumer: PeerAddress,
    config: FeederConfig,
    listener: ServerHandle,
    ready_rx: mpsc::UnboundedReceiver<ReadySignal>,
    state: FeederState,
}

impl AckGate {
    /// Bind the ready listener on `bind_addr`; it stays up for the gate's lifetime
    pub async fn bind(
        name: impl Into<String>,
        consumer: PeerAddress,
        bind_addr: &str,
        config: FeederConfig,
    ) -> WaveResult<Self> {
        let name = name.into();
        let (tx, ready_rx) = mpsc::unbounded_channel();
        let handler = ReadyListener {
            name: name.clone(),
            tx,
        };
        // Ready signals may overlap; none of them should be turned away
        let listener = MessageChannel::bind(name.clone(), bind_addr, handler)
            .await?
            .without_connection_limit()
            .spawn()?;

        Ok(Self {
            name,
            consumer,
            config,
            listener,
            ready_rx,
            state: FeederState::Idle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn state(&self) -> FeederState {
        self.state
    }

    /// Relay batch rows in order, one per ready signal
    pub async fn run_batch(&mut self, rows: &[BatchRow]) -> WaveResult<BatchReport> {
        let total = rows.len();
        let scale = self.config.scale;
        info!("[{}] relaying {} rows to {}", self.name, total, self.consumer);

        let mut sent = 0;
        for (row, data) in rows.iter().enumerate() {
            let envelope = data
                .to_envelope(scale)
                .map_err(|e| self.abort(row, e.to_string()))?;
            self.relay_one(row, envelope).await?;
            sent += 1;
            info!("[{}] row {}/{} done", self.name, sent, total);
        }

        self.state = FeederState::Done;
        Ok(BatchReport { sent, total })
    }

    /// Same handshake for prebuilt envelopes
    pub async fn run_envelopes(&mut self, envelopes: Vec<Envelope>) -> WaveResult<BatchReport> {
        let total = envelopes.len();
        for (row, envelope) in envelopes.into_iter().enumerate() {
            self.relay_one(row, envelope).await?;
        }
        self.state = FeederState::Done;
        Ok(BatchReport { sent: total, total })
    }

    async fn relay_one(&mut self, row: usize, envelope: Envelope) -> WaveResult<()> {
        // A ready signal left over from an earlier row must not release this one
        while let Ok(stale) = self.ready_rx.try_recv() {
            debug!("[{}] discarding stale ready signal from {}", self.name, stale.source);
        }

        self.state = FeederState::Sending;
        let response = match send_admitted(&self.consumer, &envelope, self.config.io_timeout).await {
            Ok(response) => response,
            Err(e) => return Err(self.abort(row, e.to_string())),
        };
        if !response.is_success() {
            return Err(self.abort(row, format!("consumer refused row: {}", response.message)));
        }

        self.state = FeederState::AwaitingReady;
        self.wait_ready(row, &envelope.timestamp).await
    }

    async fn wait_ready(&mut self, row: usize, expected: &Timestamp) -> WaveResult<()> {
        let deadline = self
            .config
            .ready_timeout
            .and_then(|timeout| tokio::time::Instant::now().checked_add(timeout));

        loop {
            let signal = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.ready_rx.recv()).await {
                    Ok(signal) => signal,
                    Err(_) => {
                        self.state = FeederState::Aborted;
                        let timeout = self.config.ready_timeout.unwrap_or_default();
                        warn!("[{}] no ready signal for row {} within {:?}", self.name, row, timeout);
                        return Err(WaveError::ReadyTimeout { row, timeout });
                    }
                },
                None => self.ready_rx.recv().await,
            };

            let Some(signal) = signal else {
                return Err(self.abort(row, "ready listener closed".to_string()));
            };

            match &signal.row {
                Some(ts) if self.config.verify_row && ts != expected => {
                    debug!("[{}] ready signal for {} while waiting on {}", self.name, ts, expected);
                }
                _ => {
                    debug!("[{}] {} ready after row {}", self.name, signal.source, row);
                    return Ok(());
                }
            }
        }
    }

    fn abort(&mut self, row: usize, reason: String) -> WaveError {
        self.state = FeederState::Aborted;
        warn!("[{}] batch aborted at row {}: {}", self.name, row, reason);
        WaveError::BatchAborted { row, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_rejects_non_ready_traffic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = ReadyListener {
            name: "feeder".into(),
            tx,
        };
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let refused = listener.handle(Envelope::status_request(), peer).await;
        assert!(!refused.is_success());

        let ok = listener.handle(Envelope::ready("trainer", None), peer).await;
        assert!(ok.is_success());
        assert_eq!(rx.recv().await.unwrap().source, "trainer");
    }

    #[tokio::test]
    async fn test_unreachable_consumer_aborts_first_row() {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let consumer = PeerAddress::new("trainer", "127.0.0.1", port);
        let mut gate = AckGate::bind("feeder", consumer, "127.0.0.1:0", FeederConfig::default())
            .await
            .unwrap();

        let err = gate.run_envelopes(vec![Envelope::ack()]).await.unwrap_err();
        assert!(matches!(err, WaveError::BatchAborted { row: 0, .. }));
        assert_eq!(gate.state(), FeederState::Aborted);
    }

    #[test]
    fn test_zero_ready_timeout_setting_waits_forever() {
        let settings = ChainSettings {
            ready_timeout_secs: Some(0.0),
            ..Default::default()
        };
        assert_eq!(FeederConfig::from_settings(&settings).ready_timeout, None);
    }
}
