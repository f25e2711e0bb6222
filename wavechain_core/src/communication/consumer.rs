/// Consumer side of the batch handshake
///
/// Stores each new `movement_data` row once, answers the feeder, then tells
/// it to send the next row with a `ready_signal`. Rows are keyed by envelope
/// timestamp; a repeat is answered with success and not stored again.
use crate::batch::RowSink;
use crate::communication::channel::{send_admitted, EnvelopeHandler};
use crate::config::PeerAddress;
use crate::error::WaveError;
use crate::message::{Envelope, Payload, Response, Timestamp};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `source` field of the ready signals this consumer sends
pub const CONSUMER_SOURCE: &str = "trainer";

struct Ledger<S> {
    sink: S,
    processed: HashSet<String>,
}

enum Intake {
    Stored,
    Duplicate,
    Failed(WaveError),
}

pub struct BatchConsumer<S> {
    name: String,
    feeder: Option<PeerAddress>,
    io_timeout: Duration,
    ledger: Mutex<Ledger<S>>,
}

impl<S: RowSink + 'static> BatchConsumer<S> {
    /// `feeder` receives a ready signal after every row; `None` disables signalling
    pub fn new(
        name: impl Into<String>,
        sink: S,
        feeder: Option<PeerAddress>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            feeder,
            io_timeout,
            ledger: Mutex::new(Ledger {
                sink,
                processed: HashSet::new(),
            }),
        }
    }

    /// Distinct rows stored so far
    pub fn processed(&self) -> usize {
        self.ledger.lock().processed.len()
    }

    fn signal_ready(&self, row: Timestamp) {
        let Some(feeder) = self.feeder.clone() else {
            return;
        };
        let io_timeout = self.io_timeout;
        let name = self.name.clone();

        tokio::spawn(async move {
            let signal = Envelope::ready(CONSUMER_SOURCE, Some(row));
            match send_admitted(&feeder, &signal, io_timeout).await {
                Ok(response) if response.is_success() => {
                    debug!("[{}] feeder acknowledged ready signal", name);
                }
                Ok(response) => warn!("[{}] feeder rejected ready signal: {}", name, response.message),
                Err(e) => warn!("[{}] could not signal feeder: {}", name, e),
            }
        });
    }
}

impl<S: RowSink + 'static> EnvelopeHandler for BatchConsumer<S> {
    async fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Response {
        let timestamp = envelope.timestamp;
        match envelope.payload {
            Payload::MovementData(movement) => {
                let key = timestamp.key();
                let intake = {
                    let mut ledger = self.ledger.lock();
                    if ledger.processed.contains(&key) {
                        Intake::Duplicate
                    } else {
                        match ledger.sink.append(&timestamp, &movement) {
                            Ok(()) => {
                                ledger.processed.insert(key);
                                Intake::Stored
                            }
                            Err(e) => Intake::Failed(e),
                        }
                    }
                };

                match intake {
                    Intake::Stored => {
                        info!("[{}] stored row {} from {}", self.name, timestamp, peer);
                        self.signal_ready(timestamp);
                        Response::success("Data processed")
                    }
                    Intake::Duplicate => {
                        info!("[{}] already processed row {}", self.name, timestamp);
                        // Still release the feeder, it would otherwise wait on this row
                        self.signal_ready(timestamp);
                        Response::success("Data already processed")
                    }
                    Intake::Failed(e) => {
                        warn!("[{}] could not store row {}: {}", self.name, timestamp, e);
                        Response::from(&e)
                    }
                }
            }
            Payload::Ack => Response::success("ack"),
            Payload::StatusRequest => {
                Response::success(format!("rows={}", self.processed())).with_node(self.name.as_str())
            }
            Payload::Discovery(_) | Payload::Connect(_) => {
                Response::success("consumer").with_node(self.name.as_str())
            }
            other @ (Payload::Data(_) | Payload::ReadySignal(_)) => {
                Response::error(format!("consumer does not accept '{}'", other.kind()))
            }
        }
    }
}
