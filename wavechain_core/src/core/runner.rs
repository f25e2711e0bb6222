/// Async driver for a node state machine
///
/// The runner task owns the machine. Connection tasks hand it parsed
/// envelopes over an mpsc channel and wait for the response on a oneshot.
/// Between handler steps the runner waits on whatever the last effect asked
/// for: the next envelope, the end of a cooldown, or a forward in flight.
/// Inbound envelopes keep being admitted while it waits, so a trigger that
/// lands mid-cycle goes to the relay buffer.
use crate::communication::channel::{send_to, EnvelopeHandler, MessageChannel, ServerHandle};
use crate::core::context::NodeContext;
use crate::core::machine::{Effect, NodeStateMachine};
use crate::error::WaveResult;
use crate::hardware::HardwareActuationPort;
use crate::message::{Envelope, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Queue depth between connection tasks and the node task
const INBOUND_CAPACITY: usize = 32;

/// One envelope waiting for the node task, with its reply slot
pub struct Inbound {
    pub envelope: Envelope,
    pub peer: SocketAddr,
    pub reply: oneshot::Sender<Response>,
}

/// Channel-side handler that forwards envelopes to the node task
#[derive(Clone)]
pub struct NodeHandler {
    node: String,
    tx: mpsc::Sender<Inbound>,
}

impl EnvelopeHandler for NodeHandler {
    async fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Response {
        let (reply, rx) = oneshot::channel();
        let inbound = Inbound {
            envelope,
            peer,
            reply,
        };
        if self.tx.send(inbound).await.is_err() {
            return Response::error("node is shutting down").with_node(self.node.as_str());
        }
        rx.await
            .unwrap_or_else(|_| Response::error("node dropped the request").with_node(self.node.as_str()))
    }
}

pub struct NodeRunner<P> {
    machine: NodeStateMachine<P>,
    inbound: mpsc::Receiver<Inbound>,
    io_timeout: Duration,
}

impl<P: HardwareActuationPort> NodeRunner<P> {
    pub fn new(machine: NodeStateMachine<P>) -> (Self, NodeHandler) {
        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let handler = NodeHandler {
            node: machine.name().to_string(),
            tx,
        };
        let io_timeout = machine.context().io_timeout;
        (
            Self {
                machine,
                inbound,
                io_timeout,
            },
            handler,
        )
    }

    pub fn machine(&self) -> &NodeStateMachine<P> {
        &self.machine
    }

    /// Drive the machine until it halts, the channel closes or `shutdown` fires.
    ///
    /// A drive in progress always finishes first; the port is released on exit
    /// and the machine handed back for inspection.
    pub async fn run<F>(mut self, shutdown: F) -> NodeStateMachine<P>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(node = %self.machine.name(), "node loop started in {}", self.machine.state());

        loop {
            match self.machine.advance() {
                Effect::Continue => {
                    // Let connection tasks queue their envelopes between steps
                    tokio::task::yield_now().await;
                }
                Effect::Halt => break,
                Effect::Idle => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        inbound = self.inbound.recv() => match inbound {
                            Some(inbound) => self.dispatch(inbound),
                            None => break,
                        },
                    }
                }
                Effect::Cooldown { until } => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        inbound = self.inbound.recv() => match inbound {
                            Some(inbound) => self.dispatch(inbound),
                            None => break,
                        },
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                Effect::Forward { peer, envelope } => {
                    debug!(node = %self.machine.name(), "forwarding to {}", peer);
                    let send = send_to(&peer, &envelope, self.io_timeout);
                    tokio::pin!(send);

                    let mut stopping = false;
                    let result = loop {
                        tokio::select! {
                            biased;
                            Some(inbound) = self.inbound.recv() => self.dispatch(inbound),
                            result = &mut send => break result,
                            _ = &mut shutdown, if !stopping => stopping = true,
                        }
                    };
                    self.machine.on_forwarded(result);
                    if stopping {
                        break;
                    }
                }
            }
        }

        self.machine.release();
        info!(
            node = %self.machine.name(),
            cycles = self.machine.cycles(),
            "node loop stopped"
        );
        self.machine
    }

    fn dispatch(&mut self, inbound: Inbound) {
        debug!(
            node = %self.machine.name(),
            "{} from {}",
            inbound.envelope.kind(),
            inbound.peer
        );
        let response = self.machine.receive(inbound.envelope);
        if inbound.reply.send(response).is_err() {
            debug!(node = %self.machine.name(), "peer {} left before the response", inbound.peer);
        }
    }
}

/// Build a node's machine and bind its server on `bind_addr`
pub async fn bind_node<P: HardwareActuationPort>(
    ctx: NodeContext,
    port: P,
    bind_addr: &str,
) -> WaveResult<(NodeRunner<P>, ServerHandle)> {
    let name = ctx.name().to_string();
    let (runner, handler) = NodeRunner::new(NodeStateMachine::new(ctx, port));
    let server = MessageChannel::bind(name, bind_addr, handler).await?.spawn()?;
    Ok((runner, server))
}
