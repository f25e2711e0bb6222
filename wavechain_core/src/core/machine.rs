/// Per-node state machine
///
/// The machine performs no network I/O of its own. `advance` runs the current
/// state's handler and returns an [`Effect`] telling the caller what to wait
/// on next; a forward is completed by feeding its result to `on_forwarded`.
/// Inbound envelopes go through `receive`, which either starts a cycle on an
/// idle node or parks the envelope in the relay buffer.
use crate::communication::relay_buffer::PushOutcome;
use crate::config::PeerAddress;
use crate::core::context::NodeContext;
use crate::core::state::{MachineState, Transition, TransitionHistory};
use crate::error::{WaveError, WaveResult};
use crate::hardware::{scale_movements, HardwareActuationPort};
use crate::message::{Envelope, MovementData, Payload, Response, TimeEncoding};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pause before a sensing node retries after a failed collect
pub const COLLECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Message returned when the relay buffer refuses an envelope
pub const BUFFER_FULL_MESSAGE: &str = "relay buffer full, try later";

/// What the caller should do after `advance`
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Wait for the next inbound envelope
    Idle,
    /// Call `advance` again
    Continue,
    /// Send `envelope` to `peer`, then report back through `on_forwarded`
    Forward { peer: PeerAddress, envelope: Envelope },
    /// No new work is admitted before `until`
    Cooldown { until: Instant },
    /// Stop the node loop
    Halt,
}

pub struct NodeStateMachine<P> {
    ctx: NodeContext,
    port: P,
    state: MachineState,
    previous: MachineState,
    /// Vector and time encoding of the cycle in progress
    pending: Option<MovementData>,
    in_flight: Option<PeerAddress>,
    cooldown_until: Option<Instant>,
    history: TransitionHistory,
    cycles: u64,
    failed_sends: u64,
}

impl<P: HardwareActuationPort> NodeStateMachine<P> {
    pub fn new(ctx: NodeContext, port: P) -> Self {
        Self {
            ctx,
            port,
            state: MachineState::Idle,
            previous: MachineState::Idle,
            pending: None,
            in_flight: None,
            cooldown_until: None,
            history: TransitionHistory::default(),
            cycles: 0,
            failed_sends: 0,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn previous_state(&self) -> MachineState {
        self.previous
    }

    pub fn history(&self) -> &TransitionHistory {
        &self.history
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn buffered(&self) -> usize {
        self.ctx.buffer.len()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Cycles that reached SEND_DATA
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn failed_sends(&self) -> u64 {
        self.failed_sends
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Switch state, record the transition and start the post-send cooldown
    pub fn enter(&mut self, next: MachineState) {
        let from = self.state;
        if from == next {
            return;
        }

        let now = Instant::now();
        self.previous = from;
        self.state = next;
        self.history.record(Transition { from, to: next, at: now });
        info!(node = %self.ctx.name(), from = %from, to = %next, "state transition");

        if next == MachineState::Idle && from == MachineState::SendData && !self.ctx.cooldown.is_zero() {
            self.cooldown_until = now.checked_add(self.ctx.cooldown);
            match self.cooldown_until {
                Some(_) => debug!(node = %self.ctx.name(), "cooling down for {:?}", self.ctx.cooldown),
                None => warn!(node = %self.ctx.name(), "cooldown {:?} out of range, skipped", self.ctx.cooldown),
            }
        }
    }

    /// Dispatch one inbound envelope and build its response
    pub fn receive(&mut self, envelope: Envelope) -> Response {
        match &envelope.payload {
            Payload::MovementData(_) | Payload::Data(_) => self.admit(envelope),
            Payload::ReadySignal(ready) => {
                debug!(node = %self.ctx.name(), "ready signal from {}", ready.source);
                self.tagged(Response::success("ready signal noted"))
            }
            Payload::Ack => self.tagged(Response::success("ack")),
            Payload::Discovery(_) => self.tagged(Response::success("discovered")),
            Payload::Connect(probe) => {
                if let Some(node) = &probe.node {
                    info!(node = %self.ctx.name(), "connect probe from {}", node);
                }
                self.tagged(Response::success("connected"))
            }
            Payload::StatusRequest => self.tagged(Response::success(format!(
                "buffered={} cycles={} failed_sends={}",
                self.ctx.buffer.len(),
                self.cycles,
                self.failed_sends
            ))),
        }
    }

    /// Start a cycle if the node is free, otherwise queue the trigger
    pub fn admit(&mut self, envelope: Envelope) -> Response {
        let free = self.state == MachineState::Idle
            && !self.is_cooling_down()
            && self.ctx.buffer.is_empty();

        if free {
            return match self.begin_cycle(envelope) {
                Ok(()) => self.tagged(Response::success("accepted")),
                Err(e) => {
                    warn!(node = %self.ctx.name(), kind = e.kind(), "rejected trigger: {}", e);
                    self.tagged(Response::from(&e))
                }
            };
        }

        debug!(
            node = %self.ctx.name(),
            state = %self.state,
            "busy, buffering {} envelope",
            envelope.kind()
        );
        let response = match self.ctx.buffer.push(envelope) {
            PushOutcome::Dropped { notify: true } => Response::error(BUFFER_FULL_MESSAGE),
            PushOutcome::Dropped { notify: false }
            | PushOutcome::Queued { .. }
            | PushOutcome::Evicted(_) => Response::success("queued"),
        };
        self.tagged(response)
    }

    /// Run the current state's handler; handler errors force IDLE
    pub fn advance(&mut self) -> Effect {
        let failed_in = self.state;
        match self.step() {
            Ok(effect) => effect,
            Err(e) => {
                error!(
                    node = %self.ctx.name(),
                    state = %failed_in,
                    kind = e.kind(),
                    "cycle aborted: {}",
                    e
                );
                self.pending = None;
                self.in_flight = None;
                self.enter(MachineState::Idle);
                if failed_in == MachineState::CollectSignal {
                    self.cooldown_until = Some(Instant::now() + COLLECT_RETRY_DELAY);
                }
                Effect::Continue
            }
        }
    }

    /// Complete the forward returned by the last `Effect::Forward`
    pub fn on_forwarded(&mut self, result: WaveResult<Response>) {
        let Some(peer) = self.in_flight.take() else {
            warn!(node = %self.ctx.name(), "forward result with no send in flight");
            return;
        };

        match result {
            Ok(response) if response.is_success() => {
                info!(node = %self.ctx.name(), peer = %peer, "forwarded: {}", response.message);
            }
            Ok(response) => {
                self.failed_sends += 1;
                warn!(node = %self.ctx.name(), peer = %peer, "peer refused envelope: {}", response.message);
            }
            Err(e) => {
                self.failed_sends += 1;
                warn!(node = %self.ctx.name(), peer = %peer, kind = e.kind(), "send failed: {}", e);
            }
        }

        self.enter(MachineState::Idle);
    }

    /// Return the port to a safe state; called once when the node stops
    pub fn release(&mut self) {
        if let Err(e) = self.port.release() {
            warn!(node = %self.ctx.name(), "failed to release {}: {}", self.port.name(), e);
        } else {
            info!(node = %self.ctx.name(), "released {}", self.port.name());
        }
    }

    fn tagged(&self, response: Response) -> Response {
        response.with_node(self.ctx.name()).with_state(self.state)
    }

    fn begin_cycle(&mut self, envelope: Envelope) -> WaveResult<()> {
        let movement = match envelope.payload {
            Payload::MovementData(movement) => movement,
            Payload::Data(relay) => MovementData {
                vector: scale_movements(&relay.movements)?,
                time: TimeEncoding::now(),
            },
            other => {
                return Err(WaveError::protocol(format!(
                    "'{}' cannot start a cycle",
                    other.kind()
                )))
            }
        };

        info!(
            node = %self.ctx.name(),
            "cycle started at {}: {}",
            envelope.timestamp,
            movement.vector.log_summary()
        );
        self.pending = Some(movement);
        self.enter(MachineState::DriveWavemaker);
        Ok(())
    }

    fn step(&mut self) -> WaveResult<Effect> {
        match self.state {
            MachineState::Idle => self.step_idle(),
            MachineState::CollectSignal => self.step_collect(),
            MachineState::DriveWavemaker => self.step_drive(),
            MachineState::SendData => self.step_send(),
            MachineState::ReceiveData => Err(WaveError::protocol(
                "RECEIVE_DATA has no handler",
            )),
        }
    }

    fn step_idle(&mut self) -> WaveResult<Effect> {
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return Ok(Effect::Cooldown { until });
            }
            self.cooldown_until = None;
            debug!(node = %self.ctx.name(), "cooldown over");
        }

        if let Some(envelope) = self.ctx.buffer.pop() {
            info!(
                node = %self.ctx.name(),
                remaining = self.ctx.buffer.len(),
                "draining buffered {} envelope",
                envelope.kind()
            );
            self.begin_cycle(envelope)?;
            return Ok(Effect::Continue);
        }

        if self.ctx.is_sensing() {
            self.enter(MachineState::CollectSignal);
            return Ok(Effect::Continue);
        }

        Ok(Effect::Idle)
    }

    fn step_collect(&mut self) -> WaveResult<Effect> {
        match self.port.collect()? {
            Some(vector) => {
                self.pending = Some(MovementData {
                    vector,
                    time: TimeEncoding::now(),
                });
                self.enter(MachineState::DriveWavemaker);
                Ok(Effect::Continue)
            }
            None => {
                info!(node = %self.ctx.name(), "{} has no more data, stopping", self.port.name());
                Ok(Effect::Halt)
            }
        }
    }

    fn step_drive(&mut self) -> WaveResult<Effect> {
        let movement = self
            .pending
            .as_ref()
            .ok_or_else(|| WaveError::validation("DRIVE_WAVEMAKER entered without a vector"))?;

        if let Err(e) = self.port.show_time(&movement.time) {
            warn!(node = %self.ctx.name(), "could not show time {}: {}", movement.time, e);
        }
        match self.port.drive(&movement.vector) {
            Ok(()) => debug!(node = %self.ctx.name(), "{} run complete", self.port.name()),
            Err(e) => warn!(node = %self.ctx.name(), kind = e.kind(), "drive failed: {}", e),
        }

        self.enter(MachineState::SendData);
        Ok(Effect::Continue)
    }

    fn step_send(&mut self) -> WaveResult<Effect> {
        let movement = self
            .pending
            .take()
            .ok_or_else(|| WaveError::validation("SEND_DATA entered without a vector"))?;
        self.cycles += 1;

        match self.ctx.next_hop()?.cloned() {
            None => {
                info!(node = %self.ctx.name(), "terminal node, nothing to forward");
                self.enter(MachineState::Idle);
                Ok(Effect::Continue)
            }
            Some(peer) => {
                let envelope = Envelope::movement(movement.vector, movement.time);
                self.in_flight = Some(peer.clone());
                Ok(Effect::Forward { peer, envelope })
            }
        }
    }
}
