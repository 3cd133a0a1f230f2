//! Command dispatcher and retry supervisor.
//!
//! One worker task per connection owns the transport, the session, the
//! command queue and the status store. Callers never touch that state
//! directly: submissions, cancellations and re-pairing requests arrive as
//! [`Request`] messages, timeouts are timers polled in the same `select!`
//! loop as inbound bytes.
//!
//! At most one command is on the wire at any time. It leaves the slot when a
//! matching answer arrives, when its retries are exhausted, or, after the
//! caller cancelled it, when its current attempt's deadline passes or its late
//! answer arrives.

mod queue;
mod stats;

pub use stats::LinkStats;

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::assembler::{AssemblyProgress, ResponseAssembler};
use crate::codec::{FrameReader, PacketCodec};
use crate::config::EngineConfig;
use crate::error::DecodeError;
use crate::family::FamilyDescriptor;
use crate::history::HistorySink;
use crate::session::{ExpiryReason, HANDSHAKE_ACCEPTED, Session, SessionError};
use crate::status::StatusStore;
use crate::transport::Transport;
use crate::types::{
    Command, CommandId, Frame, Response, ResponseShape, SessionState, StatusSnapshot,
};
use crate::{PumpError, Result};
use queue::{CommandQueue, PendingCommand};

/// Messages from connection handles to the worker.
pub(crate) enum Request {
    Submit { id: CommandId, command: Command, reply: oneshot::Sender<Result<Response>> },
    Cancel(CommandId),
    ResetSession,
    Reconnect(Box<dyn Transport>),
}

/// Handles returned by [`Dispatcher::spawn`].
pub(crate) struct DispatcherChannels {
    pub requests: mpsc::UnboundedSender<Request>,
    pub status: watch::Receiver<Arc<StatusSnapshot>>,
    pub state: watch::Receiver<SessionState>,
    pub stats: watch::Receiver<LinkStats>,
    pub cancel: CancellationToken,
}

/// Everything the worker needs at start-up.
pub(crate) struct DispatcherSetup {
    pub family: Arc<FamilyDescriptor>,
    pub config: EngineConfig,
    pub pairing_secret: Vec<u8>,
    pub transport: Box<dyn Transport>,
    pub history: Option<Box<dyn HistorySink>>,
}

pub(crate) struct Dispatcher;

impl Dispatcher {
    /// Spawn the worker task for one connection.
    pub fn spawn(setup: DispatcherSetup) -> DispatcherChannels {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Unpaired);
        let (stats_tx, stats_rx) = watch::channel(LinkStats::default());
        let cancel = CancellationToken::new();

        let status = StatusStore::new(setup.family.clone());
        let status_rx = status.subscribe();
        let worker = Worker {
            codec: PacketCodec::new(setup.family.clone()),
            session: Session::new(&setup.family, setup.pairing_secret),
            transport: Some(setup.transport),
            reader: FrameReader::default(),
            queue: CommandQueue::new(setup.config.queue_capacity),
            in_flight: None,
            handshake: None,
            assembler: ResponseAssembler::new(setup.config.assembly),
            status,
            history: setup.history,
            config: setup.config,
            state_tx,
            stats_tx,
        };

        let cancel_worker = cancel.clone();
        tokio::spawn(async move {
            worker.run(request_rx, cancel_worker).await;
        });

        DispatcherChannels {
            requests: request_tx,
            status: status_rx,
            state: state_rx,
            stats: stats_rx,
            cancel,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HandshakeAttempt {
    attempt: u32,
    deadline: Instant,
}

struct Worker {
    codec: PacketCodec,
    session: Session,
    transport: Option<Box<dyn Transport>>,
    reader: FrameReader,
    queue: CommandQueue,
    in_flight: Option<PendingCommand>,
    handshake: Option<HandshakeAttempt>,
    assembler: ResponseAssembler,
    status: StatusStore,
    history: Option<Box<dyn HistorySink>>,
    config: EngineConfig,
    state_tx: watch::Sender<SessionState>,
    stats_tx: watch::Sender<LinkStats>,
}

impl Worker {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>, cancel: CancellationToken) {
        info!("Dispatcher started for {} pump", self.codec.family().name);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Dispatcher cancelled");
                    break;
                }
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("All connection handles dropped, shutting down");
                        break;
                    }
                },
                chunk = recv_from(&mut self.transport) => match chunk {
                    Some(bytes) => self.on_bytes(&bytes),
                    None => self.on_disconnected(),
                },
                _ = sleep_until(deadline) => self.on_deadline().await,
            }
            self.advance().await;
        }

        self.fail_all(|| PumpError::EngineStopped);
        let stats = *self.stats_tx.borrow();
        info!(
            "Dispatcher stopped ({} completed, {} failed, {} retries)",
            stats.completed, stats.failed, stats.retries
        );
    }

    fn next_deadline(&self) -> Option<Instant> {
        let handshake = self.handshake.map(|attempt| attempt.deadline);
        let command = self.in_flight.as_ref().and_then(|pending| pending.deadline);
        match (handshake, command) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Submit { id, command, reply } => {
                let policy = command.policy().unwrap_or(self.config.default_policy);
                let pending = PendingCommand::new(id, command, policy, reply);
                if self.session.state() == SessionState::Expired {
                    self.resolve(pending, Err(PumpError::SessionNotReady { state: SessionState::Expired }));
                    return;
                }
                trace!("Queued {} {}", pending.id, pending.command.opcode());
                if let Err(pending) = self.queue.push(pending) {
                    let capacity = self.queue.capacity();
                    warn!("Queue full, rejecting {}", pending.id);
                    self.resolve(pending, Err(PumpError::QueueFull { capacity }));
                }
            }
            Request::Cancel(id) => {
                if let Some(pending) = self.queue.remove(id) {
                    debug!("Cancelled queued {}", id);
                    self.resolve(pending, Err(PumpError::Cancelled));
                } else if let Some(pending) = self.in_flight.as_mut().filter(|pending| pending.id == id) {
                    // bytes may already be on the wire: answer the caller, keep the slot
                    debug!("Cancelled in-flight {}, holding the wire until its deadline", id);
                    if pending.notify(Err(PumpError::Cancelled)) {
                        self.stats_tx.send_modify(|stats| stats.failed += 1);
                    }
                }
            }
            Request::ResetSession => {
                info!("Resetting session for re-pairing");
                if let Some(pending) = self.in_flight.take() {
                    self.finish(pending, Err(PumpError::Cancelled));
                }
                self.restart_session();
            }
            Request::Reconnect(transport) => {
                info!("Reconnecting with a new transport");
                if let Some(pending) = self.in_flight.take() {
                    self.finish(pending, Err(PumpError::Disconnected));
                }
                self.transport = Some(transport);
                self.restart_session();
            }
        }
    }

    fn restart_session(&mut self) {
        self.handshake = None;
        self.reader.clear();
        self.session.reset();
        self.publish_state();
    }

    /// Start the handshake or put the next command on the wire when the slot is free.
    async fn advance(&mut self) {
        while self.in_flight.is_none() && self.handshake.is_none() && !self.queue.is_empty() {
            match self.session.state() {
                SessionState::Unpaired => {
                    self.start_handshake(1).await;
                    return;
                }
                SessionState::Handshaking => return,
                SessionState::Expired => {
                    self.fail_queue(|| PumpError::SessionNotReady { state: SessionState::Expired });
                    return;
                }
                SessionState::Established => {}
            }
            let Some(pending) = self.queue.pop_next() else { return };
            self.transmit(pending).await;
        }
    }

    /// Send the handshake request; retries repeat the nonce of the first attempt.
    async fn start_handshake(&mut self, attempt: u32) {
        let nonce = match self.session.handshake_nonce() {
            Some(nonce) => nonce,
            None => match self.session.begin_handshake() {
                Ok(nonce) => nonce,
                Err(err) => {
                    warn!("Cannot start handshake: {}", err);
                    return;
                }
            },
        };
        self.publish_state();

        let policy = self.config.handshake.policy();
        let bytes = match self.codec.encode_handshake(&nonce) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Cannot encode handshake: {}", err);
                self.session.fail_handshake();
                self.publish_state();
                self.fail_queue(|| PumpError::SessionNotReady { state: SessionState::Unpaired });
                return;
            }
        };

        info!("Handshake attempt {}/{}", attempt, policy.max_attempts);
        self.handshake = Some(HandshakeAttempt { attempt, deadline: Instant::now() + policy.timeout() });
        if !self.write(&bytes, policy.timeout()).await {
            self.on_disconnected();
        }
    }

    async fn transmit(&mut self, mut pending: PendingCommand) {
        let sequence = match self.session.next_sequence() {
            Ok(sequence) => sequence,
            Err(err) => {
                warn!("Cannot dispatch {}: {}", pending.id, err);
                self.in_flight = Some(pending);
                self.expire_session(ExpiryReason::SequenceExhausted);
                return;
            }
        };
        let bytes = match self.codec.encode(&pending.command, sequence, &self.session) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Cannot encode {}: {}", pending.id, err);
                self.resolve(pending, Err(err.into()));
                return;
            }
        };

        if pending.attempts > 0 {
            self.stats_tx.send_modify(|stats| stats.retries += 1);
        }
        pending.attempts += 1;
        pending.sequences.push(sequence);
        pending.deadline = Some(Instant::now() + pending.policy.timeout());
        debug!(
            "Dispatching {} {} seq={} (attempt {}/{})",
            pending.id,
            pending.command.opcode(),
            sequence,
            pending.attempts,
            pending.policy.max_attempts
        );

        let timeout = pending.policy.timeout();
        self.in_flight = Some(pending);
        if !self.write(&bytes, timeout).await {
            self.on_disconnected();
        }
    }

    /// Write one record, bounded by `timeout`. Returns `false` if the link is unusable.
    async fn write(&mut self, bytes: &[u8], timeout: Duration) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            warn!("No transport to write {} bytes to", bytes.len());
            return false;
        };
        match tokio::time::timeout(timeout, transport.write(bytes)).await {
            Ok(Ok(())) => {
                trace!("Wrote {} bytes", bytes.len());
                true
            }
            Ok(Err(err)) => {
                error!("Transport write failed: {}", err);
                false
            }
            Err(_) => {
                error!("Transport write did not complete within {:?}", timeout);
                false
            }
        }
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        self.reader.push(bytes);
        while let Some(result) = self.codec.next_frame(&mut self.reader, &self.session) {
            match result {
                Ok(frame) => self.on_frame(frame),
                Err(err) => self.on_noise(err),
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if frame.opcode == self.codec.family().handshake_opcode {
            self.on_handshake_frame(frame);
            return;
        }
        if !frame.is_from_pump() {
            self.on_noise(DecodeError::Unexpected {
                opcode: frame.opcode,
                sequence: frame.sequence,
                reason: "record was not sent by the pump",
            });
            return;
        }

        self.status.update(&frame, SystemTime::now());

        let answers_in_flight = self.in_flight.as_ref().is_some_and(|pending| {
            pending.command.opcode() == frame.opcode && pending.sequences.contains(&frame.sequence)
        });
        if !answers_in_flight {
            let reason = if self.in_flight.is_some() {
                "does not answer the command in flight"
            } else {
                "no command in flight"
            };
            self.on_noise(DecodeError::Unexpected { opcode: frame.opcode, sequence: frame.sequence, reason });
            return;
        }
        let Some(mut pending) = self.in_flight.take() else { return };

        if pending.is_cancelled() {
            self.on_noise(DecodeError::Unexpected {
                opcode: frame.opcode,
                sequence: frame.sequence,
                reason: "late answer to a cancelled command",
            });
            self.assembler.reset();
            return;
        }

        if frame.is_nack() {
            let code = frame.nack_code();
            warn!("Pump rejected {} {} with code {:#04x}", pending.id, frame.opcode, code);
            self.finish(pending, Err(PumpError::Rejected { opcode: frame.opcode, code }));
            return;
        }

        match self.assembler.push(frame) {
            Ok(AssemblyProgress::Pending) => {
                pending.deadline = Some(Instant::now() + pending.policy.timeout());
                self.in_flight = Some(pending);
            }
            Ok(AssemblyProgress::Complete(message)) => {
                if pending.command.shape() == ResponseShape::MultiFrame {
                    if let Some(sink) = self.history.as_mut() {
                        sink.record(&message);
                    }
                }
                let response = Response {
                    possibly_duplicated: pending.command.is_side_effecting() && pending.attempts > 1,
                    attempts: pending.attempts,
                    message,
                };
                self.finish(pending, Ok(response));
            }
            Err(err) => {
                warn!("Response to {} could not be assembled: {}", pending.id, err);
                self.finish(pending, Err(err));
            }
        }
    }

    fn on_handshake_frame(&mut self, frame: Frame) {
        match self.session.state() {
            SessionState::Handshaking => {
                match self.session.complete_handshake(&frame.payload) {
                    Ok(()) => {
                        info!("Session established (epoch {})", self.session.epoch());
                        self.handshake = None;
                        self.status.update(&frame, SystemTime::now());
                    }
                    Err(SessionError::StaleAnswer) => {
                        self.on_noise(DecodeError::Unexpected {
                            opcode: frame.opcode,
                            sequence: frame.sequence,
                            reason: "handshake answer to another request",
                        });
                        return;
                    }
                    Err(err) => {
                        warn!("Handshake failed: {}", err);
                        self.handshake = None;
                        self.fail_queue(|| PumpError::SessionNotReady { state: SessionState::Unpaired });
                    }
                }
                self.publish_state();
            }
            SessionState::Established
                if frame.payload.first().is_some_and(|status| *status != HANDSHAKE_ACCEPTED) =>
            {
                let code = frame.payload[0];
                warn!("Pump rejected the session key (code {:#04x})", code);
                self.expire_session(ExpiryReason::RekeyRejected { code });
            }
            SessionState::Established => match self.session.follow_rekey(&frame.payload) {
                Ok(true) => {
                    info!("Session re-keyed by the pump (epoch {})", self.session.epoch());
                    self.publish_state();
                }
                Ok(false) => debug!("Repeated handshake answer for epoch {}", self.session.epoch()),
                Err(err) => {
                    debug!("Ignoring handshake answer: {}", err);
                    self.on_noise(DecodeError::Unexpected {
                        opcode: frame.opcode,
                        sequence: frame.sequence,
                        reason: "handshake answer to another request",
                    });
                }
            },
            _ => self.on_noise(DecodeError::Unexpected {
                opcode: frame.opcode,
                sequence: frame.sequence,
                reason: "handshake record outside a handshake",
            }),
        }
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        if let Some(handshake) = self.handshake.filter(|handshake| handshake.deadline <= now) {
            self.handshake = None;
            let max_attempts = self.config.handshake.max_attempts;
            if handshake.attempt < max_attempts {
                warn!("Handshake attempt {}/{} timed out", handshake.attempt, max_attempts);
                self.start_handshake(handshake.attempt + 1).await;
            } else {
                error!("Handshake failed after {} attempts", handshake.attempt);
                self.session.fail_handshake();
                self.publish_state();
                self.fail_queue(|| PumpError::SessionNotReady { state: SessionState::Unpaired });
            }
            return;
        }

        let timed_out = self
            .in_flight
            .as_ref()
            .is_some_and(|pending| pending.deadline.is_some_and(|deadline| deadline <= now));
        if !timed_out {
            return;
        }
        let Some(pending) = self.in_flight.take() else { return };

        if pending.is_cancelled() {
            debug!("Releasing the wire held by cancelled {}", pending.id);
            self.assembler.reset();
            return;
        }
        if pending.attempts < pending.policy.max_attempts {
            warn!(
                "{} {} timed out (attempt {}/{}), retransmitting",
                pending.id,
                pending.command.opcode(),
                pending.attempts,
                pending.policy.max_attempts
            );
            self.transmit(pending).await;
        } else {
            let err = PumpError::Exhausted {
                opcode: pending.command.opcode(),
                attempts: pending.attempts,
                may_have_been_delivered: pending.attempts > 0,
            };
            warn!("{} exhausted: {}", pending.id, err);
            self.finish(pending, Err(err));
        }
    }

    fn on_noise(&mut self, err: DecodeError) {
        match err {
            DecodeError::Malformed { .. } => {
                warn!("Dropped record: {}", err);
                self.stats_tx.send_modify(|stats| stats.malformed += 1);
            }
            _ => {
                debug!("Dropped record: {}", err);
                self.stats_tx.send_modify(|stats| stats.unexpected += 1);
            }
        }
    }

    fn on_disconnected(&mut self) {
        warn!("Transport disconnected");
        self.transport = None;
        self.reader.clear();
        self.expire_session(ExpiryReason::Disconnected);
    }

    /// Expire the session and fail everything that was waiting on it.
    ///
    /// Commands that reached the wire at least once fail with `Disconnected`,
    /// since the pump may have acted on them.
    fn expire_session(&mut self, reason: ExpiryReason) {
        self.session.expire(reason);
        self.handshake = None;
        self.publish_state();

        if let Some(pending) = self.in_flight.take() {
            let err = expiry_error(reason, &pending);
            self.finish(pending, Err(err));
        }
        for pending in self.queue.drain() {
            let err = expiry_error(reason, &pending);
            self.resolve(pending, Err(err));
        }
    }

    fn fail_queue(&mut self, err: impl Fn() -> PumpError) {
        for pending in self.queue.drain() {
            self.resolve(pending, Err(err()));
        }
    }

    fn fail_all(&mut self, err: impl Fn() -> PumpError) {
        if let Some(pending) = self.in_flight.take() {
            self.finish(pending, Err(err()));
        }
        self.fail_queue(err);
    }

    /// Resolve the command that held the wire.
    fn finish(&mut self, pending: PendingCommand, result: Result<Response>) {
        self.assembler.reset();
        self.resolve(pending, result);
    }

    fn resolve(&mut self, mut pending: PendingCommand, result: Result<Response>) {
        match &result {
            Ok(response) => debug!(
                "{} completed after {} attempt(s) ({} frame(s))",
                pending.id, response.attempts, response.message.frames
            ),
            Err(err) => debug!("{} failed: {}", pending.id, err),
        }
        let ok = result.is_ok();
        if pending.notify(result) {
            self.stats_tx.send_modify(|stats| if ok { stats.completed += 1 } else { stats.failed += 1 });
        }
    }

    fn publish_state(&self) {
        let state = self.session.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

fn expiry_error(reason: ExpiryReason, pending: &PendingCommand) -> PumpError {
    if reason == ExpiryReason::Disconnected || pending.attempts > 0 {
        PumpError::Disconnected
    } else {
        PumpError::SessionNotReady { state: SessionState::Expired }
    }
}

async fn recv_from(transport: &mut Option<Box<dyn Transport>>) -> Option<Vec<u8>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
