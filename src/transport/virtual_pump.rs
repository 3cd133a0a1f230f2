//! Scriptable simulated pump.
//!
//! A [`VirtualPump`] speaks one family's protocol over a [`PumpEndpoint`]:
//! it answers the handshake, derives the same session key as the engine and
//! replies to commands according to per-opcode [`Behavior`]s. Every record it
//! sees or sends is logged as a [`WireEvent`] so tests can assert on what
//! actually crossed the link.
//!
//! ```rust
//! use pumplink::family::presets;
//! use pumplink::transport::virtual_pump::{Behavior, VirtualPump};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (transport, pump) = VirtualPump::new(presets::dana_r(), b"secret".to_vec())
//!     .on(0x020B, Behavior::Respond(vec![0x13, 0x88, 80]))
//!     .on(0x3101, Behavior::Silent)
//!     .connect();
//! # drop((transport, pump));
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::memory::{MemoryTransport, PumpEndpoint};
use crate::codec::{FrameReader, OutboundRecord, PacketCodec};
use crate::family::FamilyDescriptor;
use crate::session::Session;
use crate::types::{Frame, FrameFlags, Opcode};

/// How the pump answers one opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Respond(Vec<u8>),
    /// Multi-frame answer, one record per page.
    Pages(Vec<Vec<u8>>),
    /// Pages with the listed fragment indices never sent.
    PagesWithLoss { pages: Vec<Vec<u8>>, dropped: Vec<u8> },
    Nack(u8),
    Silent,
    /// Stay silent for the first `count` transmissions, then respond.
    IgnoreFirst { count: u32, payload: Vec<u8> },
}

/// How the pump answers the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeBehavior {
    Accept,
    Reject(u8),
    Ignore,
    IgnoreFirst(u32),
}

/// One record observed by the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEvent {
    Received { opcode: Opcode, sequence: u16 },
    Replied { opcode: Opcode, sequence: u16, fragment: u8 },
}

#[derive(Debug)]
enum Control {
    Push { opcode: Opcode, payload: Vec<u8> },
    Raw(Vec<u8>),
    SetBehavior(Opcode, Behavior),
    Disconnect,
}

/// Builder and state of a simulated pump.
#[derive(Debug, Clone)]
pub struct VirtualPump {
    family: FamilyDescriptor,
    secret: Vec<u8>,
    behaviors: HashMap<Opcode, Behavior>,
    fallback: Behavior,
    handshake: HandshakeBehavior,
    latency: Duration,
}

impl VirtualPump {
    /// Pump that accepts the handshake and acknowledges every opcode with an empty payload.
    pub fn new(family: FamilyDescriptor, pairing_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            family,
            secret: pairing_secret.into(),
            behaviors: HashMap::new(),
            fallback: Behavior::Respond(Vec::new()),
            handshake: HandshakeBehavior::Accept,
            latency: Duration::ZERO,
        }
    }

    pub fn on(mut self, opcode: impl Into<Opcode>, behavior: Behavior) -> Self {
        self.behaviors.insert(opcode.into(), behavior);
        self
    }

    /// Behavior for opcodes without an explicit entry.
    pub fn otherwise(mut self, behavior: Behavior) -> Self {
        self.fallback = behavior;
        self
    }

    pub fn handshake(mut self, behavior: HandshakeBehavior) -> Self {
        self.handshake = behavior;
        self
    }

    /// Delay before every reply.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Run against a fresh in-memory link and return the engine's end of it.
    pub fn connect(self) -> (MemoryTransport, VirtualPumpHandle) {
        let (transport, endpoint) = MemoryTransport::pair();
        (transport, self.spawn(endpoint))
    }

    pub fn spawn(self, endpoint: PumpEndpoint) -> VirtualPumpHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        let task_log = log.clone();
        let task = tokio::spawn(async move {
            self.run(endpoint, control_rx, task_log).await;
        });
        VirtualPumpHandle { control: control_tx, log, task }
    }

    async fn run(
        mut self,
        mut endpoint: PumpEndpoint,
        mut control: mpsc::UnboundedReceiver<Control>,
        log: Arc<Mutex<Vec<WireEvent>>>,
    ) {
        let family = Arc::new(self.family.clone());
        let codec = PacketCodec::new(family.clone());
        let mut link = PumpLink {
            codec,
            session: Session::new(&family, self.secret.clone()),
            endpoint: &mut endpoint,
            log,
            last_handshake: None,
            push_sequence: u16::MAX,
        };
        let mut reader = FrameReader::default();
        let mut seen: HashMap<Opcode, u32> = HashMap::new();
        debug!("Virtual {} pump started", family.name);

        loop {
            tokio::select! {
                request = control.recv() => match request {
                    Some(Control::Push { opcode, payload }) => {
                        let sequence = link.next_push_sequence();
                        link.reply(opcode, sequence, &[payload], &[], false);
                    }
                    Some(Control::Raw(bytes)) => {
                        if link.endpoint.send(bytes).is_err() {
                            break;
                        }
                    }
                    Some(Control::SetBehavior(opcode, behavior)) => {
                        self.behaviors.insert(opcode, behavior);
                    }
                    Some(Control::Disconnect) | None => break,
                },
                chunk = link.endpoint.recv() => {
                    let Some(chunk) = chunk else { break };
                    reader.push(&chunk);
                    while let Some(result) = link.codec.next_frame(&mut reader, &link.session) {
                        match result {
                            Ok(frame) => {
                                let count = seen.entry(frame.opcode).or_default();
                                *count += 1;
                                let transmissions = *count;
                                self.answer(&mut link, frame, transmissions).await;
                            }
                            Err(err) => debug!("Virtual pump dropped record: {}", err),
                        }
                    }
                }
            }
        }
        debug!("Virtual {} pump stopped", family.name);
    }

    async fn answer(&self, link: &mut PumpLink<'_>, frame: Frame, transmissions: u32) {
        link.record(WireEvent::Received { opcode: frame.opcode, sequence: frame.sequence });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if frame.opcode == self.family.handshake_opcode {
            let respond = match self.handshake {
                HandshakeBehavior::Accept => true,
                HandshakeBehavior::IgnoreFirst(count) => transmissions > count,
                HandshakeBehavior::Ignore => false,
                HandshakeBehavior::Reject(code) => {
                    link.reply(frame.opcode, frame.sequence, &[vec![code]], &[], false);
                    false
                }
            };
            if respond {
                link.accept_handshake(&frame);
            }
            return;
        }

        let behavior = self.behaviors.get(&frame.opcode).unwrap_or(&self.fallback);
        match behavior {
            Behavior::Respond(payload) => {
                link.reply(frame.opcode, frame.sequence, std::slice::from_ref(payload), &[], false)
            }
            Behavior::Pages(pages) => link.reply(frame.opcode, frame.sequence, pages, &[], false),
            Behavior::PagesWithLoss { pages, dropped } => {
                link.reply(frame.opcode, frame.sequence, pages, dropped, false)
            }
            Behavior::Nack(code) => link.reply(frame.opcode, frame.sequence, &[vec![*code]], &[], true),
            Behavior::Silent => trace!("Virtual pump ignoring {}", frame.opcode),
            Behavior::IgnoreFirst { count, payload } => {
                if transmissions > *count {
                    link.reply(frame.opcode, frame.sequence, std::slice::from_ref(payload), &[], false);
                }
            }
        }
    }
}

struct PumpLink<'a> {
    codec: PacketCodec,
    session: Session,
    endpoint: &'a mut PumpEndpoint,
    log: Arc<Mutex<Vec<WireEvent>>>,
    /// Last accepted request and its answer.
    last_handshake: Option<(Vec<u8>, Vec<u8>)>,
    /// Unsolicited records count down from the top of the sequence space,
    /// away from the sequences the host assigns.
    push_sequence: u16,
}

impl PumpLink<'_> {
    /// A retransmitted request gets the same answer and keeps the current key.
    fn accept_handshake(&mut self, frame: &Frame) {
        let answer = match &self.last_handshake {
            Some((request, answer)) if *request == frame.payload => {
                debug!("Virtual pump repeating handshake answer");
                answer.clone()
            }
            _ => match self.session.accept_handshake(&frame.payload) {
                Ok(answer) => {
                    self.last_handshake = Some((frame.payload.clone(), answer.clone()));
                    self.push_sequence = u16::MAX;
                    answer
                }
                Err(err) => {
                    warn!("Virtual pump could not accept handshake: {}", err);
                    return;
                }
            },
        };
        self.reply(frame.opcode, frame.sequence, &[answer], &[], false);
    }

    fn next_push_sequence(&mut self) -> u16 {
        let sequence = self.push_sequence;
        self.push_sequence = sequence.wrapping_sub(1);
        sequence
    }

    fn record(&self, event: WireEvent) {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(event);
    }

    fn reply(&mut self, opcode: Opcode, sequence: u16, pages: &[Vec<u8>], dropped: &[u8], nack: bool) {
        let handshake = opcode == self.codec.family().handshake_opcode;
        let cipher = if self.codec.family().encrypted && !handshake { self.session.cipher() } else { None };
        if self.codec.family().encrypted && !handshake && cipher.is_none() {
            warn!("Virtual pump has no session key, not sending {}", opcode);
            return;
        }

        let last = pages.len().saturating_sub(1);
        for (index, page) in pages.iter().enumerate() {
            let fragment = index as u8;
            if dropped.contains(&fragment) {
                continue;
            }
            let flags = FrameFlags::new(FrameFlags::FROM_PUMP)
                .with(FrameFlags::CONTINUATION, index < last)
                .with(FrameFlags::NACK, nack);
            let record = OutboundRecord { opcode, flags, sequence, fragment, payload: page };
            match self.codec.encode_record(&record, cipher) {
                Ok(bytes) => {
                    if self.endpoint.send(bytes).is_err() {
                        return;
                    }
                    self.record(WireEvent::Replied { opcode, sequence, fragment });
                }
                Err(err) => warn!("Virtual pump could not encode {}: {}", opcode, err),
            }
        }
    }
}

/// Control handle for a running [`VirtualPump`].
#[derive(Debug)]
pub struct VirtualPumpHandle {
    control: mpsc::UnboundedSender<Control>,
    log: Arc<Mutex<Vec<WireEvent>>>,
    task: JoinHandle<()>,
}

impl VirtualPumpHandle {
    /// Send an unsolicited status record.
    pub fn push(&self, opcode: impl Into<Opcode>, payload: impl Into<Vec<u8>>) {
        let _ = self.control.send(Control::Push { opcode: opcode.into(), payload: payload.into() });
    }

    /// Write arbitrary bytes to the engine, e.g. line noise.
    pub fn inject_raw(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.control.send(Control::Raw(bytes.into()));
    }

    pub fn set_behavior(&self, opcode: impl Into<Opcode>, behavior: Behavior) {
        let _ = self.control.send(Control::SetBehavior(opcode.into(), behavior));
    }

    /// Drop the link as if the radio connection was lost.
    pub fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    pub fn events(&self) -> Vec<WireEvent> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Records received for `opcode`, in arrival order.
    pub fn received(&self, opcode: impl Into<Opcode>) -> Vec<u16> {
        let opcode = opcode.into();
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                WireEvent::Received { opcode: seen, sequence } if seen == opcode => Some(sequence),
                _ => None,
            })
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for VirtualPumpHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
