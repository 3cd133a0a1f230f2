//! Caller-facing connection handle.
//!
//! [`PumpConnection`] spawns the dispatcher worker and talks to it through
//! channels. Submitting returns a [`PendingResponse`] future that resolves
//! exactly once; the current [`StatusSnapshot`], [`SessionState`] and
//! [`LinkStats`] are read from watch channels without touching the worker.
//!
//! ```rust
//! use pumplink::family::presets;
//! use pumplink::transport::virtual_pump::{Behavior, VirtualPump};
//! use pumplink::{Command, PumpConnection};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pumplink::Result<()> {
//! let (transport, _pump) = VirtualPump::new(presets::dana_r(), b"secret".to_vec())
//!     .on(0x020B, Behavior::Respond(vec![0x13, 0x88, 80]))
//!     .connect();
//! let connection = PumpConnection::open(presets::dana_r(), transport, b"secret".to_vec())?;
//!
//! let response = connection.submit(Command::query(0x020B)).await?;
//! assert_eq!(response.attempts, 1);
//! assert_eq!(connection.current_status().battery_percent, Some(80));
//! # Ok(())
//! # }
//! ```

use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, DispatcherSetup, LinkStats, Request};
use crate::family::FamilyDescriptor;
use crate::history::HistorySink;
use crate::stream::CoalesceExt;
use crate::transport::Transport;
use crate::types::{Command, CommandId, Response, SessionState, StatusSnapshot};
use crate::{PumpError, Result};

/// Cloneable handle for submitting commands to a connection's worker.
#[derive(Clone)]
pub struct CommandSender {
    requests: mpsc::UnboundedSender<Request>,
    next_id: Arc<AtomicU64>,
}

impl CommandSender {
    /// Queue a command. The returned future resolves with its final outcome.
    pub fn submit(&self, command: Command) -> PendingResponse {
        let id = CommandId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply, rx) = oneshot::channel();
        // a stopped worker drops `reply`, which resolves the future with EngineStopped
        let _ = self.requests.send(Request::Submit { id, command, reply });
        PendingResponse { id, rx, requests: self.requests.clone() }
    }

    /// Cancel a command by id.
    ///
    /// Queued commands are removed without I/O. A command already on the
    /// wire resolves `Cancelled` immediately, but its late answer is still
    /// awaited and discarded before the next command is sent.
    pub fn cancel(&self, id: CommandId) {
        let _ = self.requests.send(Request::Cancel(id));
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

impl std::fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSender").field("closed", &self.is_closed()).finish()
    }
}

/// Outcome of a submitted command.
///
/// Dropping it before completion abandons the command: a queued command is
/// skipped, an in-flight one is treated as cancelled.
#[must_use = "a dropped PendingResponse abandons its command"]
pub struct PendingResponse {
    id: CommandId,
    rx: oneshot::Receiver<Result<Response>>,
    requests: mpsc::UnboundedSender<Request>,
}

impl PendingResponse {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn cancel(&self) {
        let _ = self.requests.send(Request::Cancel(self.id));
    }
}

impl Future for PendingResponse {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(PumpError::EngineStopped)))
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse").field("id", &self.id).finish()
    }
}

/// Builder for [`PumpConnection`].
pub struct PumpConnectionBuilder {
    family: FamilyDescriptor,
    config: EngineConfig,
    pairing_secret: Vec<u8>,
    history: Option<Box<dyn HistorySink>>,
}

impl PumpConnectionBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pairing_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.pairing_secret = secret.into();
        self
    }

    /// Receive every assembled multi-frame response.
    pub fn history_sink(mut self, sink: impl HistorySink) -> Self {
        self.history = Some(Box::new(sink));
        self
    }

    /// Validate the configuration and start the worker on the current Tokio runtime.
    pub fn open(self, transport: impl Transport) -> Result<PumpConnection> {
        self.family.validate()?;
        self.config.validate()?;

        let family = Arc::new(self.family);
        info!("Opening {} pump connection", family.name);
        let channels = Dispatcher::spawn(DispatcherSetup {
            family: family.clone(),
            config: self.config.clone(),
            pairing_secret: self.pairing_secret,
            transport: Box::new(transport),
            history: self.history,
        });

        Ok(PumpConnection {
            commands: CommandSender { requests: channels.requests, next_id: Arc::new(AtomicU64::new(1)) },
            status: channels.status,
            state: channels.state,
            stats: channels.stats,
            family,
            config: self.config,
            cancel: channels.cancel,
        })
    }
}

/// Command/response engine for one physical pump link.
///
/// Dropping the connection stops its worker; anything still pending
/// resolves with [`PumpError::EngineStopped`].
pub struct PumpConnection {
    commands: CommandSender,
    status: watch::Receiver<Arc<StatusSnapshot>>,
    state: watch::Receiver<SessionState>,
    stats: watch::Receiver<LinkStats>,
    family: Arc<FamilyDescriptor>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl PumpConnection {
    pub fn builder(family: FamilyDescriptor) -> PumpConnectionBuilder {
        PumpConnectionBuilder { family, config: EngineConfig::default(), pairing_secret: Vec::new(), history: None }
    }

    /// Open with the default [`EngineConfig`].
    pub fn open(
        family: FamilyDescriptor,
        transport: impl Transport,
        pairing_secret: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        Self::builder(family).pairing_secret(pairing_secret).open(transport)
    }

    /// Queue a command; see [`CommandSender::submit`].
    ///
    /// The first submission on a fresh connection starts the handshake.
    pub fn submit(&self, command: Command) -> PendingResponse {
        self.commands.submit(command)
    }

    pub fn cancel(&self, id: CommandId) {
        self.commands.cancel(id);
    }

    /// A cloneable submission handle that does not keep the worker alive.
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    /// Most recent fully decoded pump state.
    pub fn current_status(&self) -> Arc<StatusSnapshot> {
        self.status.borrow().clone()
    }

    /// Status snapshots as they are published, starting with the current one.
    ///
    /// With `min_interval` set, bursts are coalesced to at most one snapshot
    /// per interval, always the latest.
    pub fn status_updates(
        &self,
        min_interval: Option<Duration>,
    ) -> impl Stream<Item = Arc<StatusSnapshot>> + 'static {
        let updates = WatchStream::new(self.status.clone());
        match min_interval {
            Some(interval) => updates.coalesce(interval).boxed(),
            None => updates.boxed(),
        }
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Session state transitions, starting with the current state.
    pub fn session_updates(&self) -> impl Stream<Item = SessionState> + 'static {
        WatchStream::new(self.state.clone())
    }

    pub fn stats(&self) -> LinkStats {
        *self.stats.borrow()
    }

    /// Return the session to `Unpaired` on the same transport.
    ///
    /// Queued commands survive and trigger a new handshake; an in-flight
    /// command resolves `Cancelled`.
    pub fn reset_session(&self) {
        let _ = self.commands.requests.send(Request::ResetSession);
    }

    /// Replace the transport after a disconnect and start over `Unpaired`.
    pub fn reconnect(&self, transport: impl Transport) {
        let _ = self.commands.requests.send(Request::Reconnect(Box::new(transport)));
    }

    pub fn family(&self) -> &FamilyDescriptor {
        &self.family
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token cancelled when this connection is dropped.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

impl Drop for PumpConnection {
    fn drop(&mut self) {
        debug!("Dropping {} pump connection", self.family.name);
        self.cancel.cancel();
    }
}
