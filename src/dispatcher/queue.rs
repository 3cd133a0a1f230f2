//! FIFO of commands waiting for the wire

use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::Result;
use crate::types::{Command, CommandId, Response, RetryPolicy};

/// Dispatcher bookkeeping for one submitted command.
#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub id: CommandId,
    pub command: Command,
    pub policy: RetryPolicy,
    /// Transmissions so far.
    pub attempts: u32,
    /// Sequence numbers used by each transmission; answers to any of them count.
    pub sequences: Vec<u16>,
    /// Deadline of the current attempt, set while in flight.
    pub deadline: Option<Instant>,
    reply: Option<oneshot::Sender<Result<Response>>>,
}

impl PendingCommand {
    pub fn new(
        id: CommandId,
        command: Command,
        policy: RetryPolicy,
        reply: oneshot::Sender<Result<Response>>,
    ) -> Self {
        Self { id, command, policy, attempts: 0, sequences: Vec::new(), deadline: None, reply: Some(reply) }
    }

    /// The caller already got an outcome or stopped waiting for one.
    pub fn is_cancelled(&self) -> bool {
        self.reply.as_ref().is_none_or(|reply| reply.is_closed())
    }

    /// Deliver the outcome. Only the first call reaches the caller.
    pub fn notify(&mut self, result: Result<Response>) -> bool {
        match self.reply.take() {
            Some(reply) => reply.send(result).is_ok(),
            None => false,
        }
    }
}

/// Bounded FIFO of commands that have not been transmitted yet.
#[derive(Debug)]
pub(crate) struct CommandQueue {
    items: VecDeque<PendingCommand>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Append at the back, handing the command back when the queue is full.
    pub fn push(&mut self, pending: PendingCommand) -> std::result::Result<(), PendingCommand> {
        if self.items.len() >= self.capacity {
            return Err(pending);
        }
        self.items.push_back(pending);
        Ok(())
    }

    /// Next command whose caller is still waiting.
    pub fn pop_next(&mut self) -> Option<PendingCommand> {
        while let Some(pending) = self.items.pop_front() {
            if pending.is_cancelled() {
                debug!("Skipping {}: caller stopped waiting", pending.id);
                continue;
            }
            return Some(pending);
        }
        None
    }

    pub fn remove(&mut self, id: CommandId) -> Option<PendingCommand> {
        let index = self.items.iter().position(|pending| pending.id == id)?;
        self.items.remove(index)
    }

    pub fn drain(&mut self) -> Vec<PendingCommand> {
        self.items.drain(..).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
