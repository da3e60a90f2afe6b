// ABOUTME: Deferred command units and the shared worker pool that executes them
// ABOUTME: Connection-affinity routing keeps per-connection replies in dispatch order

use crate::engine::{PreparedStatement, Session};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One deferred unit of database work: the session it runs against, the
/// statement handle when one exists (kept reachable for cancellation), and
/// the action that executes and writes the reply frame.
///
/// A command gets exactly one execution attempt; the action converts its
/// own failures into wire error frames.
pub struct PreparedCommand {
    session: Arc<dyn Session>,
    statement: Option<Arc<dyn PreparedStatement>>,
    action: Box<dyn FnOnce() + Send>,
}

impl PreparedCommand {
    pub fn new(
        session: Arc<dyn Session>,
        statement: Option<Arc<dyn PreparedStatement>>,
        action: Box<dyn FnOnce() + Send>,
    ) -> Self {
        PreparedCommand {
            session,
            statement,
            action,
        }
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Cancel the underlying statement and release its handle, if the
    /// command carries one. Used when a connection is torn down with work
    /// still queued: the action closure never runs, so an ad-hoc statement
    /// has no other owner left to close it.
    pub fn cancel(&self) {
        if let Some(stmt) = &self.statement {
            stmt.cancel();
            stmt.close();
        }
    }

    pub fn execute(self) {
        (self.action)();
    }
}

/// Per-connection FIFO of deferred commands.
#[derive(Default)]
pub struct CommandQueue {
    commands: Mutex<VecDeque<PreparedCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue::default()
    }

    pub fn push(&self, command: PreparedCommand) {
        self.commands.lock().unwrap().push_back(command);
    }

    pub fn len(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop and run the oldest queued command. Returns false when the queue
    /// was empty.
    pub fn execute_one(&self) -> bool {
        let command = self.commands.lock().unwrap().pop_front();
        match command {
            Some(command) => {
                command.execute();
                true
            }
            None => false,
        }
    }

    /// Cancel everything still queued without executing it.
    pub fn cancel_all(&self) {
        let mut commands = self.commands.lock().unwrap();
        for command in commands.iter() {
            command.cancel();
        }
        commands.clear();
    }
}

/// Shared pool of command handlers.
///
/// Each worker owns one token channel and runs on the blocking thread pool
/// (engine calls are synchronous and may touch disk). A connection posts
/// one token per queued command, always to the worker picked by its
/// affinity value, so commands of one connection execute one at a time and
/// strictly in dispatch order, without any cross-connection locking.
pub struct CommandHandlerPool {
    senders: Vec<mpsc::UnboundedSender<Arc<CommandQueue>>>,
}

impl CommandHandlerPool {
    /// Spawn `workers` handler loops (zero means the default count). Must
    /// be called from within a tokio runtime.
    pub fn start(workers: usize) -> Self {
        let workers = if workers == 0 {
            crate::config::DEFAULT_COMMAND_HANDLERS
        } else {
            workers
        };
        let mut senders = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<Arc<CommandQueue>>();
            tokio::task::spawn_blocking(move || {
                tracing::debug!(worker, "command handler started");
                while let Some(queue) = rx.blocking_recv() {
                    queue.execute_one();
                }
                tracing::debug!(worker, "command handler stopped");
            });
            senders.push(tx);
        }
        CommandHandlerPool { senders }
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Hand a connection's queue to its affine worker. One token per
    /// queued command.
    pub fn submit(&self, affinity: u64, queue: Arc<CommandQueue>) {
        let idx = (affinity % self.senders.len() as u64) as usize;
        if self.senders[idx].send(queue).is_err() {
            tracing::warn!(worker = idx, "command handler gone, dropping work");
        }
    }
}
