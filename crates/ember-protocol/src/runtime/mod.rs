/// Tokio driver for a [`Node`].
///
/// The runtime task owns the node, iterates it on its own schedule and
/// forwards events over a channel. The application talks to it through a
/// cloneable [`RuntimeHandle`]; every call runs between two iterations, so
/// the single-threaded core never sees concurrent access.
mod r#loop;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::arena::FriendId;
use crate::error::RuntimeError;
use crate::events::Event;
use crate::node::Node;
use crate::types::{ConnectionStatus, MessageKind, PublicKey};
use ember_transport::Address;

// ── Configuration ─────────────────────────────────────────────────────

pub struct RuntimeConfig {
    /// Upper bound on the delay between iterations. The node may ask for
    /// shorter ones while transfers run.
    pub tick_interval: Duration,
    /// Pending commands before `RuntimeHandle` calls wait.
    pub command_buffer: usize,
    /// Undelivered events before the loop waits for the application.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

pub type NodeCall = Box<dyn FnOnce(&mut Node) + Send>;

pub enum RuntimeCommand {
    /// Run a closure against the node between iterations.
    Call(NodeCall),
    /// Stop the loop. The reply carries the serialized node state.
    Shutdown { reply: oneshot::Sender<Vec<u8>> },
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    public_key: PublicKey,
}

impl RuntimeHandle {
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Run `f` on the node and return its result.
    pub async fn call<R, F>(&self, f: F) -> Result<R, RuntimeError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Node) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let call: NodeCall = Box::new(move |node| {
            let _ = tx.send(f(node));
        });
        self.cmd_tx
            .send(RuntimeCommand::Call(call))
            .await
            .map_err(|_| RuntimeError::Shutdown)?;
        rx.await.map_err(|_| RuntimeError::Shutdown)
    }

    pub async fn add_friend(&self, public_key: PublicKey) -> Result<FriendId, RuntimeError> {
        Ok(self.call(move |node| node.add_friend(public_key)).await??)
    }

    pub async fn add_friend_by_address(
        &self,
        address: Address,
        message: String,
    ) -> Result<FriendId, RuntimeError> {
        Ok(self
            .call(move |node| node.add_friend_by_address(&address, &message))
            .await??)
    }

    /// Returns the message id.
    pub async fn send_message(
        &self,
        friend: FriendId,
        kind: MessageKind,
        text: String,
    ) -> Result<u32, RuntimeError> {
        Ok(self
            .call(move |node| node.send_message(friend, kind, &text))
            .await??)
    }

    pub async fn connection_status(&self, friend: FriendId) -> Result<ConnectionStatus, RuntimeError> {
        Ok(self
            .call(move |node| node.friend_connection_status(friend))
            .await??)
    }

    /// Stop the runtime and return the node's serialized state.
    pub async fn shutdown(&self) -> Result<Vec<u8>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::Shutdown { reply: tx })
            .await
            .map_err(|_| RuntimeError::Shutdown)?;
        rx.await.map_err(|_| RuntimeError::Shutdown)
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

pub struct RuntimeChannels {
    pub handle: RuntimeHandle,
    /// Every event the node reports, in order.
    pub events: mpsc::Receiver<Event>,
}

// ── NodeRuntime ──────────────────────────────────────────────────────

pub struct NodeRuntime;

impl NodeRuntime {
    /// Move `node` into a tokio task and start iterating it.
    ///
    /// Must be called from within a tokio runtime. The task ends on
    /// [`RuntimeHandle::shutdown`] or when every handle is dropped.
    pub fn spawn(node: Node, config: RuntimeConfig) -> RuntimeChannels {
        let public_key = node.public_key();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        tokio::spawn(r#loop::runtime_loop(node, config, cmd_rx, event_tx));

        RuntimeChannels {
            handle: RuntimeHandle { cmd_tx, public_key },
            events: event_rx,
        }
    }
}
