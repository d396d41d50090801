/// The runtime event loop.
///
/// A single task that owns the node and multiplexes application commands
/// with the iteration timer. The loop outlives the event receiver: a host
/// that only needs the handle may drop it, and events are then discarded.
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::events::Event;
use crate::node::Node;

use super::{RuntimeCommand, RuntimeConfig};

pub(super) async fn runtime_loop(
    mut node: Node,
    config: RuntimeConfig,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    event_tx: mpsc::Sender<Event>,
) {
    info!(public_key = %node.public_key().fmt_short(), "runtime started");
    let mut events: Vec<Event> = Vec::new();
    let mut next_tick = Instant::now();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RuntimeCommand::Call(call)) => call(&mut node),
                    Some(RuntimeCommand::Shutdown { reply }) => {
                        info!("runtime shutting down");
                        let _ = reply.send(node.serialize_state());
                        break;
                    }
                    None => {
                        debug!("all runtime handles dropped");
                        break;
                    }
                }
            }

            _ = tokio::time::sleep_until(next_tick) => {
                node.iterate(&mut events);
                next_tick = Instant::now() + node.iteration_interval().min(config.tick_interval);
                if !event_tx.is_closed() {
                    for event in events.drain(..) {
                        if event_tx.send(event).await.is_err() {
                            debug!("event receiver dropped, discarding events from now on");
                            break;
                        }
                    }
                }
                events.clear();
            }
        }
    }
}
