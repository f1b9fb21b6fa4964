//! Uplink worker: drains outbound queues onto the transport in order.
//!
//! Text is dispatched before queued media whenever both are ready, so user
//! intent is never delayed behind media backpressure. Within one queue,
//! send order is arrival order.

use crate::events::{ControlSignal, OutboundMessage};
use crate::queue::{BlockingQueue, MediaQueue};
use crate::session::WorkerEvent;
use crate::transport::TransportTx;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Run until shutdown or a send failure. Failures are escalated to the
/// orchestrator and end this worker; the orchestrator owns all retry policy
/// and respawns the uplink on the next established connection.
pub(crate) async fn run_uplink<T: TransportTx>(
    mut tx: T,
    text: Arc<BlockingQueue<OutboundMessage>>,
    media: Arc<MediaQueue>,
    events: mpsc::Sender<WorkerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("uplink worker started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = text.ready() => {
                if let Some(msg) = text.try_pop() {
                    if !dispatch(&mut tx, msg, &events).await {
                        return;
                    }
                }
            }
            _ = media.ready() => {
                // drain any text that arrived while media was waking us
                while let Some(msg) = text.try_pop() {
                    if !dispatch(&mut tx, msg, &events).await {
                        return;
                    }
                }
                if let Some(msg) = media.try_pop() {
                    if !dispatch(&mut tx, msg, &events).await {
                        return;
                    }
                }
            }
        }
    }
    // graceful teardown: best-effort end-of-stream marker, then close
    let _ = tx
        .send(OutboundMessage::Control(ControlSignal::AudioStreamEnd))
        .await;
    tx.close().await;
    info!("uplink worker stopped");
}

async fn dispatch<T: TransportTx>(
    tx: &mut T,
    msg: OutboundMessage,
    events: &mpsc::Sender<WorkerEvent>,
) -> bool {
    match tx.send(msg).await {
        Ok(()) => true,
        Err(e) => {
            info!("uplink send failed: {e}");
            let _ = events.send(WorkerEvent::TransportDown(e)).await;
            false
        }
    }
}
