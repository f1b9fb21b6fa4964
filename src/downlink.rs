//! Downlink worker: classifies inbound transport traffic and routes it.
//!
//! Audio goes straight to the playback buffer, text accumulates into the
//! current turn, interruptions flush playback immediately, and every
//! transport-level condition is escalated to the orchestrator untouched.

use crate::events::InboundEvent;
use crate::playback::PlaybackHandle;
use crate::session::WorkerEvent;
use crate::transport::{TransportError, TransportRx};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub(crate) async fn run_downlink<R: TransportRx>(
    mut rx: R,
    playback: PlaybackHandle,
    events: mpsc::Sender<WorkerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("downlink worker started");
    let mut turn = String::new();
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = rx.receive() => received,
        };
        match received {
            Ok(InboundEvent::AudioChunk(pcm)) => playback.enqueue(pcm).await,
            Ok(InboundEvent::TextChunk(delta)) => {
                turn.push_str(&delta);
                let _ = events.send(WorkerEvent::TextDelta(delta)).await;
            }
            Ok(InboundEvent::TurnComplete) => {
                let text = std::mem::take(&mut turn);
                let _ = events.send(WorkerEvent::ModelTurn(text)).await;
            }
            Ok(InboundEvent::Interrupted) => {
                // stale assistant audio must not play over the user
                playback.flush();
                let _ = events.send(WorkerEvent::Interrupted).await;
            }
            Ok(InboundEvent::ToolCall(call)) => {
                debug!("tool call from model");
                let _ = events.send(WorkerEvent::ToolCall(call)).await;
            }
            Ok(InboundEvent::ErrorNotice { kind, message }) => {
                let _ = events
                    .send(WorkerEvent::Notice(TransportError::new(kind, message)))
                    .await;
            }
            Err(e) => {
                info!("downlink receive failed: {e}");
                let _ = events.send(WorkerEvent::TransportDown(e)).await;
                return;
            }
        }
    }
    info!("downlink worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback;
    use crate::transport::fakes::fake_conn;
    use crate::transport::ErrorKind;
    use std::time::Duration;
    use tokio::time::sleep;

    fn pipeline() -> (PlaybackHandle, std::sync::Arc<crate::queue::BlockingQueue<Vec<u8>>>) {
        playback::new_pipeline(8, Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn audio_routes_to_playback_buffer() {
        let (handles, _tx, rx) = fake_conn();
        let (playback_handle, _buffer) = pipeline();
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_downlink(rx, playback_handle.clone(), events_tx, stop_rx));

        handles.push_event(Ok(InboundEvent::AudioChunk(vec![1, 2])));
        handles.push_event(Ok(InboundEvent::AudioChunk(vec![3, 4])));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(playback_handle.buffered(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn text_accumulates_until_turn_complete() {
        let (handles, _tx, rx) = fake_conn();
        let (playback_handle, _buffer) = pipeline();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_downlink(rx, playback_handle, events_tx, stop_rx));

        handles.push_event(Ok(InboundEvent::TextChunk("Hello, ".to_string())));
        handles.push_event(Ok(InboundEvent::TextChunk("world".to_string())));
        handles.push_event(Ok(InboundEvent::TurnComplete));

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            WorkerEvent::TextDelta(d) if d == "Hello, "
        ));
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            WorkerEvent::TextDelta(d) if d == "world"
        ));
        match events_rx.recv().await.unwrap() {
            WorkerEvent::ModelTurn(text) => assert_eq!(text, "Hello, world"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_flushes_buffered_playback() {
        let (handles, _tx, rx) = fake_conn();
        let (playback_handle, _buffer) = pipeline();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_downlink(rx, playback_handle.clone(), events_tx, stop_rx));

        for tag in 0..3u8 {
            handles.push_event(Ok(InboundEvent::AudioChunk(vec![tag])));
        }
        sleep(Duration::from_millis(10)).await;
        assert_eq!(playback_handle.buffered(), 3);

        handles.push_event(Ok(InboundEvent::Interrupted));
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            WorkerEvent::Interrupted
        ));
        assert_eq!(playback_handle.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_failure_becomes_disconnect_event() {
        let (handles, _tx, rx) = fake_conn();
        let (playback_handle, _buffer) = pipeline();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(run_downlink(rx, playback_handle, events_tx, stop_rx));

        handles.drop_inbound();
        match events_rx.recv().await.unwrap() {
            WorkerEvent::TransportDown(e) => assert_eq!(e.kind(), ErrorKind::Disconnected),
            other => panic!("unexpected event: {other:?}"),
        }
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn service_notices_are_forwarded_for_classification() {
        let (handles, _tx, rx) = fake_conn();
        let (playback_handle, _buffer) = pipeline();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_downlink(rx, playback_handle, events_tx, stop_rx));

        handles.push_event(Ok(InboundEvent::ErrorNotice {
            kind: ErrorKind::Quota,
            message: "limit reached".to_string(),
        }));
        match events_rx.recv().await.unwrap() {
            WorkerEvent::Notice(e) => assert_eq!(e.kind(), ErrorKind::Quota),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
