//! Playback pipeline: smooths inbound audio through a small look-ahead
//! buffer and feeds the speaker sink.

use crate::device::{self, MediaSink};
use crate::queue::BlockingQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handle shared by the downlink worker (enqueue) and the orchestrator
/// (flush on interrupt and teardown).
#[derive(Clone)]
pub struct PlaybackHandle {
    buffer: Arc<BlockingQueue<Vec<u8>>>,
}

impl PlaybackHandle {
    /// Enqueue a chunk; blocks while the buffer is full so the sink paces
    /// the downlink, with the buffer's deadline bounding the wait.
    pub async fn enqueue(&self, pcm: Vec<u8>) {
        self.buffer.push(pcm).await;
    }

    /// Discard everything buffered immediately. Idempotent.
    pub fn flush(&self) {
        let dropped = self.buffer.flush();
        if dropped > 0 {
            debug!(chunks = dropped, "discarded buffered playback audio");
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Create the playback buffer and its handle.
pub(crate) fn new_pipeline(
    capacity: usize,
    push_timeout: Duration,
) -> (PlaybackHandle, Arc<BlockingQueue<Vec<u8>>>) {
    let buffer = Arc::new(BlockingQueue::new(capacity, Some(push_timeout)));
    (
        PlaybackHandle {
            buffer: buffer.clone(),
        },
        buffer,
    )
}

/// Feed buffered chunks to the sink in arrival order. The sink's blocking
/// write is the pacing authority. A failed sink is logged once and further
/// chunks are discarded so the buffer cannot grow; playback device loss
/// never ends the session.
pub(crate) async fn run_playback(
    mut sink: Box<dyn MediaSink>,
    buffer: Arc<BlockingQueue<Vec<u8>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("playback task started");
    let mut sink_ok = true;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            chunk = buffer.pop() => chunk,
        };
        if !sink_ok {
            continue;
        }
        if let Err(e) = device::run_blocking(|| sink.play(&chunk)) {
            warn!("playback sink failed, discarding further audio: {e}");
            sink_ok = false;
        }
    }
    info!("playback task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, MediaSink};
    use std::sync::Mutex;
    use tokio::time::sleep;

    struct RecordingSink {
        played: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    impl MediaSink for RecordingSink {
        fn play(&mut self, pcm: &[u8]) -> Result<(), DeviceError> {
            if self.fail {
                return Err(DeviceError::Unavailable("speaker gone".into()));
            }
            self.played.lock().unwrap().push(pcm.to_vec());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn plays_chunks_in_arrival_order() {
        let (handle, buffer) = new_pipeline(8, Duration::from_millis(500));
        let played = Arc::new(Mutex::new(Vec::new()));
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_playback(
            Box::new(RecordingSink {
                played: played.clone(),
                fail: false,
            }),
            buffer,
            stop_rx,
        ));

        handle.enqueue(vec![1]).await;
        handle.enqueue(vec![2]).await;
        handle.enqueue(vec![3]).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(*played.lock().unwrap(), vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_discards_buffered_chunks_before_they_play() {
        let (handle, buffer) = new_pipeline(8, Duration::from_millis(500));

        // buffer fills while no playback task is consuming
        handle.enqueue(vec![1]).await;
        handle.enqueue(vec![2]).await;
        handle.enqueue(vec![3]).await;
        assert_eq!(handle.buffered(), 3);

        handle.flush();
        handle.flush();
        assert_eq!(handle.buffered(), 0);

        handle.enqueue(vec![4]).await;

        let played = Arc::new(Mutex::new(Vec::new()));
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_playback(
            Box::new(RecordingSink {
                played: played.clone(),
                fail: false,
            }),
            buffer,
            stop_rx,
        ));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(*played.lock().unwrap(), vec![vec![4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sink_discards_audio_without_ending_the_task() {
        let (handle, buffer) = new_pipeline(8, Duration::from_millis(500));
        let played = Arc::new(Mutex::new(Vec::new()));
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_playback(
            Box::new(RecordingSink {
                played: played.clone(),
                fail: true,
            }),
            buffer,
            stop_rx,
        ));

        handle.enqueue(vec![1]).await;
        handle.enqueue(vec![2]).await;
        sleep(Duration::from_millis(10)).await;

        assert!(played.lock().unwrap().is_empty());
        assert_eq!(handle.buffered(), 0);
    }
}
